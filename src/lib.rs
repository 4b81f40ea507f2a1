pub mod agent;
pub mod common;
pub mod config;
pub mod error;
pub mod heuristic;
pub mod map;
pub mod pathfinder;
pub mod render;
pub mod reservation;
pub mod resolver;
pub mod scenario;
pub mod scheduler;
pub mod stat;
pub mod strategy;
pub mod tasker;
