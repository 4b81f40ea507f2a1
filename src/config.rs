use anyhow::anyhow;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::heuristic::HeuristicKind;
use crate::pathfinder::{CollisionMode, PathfinderConfig};
use crate::resolver::ResolutionStyle;
use crate::strategy::{self, Algorithm};

#[derive(Parser, Debug, Default)]
#[command(
    name = "Warehouse MAPF",
    about = "Cooperative, windowed and token passing multi-agent pathfinding for warehouse fleets.",
    version = "0.1"
)]
pub struct Cli {
    #[arg(long, help = "Path to a YAML config file; flags override its values")]
    pub config: Option<String>,

    #[arg(long, help = "Path to the map file (.map or .json node list)")]
    pub map_path: Option<String>,

    #[arg(long, help = "Path to the YAML scenario file")]
    pub scenario_path: Option<String>,

    #[arg(long, help = "Path to the JSON stats output file")]
    pub output_path: Option<String>,

    #[arg(long, value_enum, help = "Planning algorithm")]
    pub algorithm: Option<Algorithm>,

    #[arg(long, value_enum, help = "Heuristic used by the searches")]
    pub heuristic: Option<HeuristicKind>,

    #[arg(long, help = "Weight on the heuristic, at least 1.0")]
    pub heuristic_coefficient: Option<f64>,

    #[arg(long, value_enum, help = "Whether searches respect reservations")]
    pub collision_mode: Option<CollisionMode>,

    #[arg(
        long,
        value_enum,
        help = "Conflict resolution style; defaults per algorithm"
    )]
    pub resolution: Option<ResolutionStyle>,

    #[arg(long, help = "Time window of the windowed algorithm")]
    pub window: Option<usize>,

    #[arg(long, help = "Deepest timestep a single search may reach")]
    pub max_search_depth: Option<usize>,

    #[arg(long, help = "Search expansions per agent and tick")]
    pub expansions_per_tick: Option<usize>,

    #[arg(long, help = "Number of ticks to simulate")]
    pub ticks: Option<usize>,

    #[arg(
        long,
        help = "Total number of agents; missing ones are placed randomly"
    )]
    pub num_agents: Option<usize>,

    #[arg(long, help = "Seed for the random number generator")]
    pub seed: Option<u64>,

    #[arg(long, help = "Allow idle agents to steal tasks (token passing)")]
    pub task_stealing: bool,

    #[arg(long, help = "Agents spend one extra timestep at the pickup")]
    pub handover_requires_step: bool,

    #[arg(long, help = "Send idle agents off task endpoints to rest nodes")]
    pub park_idle_agents: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub map_path: String,
    pub scenario_path: Option<String>,
    pub output_path: String,
    pub algorithm: Algorithm,
    pub heuristic: HeuristicKind,
    pub heuristic_coefficient: f64,
    pub collision_mode: CollisionMode,
    pub resolution: Option<ResolutionStyle>,
    pub window: usize,
    pub max_search_depth: usize,
    pub expansions_per_tick: usize,
    pub ticks: usize,
    pub num_agents: usize,
    pub seed: u64,
    pub task_stealing: bool,
    pub handover_requires_step: bool,
    pub park_idle_agents: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            map_path: "map_file/test/warehouse.map".to_string(),
            scenario_path: Some("scenario/warehouse.yaml".to_string()),
            output_path: "result/stats.json".to_string(),
            algorithm: Algorithm::Cooperative,
            heuristic: HeuristicKind::Manhattan,
            heuristic_coefficient: 1.0,
            collision_mode: CollisionMode::Respected,
            resolution: None,
            window: 8,
            max_search_depth: 256,
            expansions_per_tick: 2_000,
            ticks: 200,
            num_agents: 0,
            seed: 0,
            task_stealing: false,
            handover_requires_step: false,
            park_idle_agents: false,
        }
    }
}

impl Config {
    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn override_from_command_line(mut self, cli: &Cli) -> anyhow::Result<Self> {
        if let Some(map_path) = &cli.map_path {
            self.map_path = map_path.clone();
        }
        if let Some(scenario_path) = &cli.scenario_path {
            self.scenario_path = Some(scenario_path.clone());
        }
        if let Some(output_path) = &cli.output_path {
            self.output_path = output_path.clone();
        }
        if let Some(algorithm) = cli.algorithm {
            self.algorithm = algorithm;
        }
        if let Some(heuristic) = cli.heuristic {
            self.heuristic = heuristic;
        }
        if let Some(coefficient) = cli.heuristic_coefficient {
            self.heuristic_coefficient = coefficient;
        }
        if let Some(collision_mode) = cli.collision_mode {
            self.collision_mode = collision_mode;
        }
        if cli.resolution.is_some() {
            self.resolution = cli.resolution;
        }
        if let Some(window) = cli.window {
            self.window = window;
        }
        if let Some(depth) = cli.max_search_depth {
            self.max_search_depth = depth;
        }
        if let Some(expansions) = cli.expansions_per_tick {
            self.expansions_per_tick = expansions;
        }
        if let Some(ticks) = cli.ticks {
            self.ticks = ticks;
        }
        if let Some(num_agents) = cli.num_agents {
            self.num_agents = num_agents;
        }
        if let Some(seed) = cli.seed {
            self.seed = seed;
        }
        self.task_stealing |= cli.task_stealing;
        self.handover_requires_step |= cli.handover_requires_step;
        self.park_idle_agents |= cli.park_idle_agents;

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&mut self) -> anyhow::Result<()> {
        if !self.heuristic_coefficient.is_finite() {
            return Err(anyhow!(
                "Heuristic coefficient must be a finite number, got {}",
                self.heuristic_coefficient
            ));
        }
        if self.heuristic_coefficient < 1.0 {
            warn!(
                "Heuristic coefficient {} is below 1.0, using 1.0",
                self.heuristic_coefficient
            );
            self.heuristic_coefficient = 1.0;
        }
        if self.algorithm == Algorithm::Windowed && self.window == 0 {
            return Err(anyhow!("Window must be at least 1 for {}", self.algorithm));
        }
        if self.ticks == 0 {
            return Err(anyhow!("Ticks must be greater than 0"));
        }
        if self.max_search_depth == 0 {
            return Err(anyhow!("Max search depth must be greater than 0"));
        }
        if self.expansions_per_tick == 0 {
            return Err(anyhow!("Expansions per tick must be greater than 0"));
        }
        if self.task_stealing && self.algorithm != Algorithm::TokenPassing {
            warn!(
                "Task stealing only applies to {}, ignored for {}",
                Algorithm::TokenPassing,
                self.algorithm
            );
            self.task_stealing = false;
        }
        Ok(())
    }

    pub fn resolution(&self) -> ResolutionStyle {
        self.resolution.unwrap_or_else(|| {
            strategy::build(self.algorithm, self.window).default_resolution()
        })
    }

    pub fn pathfinder_config(&self) -> PathfinderConfig {
        PathfinderConfig {
            heuristic_coefficient: self.heuristic_coefficient,
            collision: self.collision_mode,
            max_depth: self.max_search_depth,
            handover_requires_step: self.handover_requires_step,
        }
    }
}
