mod rra;
mod table;

pub use rra::ReverseResumableAStar;
pub use table::DistanceTable;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::f64::consts::SQRT_2;

use crate::common::{NodeId, Position};
use crate::map::WorldGraph;
use crate::strategy::Algorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicKind {
    /// Always zero, the search degrades to Dijkstra.
    Dijkstra,
    Manhattan,
    Euclidean,
    /// Octile distance; never exceeds the 4-connected distance.
    Octile,
}

impl HeuristicKind {
    pub fn distance(self, from: Position, to: Position) -> f64 {
        let dx = from.x.abs_diff(to.x) as f64;
        let dy = from.y.abs_diff(to.y) as f64;
        match self {
            HeuristicKind::Dijkstra => 0.0,
            HeuristicKind::Manhattan => dx + dy,
            HeuristicKind::Euclidean => (dx * dx + dy * dy).sqrt(),
            HeuristicKind::Octile => dx.max(dy) + (SQRT_2 - 1.0) * dx.min(dy),
        }
    }
}

/// Distance oracle consulted by every pathfinder for f-scores.
#[derive(Debug, Clone)]
pub enum Heuristic {
    Static(HeuristicKind),
    /// Exact distances to a fixed endpoint set (Token Passing). Goals outside
    /// the set fall back to the static estimate.
    Precomputed {
        table: DistanceTable,
        fallback: HeuristicKind,
    },
    /// Exact distances computed lazily by one resumable backward search per goal.
    Resumable(ReverseResumableAStar),
}

impl Heuristic {
    pub fn for_algorithm(
        algorithm: Algorithm,
        kind: HeuristicKind,
        graph: &WorldGraph,
        endpoints: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        match algorithm {
            Algorithm::Cooperative => Heuristic::Static(kind),
            Algorithm::Windowed => Heuristic::Resumable(ReverseResumableAStar::new()),
            Algorithm::TokenPassing => Heuristic::Precomputed {
                table: DistanceTable::build(graph, endpoints),
                fallback: kind,
            },
        }
    }

    /// Estimated distance from `from` to `goal`; `None` when the goal is known
    /// to be unreachable.
    pub fn estimate(&mut self, graph: &WorldGraph, from: NodeId, goal: NodeId) -> Option<f64> {
        match self {
            Heuristic::Static(kind) => Some(kind.distance(graph.position(from), graph.position(goal))),
            Heuristic::Precomputed { table, fallback } => match table.get(goal, from) {
                Some(distance) => distance.map(|d| d as f64),
                None => Some(fallback.distance(graph.position(from), graph.position(goal))),
            },
            Heuristic::Resumable(searches) => searches
                .distance(graph, from, goal)
                .map(|d| d as f64),
        }
    }

    /// Adds a task endpoint to the precomputed set; other oracles ignore it.
    pub fn register_endpoint(&mut self, graph: &WorldGraph, endpoint: NodeId) {
        if let Heuristic::Precomputed { table, .. } = self {
            table.insert_endpoint(graph, endpoint);
        }
    }
}
