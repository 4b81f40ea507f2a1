use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

use crate::common::NodeId;
use crate::map::WorldGraph;

/// Exact graph distances from every node to each tracked endpoint,
/// `h_scores[endpoint][from]`.
#[derive(Debug, Clone, Default)]
pub struct DistanceTable {
    h_scores: HashMap<NodeId, Vec<Option<usize>>>,
}

impl DistanceTable {
    pub fn build(graph: &WorldGraph, endpoints: impl IntoIterator<Item = NodeId>) -> Self {
        let mut table = DistanceTable::default();
        for endpoint in endpoints {
            table.insert_endpoint(graph, endpoint);
        }
        debug!(
            "precomputed distances to {} endpoints over {} nodes",
            table.h_scores.len(),
            graph.node_count()
        );
        table
    }

    pub fn insert_endpoint(&mut self, graph: &WorldGraph, endpoint: NodeId) {
        self.h_scores
            .entry(endpoint)
            .or_insert_with(|| distances_to(graph, endpoint));
    }

    pub fn contains(&self, endpoint: NodeId) -> bool {
        self.h_scores.contains_key(&endpoint)
    }

    pub fn len(&self) -> usize {
        self.h_scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.h_scores.is_empty()
    }

    /// `None` if `endpoint` is not tracked, `Some(None)` if `from` cannot
    /// reach it.
    pub fn get(&self, endpoint: NodeId, from: NodeId) -> Option<Option<usize>> {
        self.h_scores
            .get(&endpoint)
            .map(|distances| distances[from.index()])
    }
}

fn distances_to(graph: &WorldGraph, goal: NodeId) -> Vec<Option<usize>> {
    let mut distances = vec![None; graph.node_count()];
    let mut heap = BinaryHeap::new();

    distances[goal.index()] = Some(0);
    heap.push((Reverse(0), goal));

    while let Some((Reverse(cost), node)) = heap.pop() {
        if distances[node.index()].is_some_and(|best| cost > best) {
            continue;
        }

        for &neighbor in graph.neighbors(node) {
            let next_cost = cost + 1;
            if distances[neighbor.index()].is_none_or(|best| next_cost < best) {
                distances[neighbor.index()] = Some(next_cost);
                heap.push((Reverse(next_cost), neighbor));
            }
        }
    }

    distances
}
