use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::trace;

use super::HeuristicKind;
use crate::common::{NodeId, Position};
use crate::map::WorldGraph;

/// Reverse Resumable A*: one backward search per goal, resumed whenever a
/// distance it has not settled yet is requested.
#[derive(Debug, Clone, Default)]
pub struct ReverseResumableAStar {
    searches: HashMap<NodeId, ReverseSearch>,
    expansions: usize,
}

impl ReverseResumableAStar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distance(&mut self, graph: &WorldGraph, from: NodeId, goal: NodeId) -> Option<usize> {
        let search = self
            .searches
            .entry(goal)
            .or_insert_with(|| ReverseSearch::new(goal, graph.position(from)));
        let (distance, expanded) = search.resume(graph, from);
        self.expansions += expanded;
        distance
    }

    /// Distances already settled toward `goal`, without resuming.
    pub fn cached(&self, from: NodeId, goal: NodeId) -> Option<usize> {
        self.searches
            .get(&goal)
            .and_then(|search| search.closed.get(&from).copied())
    }

    pub fn expansions(&self) -> usize {
        self.expansions
    }
}

#[derive(Debug, Clone)]
struct ReverseSearch {
    // Position the backward search is guided toward: the first requester.
    target: Position,
    open: BinaryHeap<Reverse<(usize, usize, NodeId)>>,
    g_score: HashMap<NodeId, usize>,
    closed: HashMap<NodeId, usize>,
}

impl ReverseSearch {
    fn new(goal: NodeId, target: Position) -> Self {
        let mut open = BinaryHeap::new();
        open.push(Reverse((0, 0, goal)));
        ReverseSearch {
            target,
            open,
            g_score: HashMap::from([(goal, 0)]),
            closed: HashMap::new(),
        }
    }

    // Manhattan guidance is consistent on unit grids, so every closed node
    // keeps its exact distance even after the search is resumed for a
    // different node.
    fn resume(&mut self, graph: &WorldGraph, node: NodeId) -> (Option<usize>, usize) {
        if let Some(&distance) = self.closed.get(&node) {
            return (Some(distance), 0);
        }

        let mut expanded = 0;
        while let Some(Reverse((_, g, current))) = self.open.pop() {
            if self.closed.contains_key(&current) {
                continue;
            }
            self.closed.insert(current, g);
            expanded += 1;

            for &neighbor in graph.neighbors(current) {
                if self.closed.contains_key(&neighbor) {
                    continue;
                }
                let tentative = g + 1;
                if tentative < *self.g_score.get(&neighbor).unwrap_or(&usize::MAX) {
                    self.g_score.insert(neighbor, tentative);
                    let h = HeuristicKind::Manhattan
                        .distance(graph.position(neighbor), self.target)
                        as usize;
                    self.open.push(Reverse((tentative + h, tentative, neighbor)));
                }
            }

            if current == node {
                trace!("resumed search settled {current} at {g} after {expanded} expansions");
                return (Some(g), expanded);
            }
        }

        (None, expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_reuses_settled_distances() {
        let graph = WorldGraph::open_grid(5, 5);
        let goal = graph.lookup(Position::new(4, 4)).unwrap();
        let far = graph.lookup(Position::new(0, 0)).unwrap();
        let near = graph.lookup(Position::new(3, 4)).unwrap();

        let mut rra = ReverseResumableAStar::new();
        assert_eq!(rra.distance(&graph, far, goal), Some(8));
        let after_first = rra.expansions();
        assert!(after_first > 0);

        // Settled on the way to the first request.
        assert_eq!(rra.cached(near, goal), Some(1));
        assert_eq!(rra.distance(&graph, near, goal), Some(1));
        assert_eq!(rra.expansions(), after_first);
    }

    #[test]
    fn test_resume_for_new_source_stays_exact() {
        let graph = WorldGraph::from_ascii(".....\n.@@@.\n.....").unwrap();
        let goal = graph.lookup(Position::new(2, 0)).unwrap();
        let first = graph.lookup(Position::new(0, 0)).unwrap();
        let second = graph.lookup(Position::new(2, 2)).unwrap();

        let mut rra = ReverseResumableAStar::new();
        assert_eq!(rra.distance(&graph, first, goal), Some(2));
        assert_eq!(rra.distance(&graph, second, goal), Some(6));
    }

    #[test]
    fn test_unreachable_node() {
        let graph = WorldGraph::from_ascii("..@.").unwrap();
        let goal = graph.lookup(Position::new(0, 0)).unwrap();
        let island = graph.lookup(Position::new(3, 0)).unwrap();

        let mut rra = ReverseResumableAStar::new();
        assert_eq!(rra.distance(&graph, island, goal), None);
        assert_eq!(rra.cached(island, goal), None);
    }
}
