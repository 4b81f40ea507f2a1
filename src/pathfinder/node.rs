use ordered_float::OrderedFloat;
use std::cmp::Ordering;

use crate::common::NodeId;

/// A state of the time-expanded graph: `node` at relative `depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SearchState {
    pub(crate) node: NodeId,
    pub(crate) depth: usize,
}

impl SearchState {
    pub(crate) fn new(node: NodeId, depth: usize) -> Self {
        SearchState { node, depth }
    }

    pub(crate) fn wait(self) -> Self {
        SearchState::new(self.node, self.depth + 1)
    }
}

// Open List Entry
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenEntry {
    pub(crate) f_score: OrderedFloat<f64>,
    pub(crate) g_score: usize,
    // Insertion counter, FIFO among equal f-scores.
    pub(crate) sequence: u64,
    pub(crate) state: SearchState,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f_score
            .cmp(&other.f_score)
            // Sequences are unique, so two distinct entries never compare equal.
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.state.cmp(&other.state))
    }
}
