//! Capability sets that distinguish the three planning variants.
//!
//! The reservation table, the time-expanded search and the conflict resolver
//! are shared; a [`Strategy`] only decides which cells a search may enter,
//! which goals it may settle on, and whether a contested cell may be taken
//! from a lower-priority agent.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{AgentId, NodeId};
use crate::reservation::{Overwrite, ReservationTable};
use crate::resolver::ResolutionStyle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Cooperative A*.
    Cooperative,
    /// Windowed hierarchical cooperative A*.
    Windowed,
    /// Token Passing.
    TokenPassing,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Cooperative => "CA*",
            Algorithm::Windowed => "WHCA*",
            Algorithm::TokenPassing => "TP",
        };
        write!(f, "{name}")
    }
}

pub trait Strategy: fmt::Debug {
    fn algorithm(&self) -> Algorithm;

    /// May `agent` step `source -> target`, arriving at relative `depth`?
    fn is_eligible(
        &self,
        table: &mut ReservationTable,
        depth: usize,
        target: NodeId,
        source: NodeId,
        agent: AgentId,
        _ignored: Option<AgentId>,
    ) -> bool {
        table.evaluate_node_eligibility(depth, target, source, agent)
    }

    /// May `agent` settle on `goal` from relative `depth` on?
    fn accepts_goal(
        &self,
        _table: &mut ReservationTable,
        _depth: usize,
        _goal: NodeId,
        _agent: AgentId,
        _ignored: Option<AgentId>,
    ) -> bool {
        true
    }

    fn may_overwrite(
        &self,
        _table: &mut ReservationTable,
        _depth: usize,
        _target: NodeId,
        _source: NodeId,
        _agent: AgentId,
        _priority: &[AgentId],
    ) -> Overwrite {
        Overwrite::default()
    }

    /// Searches pickup and dropoff legs in one plan.
    fn two_phase(&self) -> bool {
        false
    }

    /// Time horizon after which a search settles for a partial plan.
    fn window(&self) -> Option<usize> {
        None
    }

    /// Idle agents hold a plan to their own node so their endpoint is claimed.
    fn rests_at_endpoints(&self) -> bool {
        false
    }

    fn default_resolution(&self) -> ResolutionStyle;
}

/// Plain mutual exclusion, with priority-based overwrite for the resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct CooperativeAStar;

impl Strategy for CooperativeAStar {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Cooperative
    }

    fn may_overwrite(
        &self,
        table: &mut ReservationTable,
        depth: usize,
        target: NodeId,
        source: NodeId,
        agent: AgentId,
        priority: &[AgentId],
    ) -> Overwrite {
        table.evaluate_node_overwritability(depth, target, source, agent, priority)
    }

    fn default_resolution(&self) -> ResolutionStyle {
        ResolutionStyle::Priority
    }
}

/// Cooperative A* limited to a moving window, guided by exact RRA* distances.
/// Table mechanics, overwrite included, are those of [`CooperativeAStar`].
#[derive(Debug, Clone, Copy)]
pub struct WindowedAStar {
    pub window: usize,
}

impl Strategy for WindowedAStar {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Windowed
    }

    fn may_overwrite(
        &self,
        table: &mut ReservationTable,
        depth: usize,
        target: NodeId,
        source: NodeId,
        agent: AgentId,
        priority: &[AgentId],
    ) -> Overwrite {
        CooperativeAStar.may_overwrite(table, depth, target, source, agent, priority)
    }

    fn window(&self) -> Option<usize> {
        Some(self.window)
    }

    fn default_resolution(&self) -> ResolutionStyle {
        ResolutionStyle::Iterative
    }
}

/// Agents rest indefinitely at the end of their plans: a declared endpoint
/// blocks its node for everyone else.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenPassing;

impl Strategy for TokenPassing {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenPassing
    }

    fn is_eligible(
        &self,
        table: &mut ReservationTable,
        depth: usize,
        target: NodeId,
        source: NodeId,
        agent: AgentId,
        ignored: Option<AgentId>,
    ) -> bool {
        table.evaluate_node_eligibility(depth, target, source, agent)
            && !table.is_resting_claimed(depth, target, agent, ignored)
    }

    fn accepts_goal(
        &self,
        table: &mut ReservationTable,
        depth: usize,
        goal: NodeId,
        agent: AgentId,
        ignored: Option<AgentId>,
    ) -> bool {
        table.evaluate_endpoint_eligibility(depth, goal, agent, ignored)
    }

    fn two_phase(&self) -> bool {
        true
    }

    fn rests_at_endpoints(&self) -> bool {
        true
    }

    fn default_resolution(&self) -> ResolutionStyle {
        ResolutionStyle::Priority
    }
}

pub fn build(algorithm: Algorithm, window: usize) -> Box<dyn Strategy> {
    match algorithm {
        Algorithm::Cooperative => Box::new(CooperativeAStar),
        Algorithm::Windowed => Box::new(WindowedAStar { window }),
        Algorithm::TokenPassing => Box::new(TokenPassing),
    }
}
