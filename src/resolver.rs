//! Last-mile arbitration of the single-step moves proposed for one tick.
//!
//! Reservations keep most plans apart, but waiting agents without a plan,
//! crashed agents forcing their way out and permissive searches can still
//! propose contested moves. The resolver turns any batch of proposals into
//! a collision-free set of moves.

use clap::ValueEnum;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument, trace, warn};

use crate::common::{AgentId, NodeId};
use crate::heuristic::Heuristic;
use crate::map::WorldGraph;
use crate::reservation::{priority_rank, ReservationTable};
use crate::strategy::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStyle {
    /// Resolve every detected conflict per pass by priority, with overwrite.
    Priority,
    /// Resolve one conflict per pass, then look again.
    Iterative,
    /// Stop every contender and let them all plan again.
    Replan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub agent: AgentId,
    pub from: NodeId,
    pub to: NodeId,
}

impl Move {
    pub fn new(agent: AgentId, from: NodeId, to: NodeId) -> Self {
        Move { agent, from, to }
    }

    pub fn is_wait(&self) -> bool {
        self.from == self.to
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Two agents swapping nodes across one edge.
    Edge {
        agents: (AgentId, AgentId),
        edge: (NodeId, NodeId),
    },
    /// Several agents ending the tick on the same node.
    Vertex { node: NodeId, agents: Vec<AgentId> },
}

impl Conflict {
    pub fn agents(&self) -> Vec<AgentId> {
        match self {
            Conflict::Edge { agents, .. } => vec![agents.0, agents.1],
            Conflict::Vertex { agents, .. } => agents.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Final move of every submitting agent, by agent id.
    pub committed: Vec<Move>,
    /// Agents whose plan no longer holds and must be searched again.
    pub replan: BTreeSet<AgentId>,
    pub crashed: BTreeSet<AgentId>,
    /// The pass limit was hit and the remaining contenders were frozen.
    pub unresolved: bool,
    pub edge_conflicts: usize,
    pub vertex_conflicts: usize,
    pub passes: usize,
}

pub struct ResolverContext<'a> {
    pub graph: &'a WorldGraph,
    pub table: &'a mut ReservationTable,
    pub strategy: &'a dyn Strategy,
}

/// Collects the proposals of a tick, edge conflicts before vertex conflicts.
pub fn detect_conflicts(moves: &BTreeMap<AgentId, Move>) -> Vec<Conflict> {
    let mut edges: BTreeMap<(NodeId, NodeId), Vec<AgentId>> = BTreeMap::new();
    let mut vertices: BTreeMap<NodeId, Vec<AgentId>> = BTreeMap::new();
    for step in moves.values() {
        vertices.entry(step.to).or_default().push(step.agent);
        if !step.is_wait() {
            let edge = (step.from.min(step.to), step.from.max(step.to));
            edges.entry(edge).or_default().push(step.agent);
        }
    }

    let edge_conflicts = edges
        .into_iter()
        .filter(|(_, agents)| agents.len() >= 2)
        .map(|(edge, agents)| Conflict::Edge {
            agents: (agents[0], agents[1]),
            edge,
        });
    let vertex_conflicts = vertices
        .into_iter()
        .filter(|(_, agents)| agents.len() >= 2)
        .map(|(node, agents)| Conflict::Vertex { node, agents });
    edge_conflicts.chain(vertex_conflicts).collect()
}

// Lower rank wins; unranked agents fall back to id order.
fn outranks(ranking: &[AgentId], agent: AgentId, other: AgentId) -> bool {
    (priority_rank(ranking, agent), agent) < (priority_rank(ranking, other), other)
}

fn swap_priority(priority: &mut Vec<AgentId>, agent: AgentId, above: AgentId) {
    let Some(target) = priority.iter().position(|candidate| *candidate == above) else {
        return;
    };
    match priority.iter().position(|candidate| *candidate == agent) {
        Some(current) if current > target => priority.swap(current, target),
        Some(_) => {}
        None => priority.insert(target, agent),
    }
}

// No other proposal ends on `candidate` or swaps with `agent` across it.
fn claimable(moves: &BTreeMap<AgentId, Move>, agent: AgentId, from: NodeId, candidate: NodeId) -> bool {
    moves.values().all(|other| {
        other.agent == agent
            || (other.to != candidate && !(other.from == candidate && other.to == from))
    })
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    style: ResolutionStyle,
    proposals: BTreeMap<AgentId, Move>,
    crashed: BTreeSet<AgentId>,
}

impl ConflictResolver {
    pub fn new(style: ResolutionStyle) -> Self {
        ConflictResolver {
            style,
            proposals: BTreeMap::new(),
            crashed: BTreeSet::new(),
        }
    }

    pub fn style(&self) -> ResolutionStyle {
        self.style
    }

    /// Waits are submitted too: a stationary agent still holds its node.
    pub fn submit_move(&mut self, agent: AgentId, from: NodeId, to: NodeId) {
        if self
            .proposals
            .insert(agent, Move::new(agent, from, to))
            .is_some()
        {
            warn!("agent {agent} proposed twice this tick, keeping the latest move");
        }
    }

    pub fn is_crashed(&self, agent: AgentId) -> bool {
        self.crashed.contains(&agent)
    }

    pub fn crashed(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.crashed.iter().copied()
    }

    /// Crashed agents get the first pick on the next tick.
    pub fn promote_crashed(&self, priority: &mut Vec<AgentId>) {
        for agent in self.crashed.iter().rev() {
            priority.retain(|candidate| candidate != agent);
            priority.insert(0, *agent);
        }
    }

    /// Neighbor of `from` closest to `goal`: the move a crashed agent forces.
    pub fn forced_move(
        graph: &WorldGraph,
        heuristic: &mut Heuristic,
        from: NodeId,
        goal: Option<NodeId>,
    ) -> NodeId {
        let neighbors = graph.neighbors(from);
        let Some(goal) = goal else {
            return neighbors.first().copied().unwrap_or(from);
        };
        neighbors
            .iter()
            .copied()
            .map(|neighbor| {
                let distance = heuristic
                    .estimate(graph, neighbor, goal)
                    .unwrap_or(f64::INFINITY);
                (OrderedFloat(distance), neighbor)
            })
            .min()
            .map_or(from, |(_, neighbor)| neighbor)
    }

    /// Turns the submitted proposals into a collision-free move set.
    /// `priority` is read as of the start of the call; displaced agents are
    /// swapped above their displacer for the next tick.
    #[instrument(skip_all, name = "resolve", fields(style = ?self.style, moves = self.proposals.len()), level = "debug")]
    pub fn resolve(
        &mut self,
        priority: &mut Vec<AgentId>,
        ctx: &mut ResolverContext<'_>,
    ) -> Resolution {
        let mut moves = std::mem::take(&mut self.proposals);
        let ranking = priority.clone();
        let mut resolution = Resolution::default();
        let limit = moves.len().max(1);

        while resolution.passes < limit {
            let conflicts = detect_conflicts(&moves);
            if conflicts.is_empty() {
                break;
            }
            resolution.passes += 1;
            trace!("pass {}: {conflicts:?}", resolution.passes);

            let batch = match self.style {
                ResolutionStyle::Iterative => &conflicts[..1],
                ResolutionStyle::Priority | ResolutionStyle::Replan => &conflicts[..],
            };
            for conflict in batch {
                match conflict {
                    Conflict::Edge { agents, .. } => self.resolve_edge(
                        *agents,
                        &mut moves,
                        &ranking,
                        &mut resolution,
                        ctx,
                    ),
                    Conflict::Vertex { node, .. } => self.resolve_vertex(
                        *node,
                        &mut moves,
                        &ranking,
                        priority,
                        &mut resolution,
                        ctx,
                    ),
                }
            }
        }

        let mut remaining = detect_conflicts(&moves);
        if !remaining.is_empty() {
            warn!(
                "{} conflicts left after {} passes, freezing contenders",
                remaining.len(),
                resolution.passes
            );
            resolution.unresolved = true;
            // Every round stops at least one mover; stationary agents never
            // share a node, so this runs out.
            while !remaining.is_empty() {
                for agent in remaining.iter().flat_map(Conflict::agents) {
                    if let Some(step) = moves.get_mut(&agent) {
                        if !step.is_wait() {
                            step.to = step.from;
                            resolution.replan.insert(agent);
                        }
                    }
                }
                remaining = detect_conflicts(&moves);
            }
        }

        self.crashed = resolution.crashed.clone();
        resolution.committed = moves.into_values().collect();
        debug!(
            "resolved {} edge and {} vertex conflicts in {} passes",
            resolution.edge_conflicts, resolution.vertex_conflicts, resolution.passes
        );
        resolution
    }

    fn resolve_edge(
        &self,
        (first, second): (AgentId, AgentId),
        moves: &mut BTreeMap<AgentId, Move>,
        ranking: &[AgentId],
        resolution: &mut Resolution,
        ctx: &mut ResolverContext<'_>,
    ) {
        let (Some(a), Some(b)) = (moves.get(&first).copied(), moves.get(&second).copied()) else {
            return;
        };
        // An earlier fix in this pass may have settled it already.
        if a.from != b.to || a.to != b.from || a.is_wait() {
            return;
        }
        resolution.edge_conflicts += 1;

        if self.style == ResolutionStyle::Replan {
            for step in [a, b] {
                moves.insert(step.agent, Move::new(step.agent, step.from, step.from));
                resolution.replan.insert(step.agent);
            }
            return;
        }

        let loser = if outranks(ranking, a.agent, b.agent) { b } else { a };
        resolution.replan.insert(loser.agent);
        let to = match Self::find_alternative(loser, moves, ranking, resolution, ctx) {
            Some(alternative) => {
                debug!("agent {} yields edge, moving to {alternative}", loser.agent);
                alternative
            }
            None => {
                warn!("agent {} has no legal move, crashed", loser.agent);
                resolution.crashed.insert(loser.agent);
                loser.from
            }
        };
        moves.insert(loser.agent, Move::new(loser.agent, loser.from, to));
    }

    fn resolve_vertex(
        &self,
        node: NodeId,
        moves: &mut BTreeMap<AgentId, Move>,
        ranking: &[AgentId],
        priority: &mut Vec<AgentId>,
        resolution: &mut Resolution,
        ctx: &mut ResolverContext<'_>,
    ) {
        let claimants: Vec<Move> = moves.values().filter(|step| step.to == node).copied().collect();
        if claimants.len() < 2 {
            return;
        }
        resolution.vertex_conflicts += 1;

        let occupant = claimants.iter().find(|step| step.is_wait()).copied();
        let mut movers: Vec<Move> = claimants.into_iter().filter(|step| !step.is_wait()).collect();
        movers.sort_by_key(|step| (priority_rank(ranking, step.agent), step.agent));

        if self.style == ResolutionStyle::Replan {
            for step in &movers {
                moves.insert(step.agent, Move::new(step.agent, step.from, step.from));
                resolution.replan.insert(step.agent);
            }
            if let Some(occupant) = occupant {
                resolution.replan.insert(occupant.agent);
            }
            return;
        }

        let Some(leader) = movers.first().copied() else {
            return;
        };
        let winner = match occupant {
            Some(occupant)
                if outranks(ranking, leader.agent, occupant.agent)
                    && !resolution.crashed.contains(&occupant.agent) =>
            {
                match Self::find_shove(occupant, moves, ctx) {
                    Some(target) => {
                        debug!(
                            "agent {} shoves idle agent {} to {target}",
                            leader.agent, occupant.agent
                        );
                        moves.insert(occupant.agent, Move::new(occupant.agent, node, target));
                        resolution.replan.insert(occupant.agent);
                        leader.agent
                    }
                    None => occupant.agent,
                }
            }
            Some(occupant) => occupant.agent,
            None => leader.agent,
        };

        for step in movers.iter().filter(|step| step.agent != winner) {
            moves.insert(step.agent, Move::new(step.agent, step.from, step.from));
            resolution.replan.insert(step.agent);
            swap_priority(priority, step.agent, winner);
            trace!("agent {} waits for {winner} at {node}", step.agent);
        }
    }

    // Staying put first, then the neighbors; free cells before overwritable
    // ones.
    fn find_alternative(
        step: Move,
        moves: &BTreeMap<AgentId, Move>,
        ranking: &[AgentId],
        resolution: &mut Resolution,
        ctx: &mut ResolverContext<'_>,
    ) -> Option<NodeId> {
        let candidates: Vec<NodeId> = std::iter::once(step.from)
            .chain(ctx.graph.neighbors(step.from).iter().copied())
            .filter(|candidate| *candidate != step.to)
            .filter(|candidate| claimable(moves, step.agent, step.from, *candidate))
            .collect();

        for &candidate in &candidates {
            if ctx
                .strategy
                .is_eligible(ctx.table, 1, candidate, step.from, step.agent, None)
            {
                return Some(candidate);
            }
        }

        for &candidate in &candidates {
            let verdict = ctx
                .strategy
                .may_overwrite(ctx.table, 1, candidate, step.from, step.agent, ranking);
            if verdict.allowed {
                // Whoever held the cell loses its plan.
                resolution
                    .replan
                    .extend(verdict.node_holder.into_iter().chain(verdict.edge_holder));
                return Some(candidate);
            }
        }
        None
    }

    fn find_shove(
        occupant: Move,
        moves: &BTreeMap<AgentId, Move>,
        ctx: &mut ResolverContext<'_>,
    ) -> Option<NodeId> {
        let graph = ctx.graph;
        graph.neighbors(occupant.from).iter().copied().find(|candidate| {
            claimable(moves, occupant.agent, occupant.from, *candidate)
                && ctx.strategy.is_eligible(
                    ctx.table,
                    1,
                    *candidate,
                    occupant.from,
                    occupant.agent,
                    None,
                )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Position;
    use crate::strategy::CooperativeAStar;

    const A: AgentId = AgentId(0);
    const B: AgentId = AgentId(1);
    const C: AgentId = AgentId(2);

    // Helper function to setup tracing
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("trace")
            .try_init();
    }

    fn line(length: i32) -> (WorldGraph, Vec<NodeId>) {
        let graph = WorldGraph::open_grid(length, 1);
        let nodes = (0..length)
            .map(|x| graph.lookup(Position::new(x, 0)).unwrap())
            .collect();
        (graph, nodes)
    }

    fn run(
        style: ResolutionStyle,
        graph: &WorldGraph,
        moves: &[(AgentId, NodeId, NodeId)],
        priority: &mut Vec<AgentId>,
    ) -> (Resolution, ConflictResolver) {
        let mut table = ReservationTable::build(graph);
        let mut resolver = ConflictResolver::new(style);
        for (agent, from, to) in moves {
            resolver.submit_move(*agent, *from, *to);
        }
        let mut ctx = ResolverContext {
            graph,
            table: &mut table,
            strategy: &CooperativeAStar,
        };
        let resolution = resolver.resolve(priority, &mut ctx);
        (resolution, resolver)
    }

    fn committed(resolution: &Resolution, agent: AgentId) -> Move {
        *resolution
            .committed
            .iter()
            .find(|step| step.agent == agent)
            .unwrap()
    }

    fn assert_collision_free(resolution: &Resolution) {
        let moves: BTreeMap<AgentId, Move> = resolution
            .committed
            .iter()
            .map(|step| (step.agent, *step))
            .collect();
        assert!(detect_conflicts(&moves).is_empty(), "{:?}", resolution.committed);
    }

    #[test]
    fn test_edge_conflict_loser_steps_aside() {
        init_tracing();
        let (graph, n) = line(3);
        let mut priority = vec![A, B];
        let (resolution, _) = run(
            ResolutionStyle::Priority,
            &graph,
            &[(A, n[0], n[1]), (B, n[1], n[0])],
            &mut priority,
        );

        assert_eq!(committed(&resolution, A), Move::new(A, n[0], n[1]));
        assert_eq!(committed(&resolution, B), Move::new(B, n[1], n[2]));
        assert_eq!(resolution.edge_conflicts, 1);
        assert!(resolution.replan.contains(&B));
        assert!(resolution.crashed.is_empty());
        assert_collision_free(&resolution);
    }

    #[test]
    fn test_cornered_agent_crashes_and_is_promoted() {
        let (graph, n) = line(2);
        let mut priority = vec![A, B];
        let (resolution, resolver) = run(
            ResolutionStyle::Priority,
            &graph,
            &[(A, n[0], n[1]), (B, n[1], n[0])],
            &mut priority,
        );

        assert!(committed(&resolution, A).is_wait());
        assert!(committed(&resolution, B).is_wait());
        assert!(resolver.is_crashed(B));
        assert_eq!(resolution.crashed, BTreeSet::from([B]));

        let mut next = vec![A, C, B];
        resolver.promote_crashed(&mut next);
        assert_eq!(next, vec![B, A, C]);
    }

    #[test]
    fn test_vertex_conflict_swaps_priority() {
        let graph = WorldGraph::from_ascii("@.@\n...\n@@@").unwrap();
        let at = |x, y| graph.lookup(Position::new(x, y)).unwrap();
        let centre = at(1, 1);
        let mut priority = vec![B, A, C];
        let (resolution, _) = run(
            ResolutionStyle::Priority,
            &graph,
            &[
                (A, at(0, 1), centre),
                (B, at(2, 1), centre),
                (C, at(1, 0), centre),
            ],
            &mut priority,
        );

        assert_eq!(committed(&resolution, B).to, centre);
        assert!(committed(&resolution, A).is_wait());
        assert!(committed(&resolution, C).is_wait());
        assert_eq!(resolution.vertex_conflicts, 1);
        // Both losers now rank above the winner.
        assert!(priority_rank(&priority, A) < priority_rank(&priority, B));
        assert!(priority_rank(&priority, C) < priority_rank(&priority, B));
        assert_collision_free(&resolution);
    }

    #[test]
    fn test_stationary_occupant_wins_or_gets_shoved() {
        let (graph, n) = line(3);

        // Lower-priority mover: the occupant keeps its node.
        let mut priority = vec![A, B];
        let (resolution, _) = run(
            ResolutionStyle::Priority,
            &graph,
            &[(A, n[1], n[1]), (B, n[0], n[1])],
            &mut priority,
        );
        assert!(committed(&resolution, A).is_wait());
        assert!(committed(&resolution, B).is_wait());
        assert_collision_free(&resolution);

        // Higher-priority mover pushes the occupant along.
        let mut priority = vec![B, A];
        let (resolution, _) = run(
            ResolutionStyle::Priority,
            &graph,
            &[(A, n[1], n[1]), (B, n[0], n[1])],
            &mut priority,
        );
        assert_eq!(committed(&resolution, B), Move::new(B, n[0], n[1]));
        assert_eq!(committed(&resolution, A), Move::new(A, n[1], n[2]));
        assert!(resolution.replan.contains(&A));
        assert_collision_free(&resolution);
    }

    #[test]
    fn test_replan_style_stops_every_contender() {
        let (graph, n) = line(3);
        let mut priority = vec![A, B];
        let (resolution, _) = run(
            ResolutionStyle::Replan,
            &graph,
            &[(A, n[0], n[1]), (B, n[2], n[1])],
            &mut priority,
        );

        assert!(committed(&resolution, A).is_wait());
        assert!(committed(&resolution, B).is_wait());
        assert_eq!(resolution.replan, BTreeSet::from([A, B]));
        assert_eq!(priority, vec![A, B]);
    }

    #[test]
    fn test_saturated_line_terminates_deterministically() {
        let (graph, n) = line(3);
        let proposals = [(A, n[0], n[1]), (B, n[1], n[2]), (C, n[2], n[1])];

        for style in [
            ResolutionStyle::Priority,
            ResolutionStyle::Iterative,
            ResolutionStyle::Replan,
        ] {
            let mut first_priority = vec![C, B, A];
            let mut second_priority = first_priority.clone();
            let (first, _) = run(style, &graph, &proposals, &mut first_priority);
            let (second, _) = run(style, &graph, &proposals, &mut second_priority);

            assert_eq!(first, second);
            assert_eq!(first_priority, second_priority);
            assert!(first.passes <= proposals.len());
            assert_eq!(first.committed.len(), proposals.len());
            assert_collision_free(&first);
        }
    }

    #[test]
    fn test_forced_move_heads_for_goal() {
        let graph = WorldGraph::open_grid(3, 3);
        let at = |x, y| graph.lookup(Position::new(x, y)).unwrap();
        let mut heuristic = Heuristic::Static(crate::heuristic::HeuristicKind::Manhattan);

        let forced =
            ConflictResolver::forced_move(&graph, &mut heuristic, at(1, 1), Some(at(2, 1)));
        assert_eq!(forced, at(2, 1));

        let corner = WorldGraph::open_grid(1, 1);
        let only = corner.lookup(Position::new(0, 0)).unwrap();
        assert_eq!(
            ConflictResolver::forced_move(&corner, &mut heuristic, only, Some(only)),
            only
        );
    }
}
