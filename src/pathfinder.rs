//! Incremental time-expanded A* over `(node, depth)` states.
//!
//! Each agent owns one [`AgentPathfinder`]. The scheduler drives it with an
//! expansion budget per tick; once a goal state is popped the path is
//! committed to the shared [`ReservationTable`] and kept as the agent's plan.

mod node;

use clap::ValueEnum;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, error, instrument, trace};

use crate::common::{AgentId, NodeId, Path, Plan};
use crate::error::MapfResult;
use crate::heuristic::Heuristic;
use crate::map::WorldGraph;
use crate::reservation::ReservationTable;
use crate::strategy::Strategy;
use node::{OpenEntry, SearchState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CollisionMode {
    /// Expansions are pruned against the reservation table.
    Respected,
    /// Reservations are neither consulted nor written.
    Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathfinderConfig {
    pub heuristic_coefficient: f64,
    pub collision: CollisionMode,
    /// Deepest relative timestep a search may reach.
    pub max_depth: usize,
    /// Agents spend one extra timestep at the pickup node.
    pub handover_requires_step: bool,
}

impl Default for PathfinderConfig {
    fn default() -> Self {
        PathfinderConfig {
            heuristic_coefficient: 1.0,
            collision: CollisionMode::Respected,
            max_depth: 256,
            handover_requires_step: false,
        }
    }
}

impl PathfinderConfig {
    fn coefficient(&self) -> f64 {
        // Weighted A*; below 1 the estimate would only slow the search down.
        self.heuristic_coefficient.max(1.0)
    }

    fn respects_reservations(&self) -> bool {
        self.collision == CollisionMode::Respected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Budget spent or step taken, no answer yet.
    Pending,
    Found(Path),
    /// No path right now; the agent stays put and retries next tick.
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathfinderStatus {
    /// Goal set, search seeded on the next step.
    Idle,
    Searching,
    PlanComplete,
    /// Reset without a new goal.
    Invalid,
}

/// Everything a search borrows from the simulation for one call.
pub struct SearchContext<'a> {
    pub graph: &'a WorldGraph,
    pub table: &'a mut ReservationTable,
    pub heuristic: &'a mut Heuristic,
    pub strategy: &'a dyn Strategy,
}

#[derive(Debug, Clone)]
pub struct AgentPathfinder {
    agent: AgentId,
    source: NodeId,
    goal: NodeId,
    // Second goal of a two-phase (pickup then dropoff) search.
    dropoff: Option<NodeId>,
    // Agent whose endpoint claims this search may pass over.
    ignored: Option<AgentId>,
    config: PathfinderConfig,
    status: PathfinderStatus,

    // Absolute timestep of relative depth 0.
    anchor: Option<usize>,
    leg_goal: NodeId,
    leg_root: SearchState,
    stash: Option<Path>,
    open: BTreeSet<OpenEntry>,
    g_score: HashMap<SearchState, usize>,
    came_from: HashMap<SearchState, SearchState>,
    closed: HashSet<SearchState>,
    sequence: u64,
    expansions: usize,

    plan: Option<Plan>,
    pickup_step: Option<usize>,
}

impl AgentPathfinder {
    pub fn new(
        agent: AgentId,
        source: NodeId,
        goal: NodeId,
        config: PathfinderConfig,
        graph: &WorldGraph,
    ) -> MapfResult<Self> {
        graph.ensure(source)?;
        graph.ensure(goal)?;
        Ok(AgentPathfinder {
            agent,
            source,
            goal,
            dropoff: None,
            ignored: None,
            config,
            status: PathfinderStatus::Idle,
            anchor: None,
            leg_goal: goal,
            leg_root: SearchState::new(source, 0),
            stash: None,
            open: BTreeSet::new(),
            g_score: HashMap::new(),
            came_from: HashMap::new(),
            closed: HashSet::new(),
            sequence: 0,
            expansions: 0,
            plan: None,
            pickup_step: None,
        })
    }

    /// Makes this a two-phase search: `goal` is the pickup, `dropoff` the end.
    pub fn with_dropoff(mut self, graph: &WorldGraph, dropoff: NodeId) -> MapfResult<Self> {
        self.dropoff = Some(graph.ensure(dropoff)?);
        Ok(self)
    }

    pub fn set_ignored(&mut self, ignored: Option<AgentId>) {
        self.ignored = ignored;
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn goal(&self) -> NodeId {
        self.goal
    }

    pub fn dropoff(&self) -> Option<NodeId> {
        self.dropoff
    }

    /// Where the agent ends up once the whole plan is executed.
    pub fn final_goal(&self) -> NodeId {
        self.dropoff.unwrap_or(self.goal)
    }

    pub fn status(&self) -> PathfinderStatus {
        self.status
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Absolute timestep at which a two-phase plan completes its pickup.
    pub fn pickup_time(&self) -> Option<usize> {
        let plan = self.plan.as_ref()?;
        self.pickup_step.map(|step| plan.origin + step)
    }

    pub fn next_node(&self, time: usize) -> Option<NodeId> {
        self.plan.as_ref().and_then(|plan| plan.node_at(time))
    }

    /// Expansions since the last call.
    pub fn take_expansions(&mut self) -> usize {
        std::mem::take(&mut self.expansions)
    }

    /// Points the search at a new goal from `source`, dropping the old plan.
    pub fn retarget(
        &mut self,
        table: &mut ReservationTable,
        graph: &WorldGraph,
        source: NodeId,
        goal: NodeId,
        dropoff: Option<NodeId>,
    ) -> MapfResult<()> {
        graph.ensure(source)?;
        graph.ensure(goal)?;
        if let Some(dropoff) = dropoff {
            graph.ensure(dropoff)?;
        }

        self.reset(table);
        self.source = source;
        self.goal = goal;
        self.dropoff = dropoff;
        self.status = PathfinderStatus::Idle;
        Ok(())
    }

    /// Releases the unexecuted suffix of the plan and clears all search state.
    pub fn reset(&mut self, table: &mut ReservationTable) {
        if let Some(plan) = self.plan.take() {
            let offset = table.current_depth().saturating_sub(plan.origin);
            table.handle_path_release(&plan.nodes, self.agent, plan.origin, offset);
        }
        self.clear_search();
        self.anchor = None;
        self.pickup_step = None;
        self.status = PathfinderStatus::Invalid;
    }

    /// Re-commits the stored plan, e.g. after a rolled back negotiation
    /// released it.
    pub fn restore(&self, table: &mut ReservationTable) -> MapfResult<()> {
        match &self.plan {
            Some(plan) if self.config.respects_reservations() => {
                table.reserve_path_at(plan.origin, &plan.nodes, self.agent)
            }
            _ => Ok(()),
        }
    }

    #[instrument(skip_all, name = "plan", fields(agent = self.agent.0, goal = %self.goal), level = "debug")]
    pub fn plan(&mut self, ctx: &mut SearchContext<'_>, budget: usize) -> SearchOutcome {
        for _ in 0..budget.max(1) {
            match self.search_step(ctx) {
                SearchOutcome::Pending => {}
                outcome => return outcome,
            }
        }
        trace!("spent {budget} expansions without an answer");
        SearchOutcome::Pending
    }

    /// Performs one expansion.
    pub fn search_step(&mut self, ctx: &mut SearchContext<'_>) -> SearchOutcome {
        match self.status {
            PathfinderStatus::Invalid => return SearchOutcome::Waiting,
            PathfinderStatus::PlanComplete => {
                return match &self.plan {
                    Some(plan) => SearchOutcome::Found(plan.nodes.clone()),
                    None => SearchOutcome::Waiting,
                }
            }
            PathfinderStatus::Idle | PathfinderStatus::Searching => {}
        }

        // A search left pending keeps its tree: the agent has not moved, so
        // relative depths simply count from the new tick. Whatever it finds is
        // checked against the table again before being committed.
        let now = ctx.table.current_depth();
        if self.status == PathfinderStatus::Idle {
            self.seed(now);
        } else if let Some(anchor) = self.anchor.filter(|anchor| *anchor != now) {
            trace!(
                "agent {} carries its search from t={anchor} to t={now}",
                self.agent
            );
            self.anchor = Some(now);
        }

        let Some(entry) = self.open.pop_first() else {
            debug!(
                "agent {} exhausted its search toward {}, waiting",
                self.agent, self.leg_goal
            );
            self.status = PathfinderStatus::Idle;
            return SearchOutcome::Waiting;
        };
        let state = entry.state;
        if !self.closed.insert(state) {
            return SearchOutcome::Pending;
        }
        self.expansions += 1;
        trace!("expand {state:?} f={} g={}", entry.f_score, entry.g_score);

        // Notice: a goal match at depth 0 is the source itself, not an arrival.
        if state.node == self.leg_goal && state.depth != 0 {
            if let Some(outcome) = self.reach_goal(ctx, state) {
                return outcome;
            }
        } else if ctx
            .strategy
            .window()
            .is_some_and(|window| state.depth >= window)
        {
            let path = self.reconstruct(state);
            return self.complete(ctx, path, true);
        }

        self.expand(ctx, state, entry.g_score);
        SearchOutcome::Pending
    }

    fn seed(&mut self, now: usize) {
        self.clear_search();
        self.anchor = Some(now);
        self.pickup_step = None;
        self.leg_goal = self.goal;
        self.leg_root = SearchState::new(self.source, 0);
        self.g_score.insert(self.leg_root, 0);
        self.push(self.leg_root, 0.0, 0);
        self.status = PathfinderStatus::Searching;
        trace!(
            "agent {} seeded at {} (t={now}) toward {}",
            self.agent,
            self.source,
            self.goal
        );
    }

    fn clear_search(&mut self) {
        self.open.clear();
        self.closed.clear();
        self.g_score.clear();
        self.came_from.clear();
        self.stash = None;
    }

    fn push(&mut self, state: SearchState, f_score: f64, g_score: usize) {
        self.open.insert(OpenEntry {
            f_score: OrderedFloat(f_score),
            g_score,
            sequence: self.sequence,
            state,
        });
        self.sequence += 1;
    }

    fn on_final_leg(&self) -> bool {
        self.dropoff.is_none() || self.stash.is_some()
    }

    fn expand(&mut self, ctx: &mut SearchContext<'_>, state: SearchState, g_score: usize) {
        let next_depth = state.depth + 1;
        if next_depth > self.config.max_depth {
            return;
        }

        let graph = ctx.graph;
        let tentative = g_score + 1;
        let checks_goal = self.on_final_leg();
        // Waiting in place is a successor with the same unit cost as a move.
        for &successor in graph
            .neighbors(state.node)
            .iter()
            .chain(std::iter::once(&state.node))
        {
            let next = SearchState::new(successor, next_depth);
            if self.closed.contains(&next)
                || self
                    .g_score
                    .get(&next)
                    .is_some_and(|best| *best <= tentative)
            {
                continue;
            }

            if self.config.respects_reservations() {
                if !ctx.strategy.is_eligible(
                    ctx.table,
                    next_depth,
                    successor,
                    state.node,
                    self.agent,
                    self.ignored,
                ) {
                    continue;
                }
                if checks_goal
                    && successor == self.leg_goal
                    && !ctx.strategy.accepts_goal(
                        ctx.table,
                        next_depth,
                        successor,
                        self.agent,
                        self.ignored,
                    )
                {
                    continue;
                }
            }

            let Some(h_score) = ctx.heuristic.estimate(graph, successor, self.leg_goal) else {
                continue;
            };
            self.g_score.insert(next, tentative);
            self.came_from.insert(next, state);
            self.push(
                next,
                tentative as f64 + h_score * self.config.coefficient(),
                tentative,
            );
        }
    }

    // Returns None when the goal cannot be taken yet and the search goes on.
    fn reach_goal(
        &mut self,
        ctx: &mut SearchContext<'_>,
        state: SearchState,
    ) -> Option<SearchOutcome> {
        if self.on_final_leg() {
            let leg = self.reconstruct(state);
            let path = match self.stash.take() {
                Some(mut path) => {
                    // The junction node ends the stash and starts the leg.
                    path.extend(leg.into_iter().skip(1));
                    path
                }
                None => leg,
            };
            return Some(self.complete(ctx, path, false));
        }

        let dropoff = self.dropoff?;
        let mut junction = state;
        if self.config.handover_requires_step {
            let handover = state.wait();
            if self.config.respects_reservations()
                && !ctx.strategy.is_eligible(
                    ctx.table,
                    handover.depth,
                    state.node,
                    state.node,
                    self.agent,
                    self.ignored,
                )
            {
                trace!("handover at {} blocked at depth {}", state.node, handover.depth);
                return None;
            }
            self.came_from.insert(handover, state);
            junction = handover;
        }

        let leg = self.reconstruct(junction);
        debug!(
            "agent {} reaches pickup {} at depth {}, continuing toward {dropoff}",
            self.agent, state.node, junction.depth
        );

        self.open.clear();
        self.closed.clear();
        self.g_score.clear();
        self.came_from.clear();
        self.stash = Some(leg);
        self.pickup_step = Some(junction.depth);
        self.leg_goal = dropoff;
        self.leg_root = junction;
        self.g_score.insert(junction, 0);
        self.push(junction, 0.0, 0);
        Some(SearchOutcome::Pending)
    }

    // Re-runs the expansion checks over a finished path. Parts of the tree
    // may date from an earlier tick or from before other agents committed.
    fn still_eligible(&self, ctx: &mut SearchContext<'_>, path: &[NodeId], partial: bool) -> bool {
        if !self.config.respects_reservations() {
            return true;
        }
        let steps_ok = path.windows(2).enumerate().all(|(i, step)| {
            ctx.strategy
                .is_eligible(ctx.table, i + 1, step[1], step[0], self.agent, self.ignored)
        });
        if !steps_ok {
            return false;
        }
        match path.last() {
            Some(&last) if !partial && path.len() > 1 => ctx.strategy.accepts_goal(
                ctx.table,
                path.len() - 1,
                last,
                self.agent,
                self.ignored,
            ),
            _ => true,
        }
    }

    fn reconstruct(&self, state: SearchState) -> Path {
        let mut path = vec![state.node];
        let mut current = state;
        while current != self.leg_root {
            let Some(previous) = self.came_from.get(&current) else {
                break;
            };
            path.push(previous.node);
            current = *previous;
        }
        path.reverse();
        path
    }

    fn complete(&mut self, ctx: &mut SearchContext<'_>, path: Path, partial: bool) -> SearchOutcome {
        let origin = ctx.table.current_depth();
        if !self.still_eligible(ctx, &path, partial) {
            debug!(
                "agent {} found a path the table no longer allows, searching again",
                self.agent
            );
            self.seed(origin);
            return SearchOutcome::Pending;
        }
        if self.config.respects_reservations() {
            if let Err(err) = ctx.table.handle_path_plan_request(&path, self.agent) {
                error!("agent {} dropped its plan: {err}", self.agent);
                self.clear_search();
                self.status = PathfinderStatus::Idle;
                return SearchOutcome::Waiting;
            }
        }

        debug!(
            "agent {} planned {} steps from t={origin}{}",
            self.agent,
            path.len() - 1,
            if partial { " (partial)" } else { "" }
        );
        self.clear_search();
        self.plan = Some(Plan {
            origin,
            nodes: path.clone(),
            partial,
        });
        self.status = PathfinderStatus::PlanComplete;
        SearchOutcome::Found(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Position;
    use crate::error::MapfError;
    use crate::heuristic::HeuristicKind;
    use crate::strategy::{CooperativeAStar, TokenPassing, WindowedAStar};

    const A: AgentId = AgentId(0);
    const B: AgentId = AgentId(1);

    // Helper function to setup tracing
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("trace")
            .try_init();
    }

    fn at(graph: &WorldGraph, x: i32, y: i32) -> NodeId {
        graph.lookup(Position::new(x, y)).unwrap()
    }

    fn found(outcome: SearchOutcome) -> Path {
        match outcome {
            SearchOutcome::Found(path) => path,
            other => panic!("expected a path, got {other:?}"),
        }
    }

    fn assert_connected(graph: &WorldGraph, path: &[NodeId]) {
        for step in path.windows(2) {
            assert!(
                step[0] == step[1] || graph.are_adjacent(step[0], step[1]),
                "{} -> {} is not a move",
                step[0],
                step[1]
            );
        }
    }

    #[test]
    fn test_open_grid_path_matches_manhattan_distance() {
        init_tracing();
        let graph = WorldGraph::open_grid(5, 5);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        let start = at(&graph, 0, 0);
        let goal = at(&graph, 4, 4);

        let mut pathfinder =
            AgentPathfinder::new(A, start, goal, PathfinderConfig::default(), &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };
        let path = found(pathfinder.plan(&mut ctx, 10_000));

        assert_eq!(path.len() - 1, 8);
        assert_eq!(path.first(), Some(&start));
        assert_eq!(path.last(), Some(&goal));
        assert_connected(&graph, &path);
        assert_eq!(pathfinder.status(), PathfinderStatus::PlanComplete);
        // 9 nodes plus 8 traversed edges.
        assert_eq!(table.reserved_cells(A), 17);
    }

    #[test]
    fn test_head_on_line_never_shares_middle() {
        init_tracing();
        let graph = WorldGraph::open_grid(3, 1);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        let config = PathfinderConfig {
            max_depth: 6,
            ..Default::default()
        };
        let (left, middle, right) = (at(&graph, 0, 0), at(&graph, 1, 0), at(&graph, 2, 0));

        let mut first = AgentPathfinder::new(A, left, right, config, &graph).unwrap();
        let mut second = AgentPathfinder::new(B, right, left, config, &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };

        assert_eq!(found(first.plan(&mut ctx, 1_000)), vec![left, middle, right]);
        // No way past A on a line: B waits instead of failing.
        assert_eq!(second.plan(&mut ctx, 10_000), SearchOutcome::Waiting);
        assert_eq!(second.status(), PathfinderStatus::Idle);

        assert_eq!(table.node_holder(1, middle), Some(A));
        assert_eq!(table.reserved_cells(B), 0);
    }

    #[test]
    fn test_detour_around_reserved_cells() {
        let graph = WorldGraph::open_grid(3, 3);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        let (west, centre, east) = (at(&graph, 0, 1), at(&graph, 1, 1), at(&graph, 2, 1));

        let mut first =
            AgentPathfinder::new(A, west, east, PathfinderConfig::default(), &graph).unwrap();
        let mut second =
            AgentPathfinder::new(B, east, west, PathfinderConfig::default(), &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };
        let first_path = found(first.plan(&mut ctx, 1_000));
        let second_path = found(second.plan(&mut ctx, 1_000));

        assert_eq!(first_path, vec![west, centre, east]);
        assert_connected(&graph, &second_path);
        assert_eq!(second_path.last(), Some(&west));
        for time in 0..second_path.len().max(first_path.len()) {
            let a = first_path.get(time).or(first_path.last());
            let b = second_path.get(time).or(second_path.last());
            assert_ne!(a, b, "collision at t={time}");
        }
    }

    #[test]
    fn test_token_passing_pickup_on_the_way() {
        init_tracing();
        let graph = WorldGraph::open_grid(5, 1);
        let nodes: Vec<NodeId> = (0..5).map(|x| at(&graph, x, 0)).collect();
        let mut heuristic = Heuristic::for_algorithm(
            crate::strategy::Algorithm::TokenPassing,
            HeuristicKind::Manhattan,
            &graph,
            [nodes[2], nodes[4]],
        );

        let mut table = ReservationTable::build(&graph);
        let mut pathfinder =
            AgentPathfinder::new(A, nodes[0], nodes[2], PathfinderConfig::default(), &graph)
                .unwrap()
                .with_dropoff(&graph, nodes[4])
                .unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &TokenPassing,
        };
        let path = found(pathfinder.plan(&mut ctx, 1_000));
        // 2 steps to the pickup plus 2 to the dropoff.
        assert_eq!(path, nodes);
        assert_eq!(pathfinder.pickup_time(), Some(2));

        let config = PathfinderConfig {
            handover_requires_step: true,
            ..Default::default()
        };
        let mut table = ReservationTable::build(&graph);
        let mut pathfinder = AgentPathfinder::new(A, nodes[0], nodes[2], config, &graph)
            .unwrap()
            .with_dropoff(&graph, nodes[4])
            .unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &TokenPassing,
        };
        let path = found(pathfinder.plan(&mut ctx, 1_000));
        assert_eq!(
            path,
            vec![nodes[0], nodes[1], nodes[2], nodes[2], nodes[3], nodes[4]]
        );
        assert_eq!(pathfinder.pickup_time(), Some(3));
        assert_eq!(table.endpoint_of(A).map(|endpoint| endpoint.node), Some(nodes[4]));
    }

    #[test]
    fn test_token_passing_endpoint_exclusivity() {
        let graph = WorldGraph::open_grid(4, 1);
        let nodes: Vec<NodeId> = (0..4).map(|x| at(&graph, x, 0)).collect();
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        let config = PathfinderConfig {
            max_depth: 10,
            ..Default::default()
        };

        // A rests on n3 indefinitely.
        let mut resting = AgentPathfinder::new(A, nodes[3], nodes[3], config, &graph).unwrap();
        let mut seeker = AgentPathfinder::new(B, nodes[0], nodes[3], config, &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &TokenPassing,
        };
        assert_eq!(
            found(resting.plan(&mut ctx, 100)),
            vec![nodes[3], nodes[3]]
        );
        assert_eq!(seeker.plan(&mut ctx, 10_000), SearchOutcome::Waiting);

        resting.reset(ctx.table);
        let path = found(seeker.plan(&mut ctx, 10_000));
        assert_eq!(path.last(), Some(&nodes[3]));
    }

    #[test]
    fn test_windowed_search_returns_partial_plan() {
        let graph = WorldGraph::open_grid(10, 1);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::for_algorithm(
            crate::strategy::Algorithm::Windowed,
            HeuristicKind::Manhattan,
            &graph,
            [],
        );
        let strategy = WindowedAStar { window: 3 };
        let start = at(&graph, 0, 0);
        let goal = at(&graph, 9, 0);

        let mut pathfinder =
            AgentPathfinder::new(A, start, goal, PathfinderConfig::default(), &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &strategy,
        };
        let path = found(pathfinder.plan(&mut ctx, 1_000));

        assert_eq!(path, (0..4).map(|x| at(&graph, x, 0)).collect::<Vec<_>>());
        let plan = pathfinder.current_plan().unwrap();
        assert!(plan.partial);
        assert_eq!(plan.final_time(), 3);
    }

    #[test]
    fn test_pending_search_is_reanchored() {
        let graph = WorldGraph::open_grid(5, 5);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        let start = at(&graph, 0, 0);
        let goal = at(&graph, 4, 0);

        let mut pathfinder =
            AgentPathfinder::new(A, start, goal, PathfinderConfig::default(), &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };
        assert_eq!(pathfinder.plan(&mut ctx, 1), SearchOutcome::Pending);
        assert_eq!(pathfinder.status(), PathfinderStatus::Searching);

        ctx.table.update_simulation_depth(1);
        let path = found(pathfinder.plan(&mut ctx, 1_000));
        assert_eq!(path.len(), 5);
        assert_eq!(pathfinder.current_plan().map(|plan| plan.origin), Some(1));
        assert_eq!(table.node_holder(0, start), Some(A));
        assert_eq!(table.node_holder(4, goal), Some(A));
    }

    #[test]
    fn test_pending_search_keeps_its_progress() {
        init_tracing();
        let graph = WorldGraph::open_grid(5, 5);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        let start = at(&graph, 0, 0);
        let goal = at(&graph, 4, 4);

        let mut pathfinder =
            AgentPathfinder::new(A, start, goal, PathfinderConfig::default(), &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };

        // A handful of expansions per tick is far too few for one tick.
        let mut path = None;
        for tick in 0..20 {
            ctx.table.update_simulation_depth(tick);
            if let SearchOutcome::Found(found) = pathfinder.plan(&mut ctx, 4) {
                path = Some((tick, found));
                break;
            }
        }
        let (tick, path) = path.expect("search never finished");
        assert!(tick > 0);
        assert_eq!(path.len() - 1, 8);
        assert_eq!(path.first(), Some(&start));
        assert_eq!(pathfinder.current_plan().map(|plan| plan.origin), Some(tick));
        assert_eq!(table.node_holder(8, goal), Some(A));
    }

    #[test]
    fn test_stale_pending_search_starts_over() {
        init_tracing();
        let graph = WorldGraph::open_grid(3, 3);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        let (west, centre, east) = (at(&graph, 0, 1), at(&graph, 1, 1), at(&graph, 2, 1));

        let mut pathfinder =
            AgentPathfinder::new(A, west, east, PathfinderConfig::default(), &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };
        assert_eq!(pathfinder.plan(&mut ctx, 1), SearchOutcome::Pending);

        // B parks on the centre after A's tree already went through it.
        ctx.table.handle_path_plan_request(&[centre; 4], B).unwrap();
        let path = found(pathfinder.plan(&mut ctx, 1_000));

        assert_connected(&graph, &path);
        assert!(!path.contains(&centre));
        assert_eq!(path.len() - 1, 4);
        assert_eq!(path.last(), Some(&east));
        assert_eq!(table.node_holder(1, centre), Some(B));
    }

    #[test]
    fn test_reset_releases_plan() {
        let graph = WorldGraph::open_grid(4, 4);
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Octile);
        let start = at(&graph, 0, 0);
        let goal = at(&graph, 3, 3);

        let mut pathfinder =
            AgentPathfinder::new(A, start, goal, PathfinderConfig::default(), &graph).unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };
        found(pathfinder.plan(&mut ctx, 1_000));
        assert!(ctx.table.reserved_cells(A) > 0);

        pathfinder.reset(ctx.table);
        assert_eq!(pathfinder.status(), PathfinderStatus::Invalid);
        assert_eq!(pathfinder.search_step(&mut ctx), SearchOutcome::Waiting);
        assert_eq!(table.reserved_cells(A), 0);
        assert_eq!(table.endpoint_of(A), None);
    }

    #[test]
    fn test_retarget_and_restore() {
        let graph = WorldGraph::open_grid(4, 1);
        let nodes: Vec<NodeId> = (0..4).map(|x| at(&graph, x, 0)).collect();
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);

        let mut pathfinder =
            AgentPathfinder::new(A, nodes[0], nodes[3], PathfinderConfig::default(), &graph)
                .unwrap();
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };
        found(pathfinder.plan(&mut ctx, 1_000));
        let snapshot = pathfinder.clone();
        let cells = ctx.table.reserved_cells(A);

        pathfinder
            .retarget(ctx.table, &graph, nodes[0], nodes[1], None)
            .unwrap();
        assert_eq!(ctx.table.reserved_cells(A), 0);
        assert_eq!(found(pathfinder.plan(&mut ctx, 1_000)), vec![nodes[0], nodes[1]]);

        pathfinder.reset(ctx.table);
        snapshot.restore(ctx.table).unwrap();
        assert_eq!(table.reserved_cells(A), cells);
    }

    #[test]
    fn test_permissive_mode_ignores_reservations() {
        let graph = WorldGraph::open_grid(3, 1);
        let nodes: Vec<NodeId> = (0..3).map(|x| at(&graph, x, 0)).collect();
        let mut table = ReservationTable::build(&graph);
        let mut heuristic = Heuristic::Static(HeuristicKind::Manhattan);
        table
            .handle_path_plan_request(&[nodes[1]; 6], B)
            .unwrap();

        let respected = PathfinderConfig {
            max_depth: 4,
            ..Default::default()
        };
        let permissive = PathfinderConfig {
            collision: CollisionMode::Permissive,
            ..respected
        };
        let mut ctx = SearchContext {
            graph: &graph,
            table: &mut table,
            heuristic: &mut heuristic,
            strategy: &CooperativeAStar,
        };

        let mut blocked = AgentPathfinder::new(A, nodes[0], nodes[2], respected, &graph).unwrap();
        assert_eq!(blocked.plan(&mut ctx, 10_000), SearchOutcome::Waiting);

        let mut ghost = AgentPathfinder::new(A, nodes[0], nodes[2], permissive, &graph).unwrap();
        assert_eq!(found(ghost.plan(&mut ctx, 10_000)), nodes);
        assert_eq!(table.reserved_cells(A), 0);
    }

    #[test]
    fn test_unknown_nodes_are_rejected() {
        let graph = WorldGraph::open_grid(2, 2);
        let err = AgentPathfinder::new(
            A,
            NodeId(0),
            NodeId(42),
            PathfinderConfig::default(),
            &graph,
        );
        assert!(matches!(err, Err(MapfError::UnknownNode(NodeId(42)))));
    }
}
