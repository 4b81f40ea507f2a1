//! Discrete tick loop driving the whole fleet.
//!
//! One tick: advance the reservation table, hand out tasks, let every
//! pathfinder spend its expansion budget in priority order, collect one
//! proposed move per agent, resolve conflicts and commit the result.

use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentManager;
use crate::common::{AgentId, NodeId, Position, TaskId, TaskPhase};
use crate::config::Config;
use crate::error::MapfResult;
use crate::heuristic::Heuristic;
use crate::map::{NodeKind, WorldGraph};
use crate::pathfinder::{PathfinderConfig, PathfinderStatus, SearchContext, SearchOutcome};
use crate::render::{NullSink, RenderRequest, RenderSink};
use crate::reservation::ReservationTable;
use crate::resolver::{ConflictResolver, Move, Resolution, ResolverContext};
use crate::stat::Stats;
use crate::strategy::{self, Strategy};
use crate::tasker::Tasker;

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub time: usize,
    pub committed: Vec<Move>,
    pub crashed: Vec<AgentId>,
    pub completed: Vec<TaskId>,
    pub unresolved: bool,
}

impl TickReport {
    pub fn move_of(&self, agent: AgentId) -> Option<Move> {
        self.committed.iter().find(|step| step.agent == agent).copied()
    }
}

#[derive(Debug)]
pub struct Simulation {
    graph: WorldGraph,
    table: ReservationTable,
    heuristic: Heuristic,
    strategy: Box<dyn Strategy>,
    resolver: ConflictResolver,
    fleet: AgentManager,
    tasker: Tasker,
    // Earlier is higher.
    priority: Vec<AgentId>,
    time: usize,
    pathfinder_config: PathfinderConfig,
    expansions_per_tick: usize,
    park_idle_agents: bool,
    stats: Stats,
    sink: Box<dyn RenderSink>,
}

impl Simulation {
    pub fn new(graph: WorldGraph, config: &Config) -> Self {
        let strategy = strategy::build(config.algorithm, config.window);
        let heuristic =
            Heuristic::for_algorithm(config.algorithm, config.heuristic, &graph, graph.endpoints());
        let resolution = config.resolution();
        info!(
            "{} on {} nodes, {resolution:?} resolution",
            config.algorithm,
            graph.node_count()
        );

        Simulation {
            table: ReservationTable::build(&graph),
            graph,
            heuristic,
            strategy,
            resolver: ConflictResolver::new(resolution),
            fleet: AgentManager::new(),
            tasker: Tasker::new(config.task_stealing),
            priority: Vec::new(),
            time: 0,
            pathfinder_config: config.pathfinder_config(),
            expansions_per_tick: config.expansions_per_tick,
            park_idle_agents: config.park_idle_agents,
            stats: Stats {
                algorithm: Some(config.algorithm),
                ..Default::default()
            },
            sink: Box::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn RenderSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn graph(&self) -> &WorldGraph {
        &self.graph
    }

    pub fn table(&self) -> &ReservationTable {
        &self.table
    }

    pub fn fleet(&self) -> &AgentManager {
        &self.fleet
    }

    pub fn tasker(&self) -> &Tasker {
        &self.tasker
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn priority(&self) -> &[AgentId] {
        &self.priority
    }

    pub fn position_of(&self, agent: AgentId) -> MapfResult<Position> {
        Ok(self.graph.position(self.fleet.get(agent)?.position))
    }

    pub fn add_agent(&mut self, name: impl Into<String>, position: Position) -> MapfResult<AgentId> {
        let name = name.into();
        let agent = self.fleet.add_agent(&self.graph, name.clone(), position)?;
        self.priority.push(agent);
        self.stats.agents = self.fleet.len();
        self.sink
            .submit(RenderRequest::agent_spawned(agent, &name, position));
        Ok(agent)
    }

    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        pickup: Position,
        dropoff: Position,
        time_limit: Option<usize>,
    ) -> MapfResult<TaskId> {
        let task = self
            .tasker
            .add_task(&self.graph, name, pickup, dropoff, time_limit, self.time)?;
        let (pickup, dropoff) = {
            let entry = self.tasker.task(task)?;
            (entry.pickup, entry.dropoff)
        };
        self.heuristic.register_endpoint(&self.graph, pickup);
        self.heuristic.register_endpoint(&self.graph, dropoff);
        self.sink
            .submit(RenderRequest::task_changed(task, TaskPhase::Unassigned, None));
        Ok(task)
    }

    /// Sends an agent without a task to `position`.
    pub fn navigate(&mut self, agent: AgentId, position: Position) -> MapfResult<()> {
        let goal = self.graph.lookup(position)?;
        self.fleet.get_mut(agent)?.parking = Some(goal);
        self.fleet.assign_goal(
            agent,
            goal,
            None,
            &self.graph,
            &mut self.table,
            self.pathfinder_config,
        )
    }

    /// Offers `agent` a task and plans toward it right away, so the agents
    /// served after it see its reservations.
    pub fn select_task_for_agent(&mut self, agent: AgentId) -> MapfResult<Option<TaskId>> {
        let mut ctx = SearchContext {
            graph: &self.graph,
            table: &mut self.table,
            heuristic: &mut self.heuristic,
            strategy: self.strategy.as_ref(),
        };
        let selected = self.tasker.select_task_for_agent(
            agent,
            &mut self.fleet,
            &mut ctx,
            self.pathfinder_config,
            self.expansions_per_tick,
            self.time,
        )?;
        self.stats.tasks_stolen = self.tasker.stolen();
        self.stats.steal_rollbacks = self.tasker.rollbacks();

        if let Some(task) = selected {
            self.stats.tasks_assigned += 1;
            self.sink
                .submit(RenderRequest::task_changed(task, TaskPhase::Retrieving, Some(agent)));
            self.plan_agent(agent);
        }
        Ok(selected)
    }

    pub fn run(&mut self, ticks: usize) -> MapfResult<&Stats> {
        for _ in 0..ticks {
            self.tick()?;
        }
        info!(
            "Simulated {ticks} ticks, {} of {} tasks delivered",
            self.stats.tasks_completed,
            self.tasker.tasks().count()
        );
        Ok(&self.stats)
    }

    #[instrument(skip_all, name = "tick", fields(time = self.time), level = "debug")]
    pub fn tick(&mut self) -> MapfResult<TickReport> {
        let started = Instant::now();
        let now = self.time;
        self.table.update_simulation_depth(now);
        self.resolver.promote_crashed(&mut self.priority);

        self.assign_idle_agents()?;
        self.replan_stale_plans()?;
        for agent in self.priority.clone() {
            self.plan_agent(agent);
        }

        let intended = self.propose_moves();
        let resolution = {
            let mut ctx = ResolverContext {
                graph: &self.graph,
                table: &mut self.table,
                strategy: self.strategy.as_ref(),
            };
            self.resolver.resolve(&mut self.priority, &mut ctx)
        };
        let deviated = self.apply_moves(&resolution, &intended)?;

        // Positions already moved on; new searches start from there next tick.
        for agent in resolution.replan.union(&deviated) {
            self.replan_agent(*agent)?;
        }
        let completed = self.update_tasks()?;

        for agent in self.fleet.ids() {
            let crashed = resolution.crashed.contains(&agent);
            let state = self.fleet.get_mut(agent)?;
            state.crashed = crashed;
            if crashed {
                let at = self.graph.position(state.position);
                warn!("agent {agent} crashed at {at} (t={now})");
                self.sink
                    .submit(RenderRequest::agent_crashed(agent, at, now));
            }
        }

        self.stats.ticks += 1;
        self.stats.edge_conflicts += resolution.edge_conflicts;
        self.stats.vertex_conflicts += resolution.vertex_conflicts;
        self.stats.crashes += resolution.crashed.len();
        if resolution.unresolved {
            self.stats.unresolved_ticks += 1;
        }
        self.stats.time_ms += started.elapsed().as_millis();
        self.time += 1;

        Ok(TickReport {
            time: now,
            committed: resolution.committed,
            crashed: resolution.crashed.into_iter().collect(),
            completed,
            unresolved: resolution.unresolved,
        })
    }

    fn assign_idle_agents(&mut self) -> MapfResult<()> {
        for agent in self.priority.clone() {
            let state = self.fleet.get(agent)?;
            if !state.is_idle() || state.crashed {
                continue;
            }
            if self.select_task_for_agent(agent)?.is_some() {
                continue;
            }

            if self.park_idle_agents {
                self.park(agent)?;
            }
            if self.strategy.rests_at_endpoints() && self.fleet.pathfinder(agent).is_none() {
                // Hold the current node so nobody plans to end on it.
                let position = self.fleet.get(agent)?.position;
                self.fleet.assign_goal(
                    agent,
                    position,
                    None,
                    &self.graph,
                    &mut self.table,
                    self.pathfinder_config,
                )?;
            }
        }
        Ok(())
    }

    // Moves an idle agent off a task endpoint to the nearest free rest node.
    fn park(&mut self, agent: AgentId) -> MapfResult<()> {
        let state = self.fleet.get(agent)?;
        let position = state.position;
        if state.parking.is_some()
            || !matches!(
                self.graph.kind(position),
                NodeKind::Pickup | NodeKind::Deposit
            )
        {
            return Ok(());
        }

        let taken: BTreeSet<NodeId> = self
            .fleet
            .iter()
            .filter(|other| other.id != agent)
            .flat_map(|other| [Some(other.position), other.parking])
            .flatten()
            .collect();
        let mut best: Option<(OrderedFloat<f64>, NodeId)> = None;
        let rest_nodes: Vec<NodeId> = self.graph.nodes_of_kind(NodeKind::Rest).collect();
        for node in rest_nodes {
            if taken.contains(&node)
                || !self
                    .strategy
                    .accepts_goal(&mut self.table, 0, node, agent, None)
            {
                continue;
            }
            let Some(distance) = self.heuristic.estimate(&self.graph, position, node) else {
                continue;
            };
            let candidate = (OrderedFloat(distance), node);
            if best.is_none_or(|current| candidate < current) {
                best = Some(candidate);
            }
        }

        let Some((_, node)) = best else {
            debug!("agent {agent} found no free rest node");
            return Ok(());
        };
        debug!("agent {agent} parks at {}", self.graph.position(node));
        self.fleet.get_mut(agent)?.parking = Some(node);
        self.fleet.assign_goal(
            agent,
            node,
            None,
            &self.graph,
            &mut self.table,
            self.pathfinder_config,
        )
    }

    fn replan_stale_plans(&mut self) -> MapfResult<()> {
        let now = self.time;
        let mut stale = Vec::new();
        for state in self.fleet.iter() {
            let Some(plan) = self
                .fleet
                .pathfinder(state.id)
                .and_then(|pathfinder| pathfinder.current_plan())
            else {
                continue;
            };
            if plan.node_at(now) != Some(state.position) || (plan.partial && plan.is_finished(now))
            {
                stale.push(state.id);
            }
        }
        for agent in stale {
            self.replan_agent(agent)?;
        }
        Ok(())
    }

    fn plan_agent(&mut self, agent: AgentId) {
        let Some(pathfinder) = self.fleet.pathfinder_mut(agent) else {
            return;
        };
        self.stats.search_expansions += pathfinder.take_expansions();
        if !matches!(
            pathfinder.status(),
            PathfinderStatus::Idle | PathfinderStatus::Searching
        ) {
            return;
        }

        let mut ctx = SearchContext {
            graph: &self.graph,
            table: &mut self.table,
            heuristic: &mut self.heuristic,
            strategy: self.strategy.as_ref(),
        };
        let outcome = pathfinder.plan(&mut ctx, self.expansions_per_tick);
        self.stats.search_expansions += pathfinder.take_expansions();
        if let SearchOutcome::Found(path) = outcome {
            self.stats.plans_found += 1;
            let nodes: Vec<Position> = path.iter().map(|node| self.graph.position(*node)).collect();
            self.sink
                .submit(RenderRequest::path_planned(agent, self.time, &nodes));
        }
    }

    // One proposal per agent; returns the planned next node of each agent
    // that is following a plan.
    fn propose_moves(&mut self) -> BTreeMap<AgentId, Option<NodeId>> {
        let next = self.time + 1;
        let mut intended = BTreeMap::new();
        for state in self.fleet.iter() {
            let from = state.position;
            let pathfinder = self.fleet.pathfinder(state.id);
            let planned = pathfinder
                .and_then(|pathfinder| pathfinder.next_node(next))
                .filter(|to| *to == from || self.graph.are_adjacent(from, *to));
            let to = match planned {
                Some(to) => to,
                None if self.resolver.is_crashed(state.id) => ConflictResolver::forced_move(
                    &self.graph,
                    &mut self.heuristic,
                    from,
                    pathfinder.map(|pathfinder| pathfinder.goal()),
                ),
                None => from,
            };
            self.resolver.submit_move(state.id, from, to);
            intended.insert(state.id, planned);
        }
        intended
    }

    // Commits the resolved moves; returns agents that left their plan, or
    // moved without one.
    fn apply_moves(
        &mut self,
        resolution: &Resolution,
        intended: &BTreeMap<AgentId, Option<NodeId>>,
    ) -> MapfResult<BTreeSet<AgentId>> {
        let now = self.time;
        let mut deviated = BTreeSet::new();
        for step in &resolution.committed {
            let state = self.fleet.get_mut(step.agent)?;
            let from = self.graph.position(step.from);
            if step.is_wait() {
                state.waiting_ticks += 1;
                self.stats.waits += 1;
                self.sink
                    .submit(RenderRequest::agent_waited(step.agent, from, now));
            } else {
                state.position = step.to;
                if let Some(direction) = self.graph.direction_between(step.from, step.to) {
                    state.orientation = direction;
                }
                state.waiting_ticks = 0;
                self.stats.moves += 1;
                self.sink.submit(RenderRequest::agent_moved(
                    step.agent,
                    from,
                    self.graph.position(step.to),
                    now,
                ));
            }
            let on_plan = match intended.get(&step.agent) {
                Some(Some(planned)) => *planned == step.to,
                // Forced and shoved moves leave the search behind its agent.
                _ => step.is_wait(),
            };
            if !on_plan {
                deviated.insert(step.agent);
            }
        }
        Ok(deviated)
    }

    // Points the agent's search at whatever it should be heading for now.
    fn replan_agent(&mut self, agent: AgentId) -> MapfResult<()> {
        let state = self.fleet.get(agent)?;
        let (position, phase, parking) = (state.position, state.phase, state.parking);
        let target = match state.task {
            Some(task) => {
                let task = self.tasker.task(task)?;
                if phase == TaskPhase::PickedUp {
                    Some((task.dropoff, None))
                } else {
                    Some((task.pickup, self.strategy.two_phase().then_some(task.dropoff)))
                }
            }
            None if parking.is_some() => parking.map(|node| (node, None)),
            None if self.strategy.rests_at_endpoints() => Some((position, None)),
            None => None,
        };

        match target {
            Some((goal, dropoff)) => self.fleet.assign_goal(
                agent,
                goal,
                dropoff,
                &self.graph,
                &mut self.table,
                self.pathfinder_config,
            )?,
            None => self.fleet.clear_goal(agent, &mut self.table),
        }
        self.stats.replans += 1;
        Ok(())
    }

    fn update_tasks(&mut self) -> MapfResult<Vec<TaskId>> {
        let arrival = self.time + 1;
        let mut completed = Vec::new();
        for agent in self.fleet.ids() {
            let state = self.fleet.get(agent)?;
            let (position, phase) = (state.position, state.phase);
            let Some(task) = state.task else {
                continue;
            };
            let (pickup, dropoff) = {
                let entry = self.tasker.task(task)?;
                (entry.pickup, entry.dropoff)
            };
            let pathfinder = self.fleet.pathfinder(agent);

            match phase {
                TaskPhase::Retrieving if position == pickup => {
                    // A two-phase plan may hold the agent at the pickup for a handover step.
                    let ready = pathfinder
                        .and_then(|pathfinder| pathfinder.pickup_time())
                        .is_none_or(|time| arrival >= time);
                    if !ready {
                        continue;
                    }
                    let continues = pathfinder.is_some_and(|pathfinder| pathfinder.dropoff().is_some());

                    self.fleet.get_mut(agent)?.phase = TaskPhase::PickedUp;
                    self.tasker.set_status(task, TaskPhase::PickedUp)?;
                    debug!("agent {agent} picked up task {task} at t={arrival}");
                    self.sink
                        .submit(RenderRequest::task_changed(task, TaskPhase::PickedUp, Some(agent)));
                    if !continues {
                        self.fleet.assign_goal(
                            agent,
                            dropoff,
                            None,
                            &self.graph,
                            &mut self.table,
                            self.pathfinder_config,
                        )?;
                    }
                }
                TaskPhase::PickedUp if position == dropoff => {
                    let finished = pathfinder
                        .and_then(|pathfinder| pathfinder.current_plan())
                        .is_none_or(|plan| plan.is_finished(arrival));
                    if !finished {
                        continue;
                    }

                    let overdue = self.tasker.complete(task, arrival)?;
                    let state = self.fleet.get_mut(agent)?;
                    state.task = None;
                    state.phase = TaskPhase::Unassigned;
                    self.stats.tasks_completed += 1;
                    if overdue {
                        self.stats.overdue_tasks += 1;
                    }
                    self.sink
                        .submit(RenderRequest::task_changed(task, TaskPhase::Completed, Some(agent)));
                    self.sink.submit(RenderRequest::task_removed(task));
                    completed.push(task);
                }
                _ => {}
            }
        }
        Ok(completed)
    }
}
