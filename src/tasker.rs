//! Task registry and assignment.
//!
//! Idle agents take the nearest open task. With stealing enabled an idle
//! agent may also take a task whose assignee is still on its way to the
//! pickup, provided it gets there sooner and the displaced agent finds
//! other work; otherwise every reservation and assignment is put back.

use ordered_float::OrderedFloat;
use std::collections::BTreeMap;
use tracing::{debug, error, info, instrument, trace};

use crate::agent::AgentManager;
use crate::common::{AgentId, Plan, Position, Task, TaskId, TaskPhase};
use crate::error::{MapfError, MapfResult};
use crate::map::WorldGraph;
use crate::pathfinder::{AgentPathfinder, PathfinderConfig, SearchContext, SearchOutcome};

#[derive(Debug, Clone, Default)]
pub struct Tasker {
    tasks: BTreeMap<TaskId, Task>,
    next_id: usize,
    stealing: bool,
    stolen: usize,
    rollbacks: usize,
}

impl Tasker {
    pub fn new(stealing: bool) -> Self {
        Tasker {
            stealing,
            ..Default::default()
        }
    }

    pub fn add_task(
        &mut self,
        graph: &WorldGraph,
        name: impl Into<String>,
        pickup: Position,
        dropoff: Position,
        time_limit: Option<usize>,
        now: usize,
    ) -> MapfResult<TaskId> {
        let id = TaskId(self.next_id);
        let task = Task {
            id,
            name: name.into(),
            pickup: graph.lookup(pickup)?,
            dropoff: graph.lookup(dropoff)?,
            time_limit,
            created_at: now,
            assignee: None,
            status: TaskPhase::Unassigned,
        };
        self.next_id += 1;
        info!("task {id} ({}) created: {pickup} -> {dropoff}", task.name);
        self.tasks.insert(id, task);
        Ok(id)
    }

    pub fn task(&self, task: TaskId) -> MapfResult<&Task> {
        self.tasks.get(&task).ok_or(MapfError::TaskNotFound(task))
    }

    fn task_mut(&mut self, task: TaskId) -> MapfResult<&mut Task> {
        self.tasks.get_mut(&task).ok_or(MapfError::TaskNotFound(task))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Tasks not yet delivered.
    pub fn open_tasks(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.status != TaskPhase::Completed)
            .count()
    }

    pub fn stolen(&self) -> usize {
        self.stolen
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    /// Marks the task delivered; returns whether it missed its deadline.
    pub fn complete(&mut self, task: TaskId, now: usize) -> MapfResult<bool> {
        let task = self.task_mut(task)?;
        task.status = TaskPhase::Completed;
        let overdue = task.is_overdue(now);
        info!(
            "task {} ({}) delivered at t={now}{}",
            task.id,
            task.name,
            if overdue { ", overdue" } else { "" }
        );
        Ok(overdue)
    }

    pub fn set_status(&mut self, task: TaskId, status: TaskPhase) -> MapfResult<()> {
        self.task_mut(task)?.status = status;
        Ok(())
    }

    /// Nearest open task whose endpoints `agent` may use, by heuristic
    /// distance from the agent to the pickup.
    pub fn nearest_unassigned(
        &self,
        agent: AgentId,
        fleet: &AgentManager,
        ctx: &mut SearchContext<'_>,
    ) -> MapfResult<Option<TaskId>> {
        Ok(self
            .ranked_candidates(agent, fleet, ctx, false)?
            .into_iter()
            .next())
    }

    fn ranked_candidates(
        &self,
        agent: AgentId,
        fleet: &AgentManager,
        ctx: &mut SearchContext<'_>,
        with_assigned: bool,
    ) -> MapfResult<Vec<TaskId>> {
        let position = fleet.get(agent)?.position;
        let mut ranked = Vec::new();
        for task in self.tasks.values() {
            let eligible = match task.assignee {
                None => task.status == TaskPhase::Unassigned,
                Some(holder) => {
                    with_assigned
                        && holder != agent
                        && fleet
                            .get(holder)
                            .is_ok_and(|state| state.phase == TaskPhase::Retrieving)
                }
            };
            if !eligible {
                continue;
            }
            // Token Passing never sends an agent onto another agent's endpoint.
            let ignored = task.assignee;
            if !ctx
                .strategy
                .accepts_goal(ctx.table, 0, task.pickup, agent, ignored)
                || !ctx
                    .strategy
                    .accepts_goal(ctx.table, 0, task.dropoff, agent, ignored)
            {
                continue;
            }
            let Some(distance) = ctx.heuristic.estimate(ctx.graph, position, task.pickup) else {
                continue;
            };
            ranked.push((OrderedFloat(distance), task.id));
        }
        ranked.sort();
        Ok(ranked.into_iter().map(|(_, task)| task).collect())
    }

    /// Picks a task for an idle agent, stealing one if that is enabled and
    /// worthwhile. The agent's pathfinder is pointed at the task.
    #[instrument(skip_all, name = "select_task", fields(agent = agent.0), level = "debug")]
    pub fn select_task_for_agent(
        &mut self,
        agent: AgentId,
        fleet: &mut AgentManager,
        ctx: &mut SearchContext<'_>,
        config: PathfinderConfig,
        budget: usize,
        now: usize,
    ) -> MapfResult<Option<TaskId>> {
        if let Some(task) = fleet.get(agent)?.task {
            debug!("agent {agent} already serves task {task}");
            return Ok(None);
        }

        for task in self.ranked_candidates(agent, fleet, ctx, self.stealing)? {
            match self.task(task)?.assignee {
                None => {
                    self.assign(task, agent, fleet, ctx, config)?;
                    return Ok(Some(task));
                }
                Some(holder) => {
                    if self.try_steal(agent, holder, task, fleet, ctx, config, budget, now)? {
                        return Ok(Some(task));
                    }
                }
            }
        }
        Ok(None)
    }

    fn assign(
        &mut self,
        task: TaskId,
        agent: AgentId,
        fleet: &mut AgentManager,
        ctx: &mut SearchContext<'_>,
        config: PathfinderConfig,
    ) -> MapfResult<()> {
        let (pickup, dropoff) = {
            let entry = self.task_mut(task)?;
            entry.assignee = Some(agent);
            entry.status = TaskPhase::Retrieving;
            (entry.pickup, entry.dropoff)
        };
        Self::mark_assigned(fleet, agent, task)?;

        let dropoff = ctx.strategy.two_phase().then_some(dropoff);
        fleet.assign_goal(agent, pickup, dropoff, ctx.graph, ctx.table, config)?;
        info!("task {task} assigned to agent {agent}");
        Ok(())
    }

    fn mark_assigned(fleet: &mut AgentManager, agent: AgentId, task: TaskId) -> MapfResult<()> {
        let state = fleet.get_mut(agent)?;
        state.task = Some(task);
        state.phase = TaskPhase::Retrieving;
        state.parking = None;
        Ok(())
    }

    // Builds and runs a search for `agent` toward `task`, committing its plan.
    #[allow(clippy::too_many_arguments)]
    fn trial_plan(
        &self,
        agent: AgentId,
        task: TaskId,
        ignored: Option<AgentId>,
        fleet: &AgentManager,
        ctx: &mut SearchContext<'_>,
        config: PathfinderConfig,
        budget: usize,
    ) -> MapfResult<Option<AgentPathfinder>> {
        let entry = self.task(task)?;
        let source = fleet.get(agent)?.position;
        let mut pathfinder = AgentPathfinder::new(agent, source, entry.pickup, config, ctx.graph)?;
        if ctx.strategy.two_phase() {
            pathfinder = pathfinder.with_dropoff(ctx.graph, entry.dropoff)?;
        }
        pathfinder.set_ignored(ignored);

        match pathfinder.plan(ctx, budget) {
            SearchOutcome::Found(_) => Ok(Some(pathfinder)),
            SearchOutcome::Pending | SearchOutcome::Waiting => {
                pathfinder.reset(ctx.table);
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_steal(
        &mut self,
        thief: AgentId,
        holder: AgentId,
        task: TaskId,
        fleet: &mut AgentManager,
        ctx: &mut SearchContext<'_>,
        config: PathfinderConfig,
        budget: usize,
        now: usize,
    ) -> MapfResult<bool> {
        let pickup = self.task(task)?.pickup;
        let holder_steps = fleet
            .pathfinder(holder)
            .and_then(AgentPathfinder::current_plan)
            .and_then(|plan| plan.steps_until(pickup, now))
            .unwrap_or(usize::MAX);

        // The thief's own plan would shadow the trial plan's cells; lift it first.
        let thief_before = fleet.take_pathfinder(thief);
        if let Some(previous) = &thief_before {
            previous.clone().reset(ctx.table);
        }

        let Some(mut trial) = self.trial_plan(thief, task, Some(holder), fleet, ctx, config, budget)?
        else {
            Self::reinstate(thief_before, fleet, ctx);
            return Ok(false);
        };
        let arrival = trial
            .pickup_time()
            .or_else(|| trial.current_plan().map(Plan::final_time));
        if !arrival.is_some_and(|time| time.saturating_sub(now) < holder_steps) {
            // Nothing of the holder was touched; only the thief needs restoring.
            trial.reset(ctx.table);
            Self::reinstate(thief_before, fleet, ctx);
            return Ok(false);
        }

        let holder_before = fleet.take_pathfinder(holder);
        if let Some(previous) = &holder_before {
            previous.clone().reset(ctx.table);
        }

        let mut replacement = None;
        for candidate in self.ranked_candidates(holder, fleet, ctx, false)? {
            if let Some(pathfinder) = self.trial_plan(holder, candidate, None, fleet, ctx, config, budget)? {
                replacement = Some((candidate, pathfinder));
                break;
            }
            trace!("agent {holder} cannot reach replacement task {candidate}");
        }

        let Some((replacement, holder_pathfinder)) = replacement else {
            trial.reset(ctx.table);
            Self::reinstate(holder_before, fleet, ctx);
            Self::reinstate(thief_before, fleet, ctx);
            self.rollbacks += 1;
            debug!("agent {thief} cannot take task {task}: agent {holder} has nothing else to do");
            return Ok(false);
        };

        trial.set_ignored(None);
        fleet.install_pathfinder(trial);
        fleet.install_pathfinder(holder_pathfinder);

        self.task_mut(task)?.assignee = Some(thief);
        Self::mark_assigned(fleet, thief, task)?;
        let entry = self.task_mut(replacement)?;
        entry.assignee = Some(holder);
        entry.status = TaskPhase::Retrieving;
        Self::mark_assigned(fleet, holder, replacement)?;

        self.stolen += 1;
        info!("agent {thief} took task {task} from agent {holder}, which now serves task {replacement}");
        Ok(true)
    }

    fn reinstate(
        pathfinder: Option<AgentPathfinder>,
        fleet: &mut AgentManager,
        ctx: &mut SearchContext<'_>,
    ) {
        let Some(pathfinder) = pathfinder else {
            return;
        };
        if let Err(err) = pathfinder.restore(ctx.table) {
            error!(
                "agent {} could not restore its plan: {err}",
                pathfinder.agent()
            );
        }
        fleet.install_pathfinder(pathfinder);
    }
}
