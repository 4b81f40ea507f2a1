use std::collections::BTreeMap;
use tracing::debug;

use crate::common::{AgentId, AgentState, NodeId, Position};
use crate::error::{MapfError, MapfResult};
use crate::map::WorldGraph;
use crate::pathfinder::{AgentPathfinder, PathfinderConfig};
use crate::reservation::ReservationTable;

/// Owns every agent's state and, once it has somewhere to go, its pathfinder.
#[derive(Debug, Clone, Default)]
pub struct AgentManager {
    agents: BTreeMap<AgentId, AgentState>,
    pathfinders: BTreeMap<AgentId, AgentPathfinder>,
    next_id: usize,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(
        &mut self,
        graph: &WorldGraph,
        name: impl Into<String>,
        position: Position,
    ) -> MapfResult<AgentId> {
        let node = graph.lookup(position)?;
        if let Some(other) = self.occupant(node) {
            return Err(MapfError::Occupied(position, other));
        }

        let id = AgentId(self.next_id);
        self.next_id += 1;
        let name = name.into();
        debug!("agent {id} ({name}) spawned at {position}");
        self.agents.insert(id, AgentState::new(id, name, node));
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.agents.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.values()
    }

    pub fn get(&self, agent: AgentId) -> MapfResult<&AgentState> {
        self.agents.get(&agent).ok_or(MapfError::AgentNotFound(agent))
    }

    pub fn get_mut(&mut self, agent: AgentId) -> MapfResult<&mut AgentState> {
        self.agents
            .get_mut(&agent)
            .ok_or(MapfError::AgentNotFound(agent))
    }

    pub fn occupant(&self, node: NodeId) -> Option<AgentId> {
        self.agents
            .values()
            .find(|agent| agent.position == node)
            .map(|agent| agent.id)
    }

    pub fn pathfinder(&self, agent: AgentId) -> Option<&AgentPathfinder> {
        self.pathfinders.get(&agent)
    }

    pub fn pathfinder_mut(&mut self, agent: AgentId) -> Option<&mut AgentPathfinder> {
        self.pathfinders.get_mut(&agent)
    }

    /// Installs a pathfinder, returning the one it replaces. Reservations of
    /// the replaced pathfinder are left to the caller.
    pub fn install_pathfinder(&mut self, pathfinder: AgentPathfinder) -> Option<AgentPathfinder> {
        self.pathfinders.insert(pathfinder.agent(), pathfinder)
    }

    pub fn take_pathfinder(&mut self, agent: AgentId) -> Option<AgentPathfinder> {
        self.pathfinders.remove(&agent)
    }

    /// Sends `agent` from where it stands to `goal` (then `dropoff`, for
    /// two-phase searches), releasing whatever plan it had.
    pub fn assign_goal(
        &mut self,
        agent: AgentId,
        goal: NodeId,
        dropoff: Option<NodeId>,
        graph: &WorldGraph,
        table: &mut ReservationTable,
        config: PathfinderConfig,
    ) -> MapfResult<()> {
        let source = self.get(agent)?.position;
        match self.pathfinders.get_mut(&agent) {
            Some(pathfinder) => pathfinder.retarget(table, graph, source, goal, dropoff)?,
            None => {
                let mut pathfinder = AgentPathfinder::new(agent, source, goal, config, graph)?;
                if let Some(dropoff) = dropoff {
                    pathfinder = pathfinder.with_dropoff(graph, dropoff)?;
                }
                self.pathfinders.insert(agent, pathfinder);
            }
        }
        debug!("agent {agent} heads from {source} to {goal}");
        Ok(())
    }

    /// Drops the agent's pathfinder and releases its reservations.
    pub fn clear_goal(&mut self, agent: AgentId, table: &mut ReservationTable) {
        if let Some(mut pathfinder) = self.pathfinders.remove(&agent) {
            pathfinder.reset(table);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_agent_rejects_occupied_and_missing_nodes() {
        let graph = WorldGraph::from_ascii("..\n.@").unwrap();
        let mut fleet = AgentManager::new();

        let first = fleet.add_agent(&graph, "alpha", Position::new(0, 0)).unwrap();
        assert_eq!(first, AgentId(0));
        assert!(matches!(
            fleet.add_agent(&graph, "beta", Position::new(0, 0)),
            Err(MapfError::Occupied(_, AgentId(0)))
        ));
        assert!(matches!(
            fleet.add_agent(&graph, "gamma", Position::new(1, 1)),
            Err(MapfError::NodeNotFound(_))
        ));

        let second = fleet.add_agent(&graph, "delta", Position::new(1, 0)).unwrap();
        assert_eq!(second, AgentId(1));
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.get(second).unwrap().name, "delta");
        assert!(matches!(
            fleet.get(AgentId(7)),
            Err(MapfError::AgentNotFound(AgentId(7)))
        ));
    }

    #[test]
    fn test_assign_goal_reuses_pathfinder() {
        let graph = WorldGraph::open_grid(3, 1);
        let mut table = ReservationTable::build(&graph);
        let mut fleet = AgentManager::new();
        let agent = fleet.add_agent(&graph, "alpha", Position::new(0, 0)).unwrap();
        let goal = graph.lookup(Position::new(2, 0)).unwrap();

        fleet
            .assign_goal(agent, goal, None, &graph, &mut table, PathfinderConfig::default())
            .unwrap();
        assert_eq!(fleet.pathfinder(agent).map(|p| p.goal()), Some(goal));

        let back = graph.lookup(Position::new(0, 0)).unwrap();
        fleet
            .assign_goal(agent, back, Some(goal), &graph, &mut table, PathfinderConfig::default())
            .unwrap();
        let pathfinder = fleet.pathfinder(agent).unwrap();
        assert_eq!(pathfinder.goal(), back);
        assert_eq!(pathfinder.final_goal(), goal);

        fleet.clear_goal(agent, &mut table);
        assert!(fleet.pathfinder(agent).is_none());
    }
}
