use anyhow::{Context, Result};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use tracing::info;

use crate::common::{NodeId, Position};
use crate::map::{NodeKind, WorldGraph};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    pub start: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    pub pickup: Position,
    pub dropoff: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl Scenario {
    pub fn load_from_file(path: &str) -> Result<Scenario> {
        let file = File::open(path).with_context(|| format!("cannot open scenario {path}"))?;
        let reader = BufReader::new(file);
        let scenario: Scenario = serde_yaml::from_reader(reader)
            .with_context(|| format!("error with scenario file: {path}"))?;
        info!(
            "Loaded scenario {path}: {} agents, {} tasks",
            scenario.agents.len(),
            scenario.tasks.len()
        );
        Ok(scenario)
    }

    /// Places `num_agents` agents on distinct free nodes, rest nodes first.
    pub fn generate_agents_randomly<R: Rng + ?Sized>(
        graph: &WorldGraph,
        occupied: &HashSet<NodeId>,
        num_agents: usize,
        rng: &mut R,
    ) -> Result<Vec<AgentEntry>, String> {
        let mut rest: Vec<NodeId> = graph
            .nodes_of_kind(NodeKind::Rest)
            .filter(|node| !occupied.contains(node))
            .collect();
        let mut other: Vec<NodeId> = graph
            .node_ids()
            .filter(|node| graph.kind(*node) != NodeKind::Rest && !occupied.contains(node))
            .collect();

        if rest.len() + other.len() < num_agents {
            return Err(format!(
                "Only {} free nodes for {num_agents} agents",
                rest.len() + other.len()
            ));
        }

        // Shuffle each pool, then draw rest nodes before anything else
        rest.shuffle(rng);
        other.shuffle(rng);
        let agents: Vec<AgentEntry> = rest
            .into_iter()
            .chain(other)
            .take(num_agents)
            .enumerate()
            .map(|(index, node)| AgentEntry {
                name: format!("random_{index}"),
                start: graph.position(node),
            })
            .collect();

        info!("Generate agents: {agents:?}");
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_read_scenario() {
        let scenario =
            Scenario::load_from_file("scenario/warehouse.yaml").expect("Error loading scenario");
        let graph = WorldGraph::from_file("map_file/test/warehouse.map").unwrap();

        assert!(!scenario.agents.is_empty());
        assert!(!scenario.tasks.is_empty());
        for agent in &scenario.agents {
            assert!(graph.find(agent.start).is_some(), "{} is off the map", agent.name);
        }
        for task in &scenario.tasks {
            assert_eq!(
                graph.find(task.pickup).map(|node| graph.kind(node)),
                Some(NodeKind::Pickup)
            );
            assert!(graph.find(task.dropoff).is_some());
        }
    }

    #[test]
    fn test_parse_inline_scenario() {
        let scenario: Scenario = serde_yaml::from_str(
            "agents:\n  - name: alpha\n    start: [0, 0]\ntasks:\n  - name: crate\n    pickup: [1, 1]\n    dropoff: [7, 1]\n    time_limit: 40\n",
        )
        .unwrap();
        assert_eq!(scenario.agents[0].start, Position::new(0, 0));
        assert_eq!(scenario.tasks[0].time_limit, Some(40));

        let round: Scenario = serde_yaml::from_str(&serde_yaml::to_string(&scenario).unwrap()).unwrap();
        assert_eq!(round, scenario);
    }

    #[test]
    fn test_random_agents_prefer_rest_nodes() {
        let graph = WorldGraph::from_ascii("R..\n...\n..R").unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let occupied: HashSet<NodeId> = graph.find(Position::new(0, 0)).into_iter().collect();

        let agents =
            Scenario::generate_agents_randomly(&graph, &occupied, 3, &mut rng).unwrap();
        assert_eq!(agents.len(), 3);
        assert_eq!(agents[0].start, Position::new(2, 2));
        let distinct: HashSet<Position> = agents.iter().map(|agent| agent.start).collect();
        assert_eq!(distinct.len(), 3);
        assert!(!distinct.contains(&Position::new(0, 0)));

        // Same seed, same placement.
        let mut rng = StdRng::seed_from_u64(7);
        let again = Scenario::generate_agents_randomly(&graph, &occupied, 3, &mut rng).unwrap();
        assert_eq!(again, agents);

        assert!(Scenario::generate_agents_randomly(&graph, &occupied, 9, &mut rng).is_err());
    }
}
