//! Time-expanded occupancy ledger.
//!
//! Every absolute timestep owns one layer holding a node slot per graph node
//! and an edge slot per undirected edge. Layers live in two flat arenas indexed
//! by `(timestep - base) * stride + index`, grow lazily whenever a lookup
//! addresses a timestep past the frontier, and are dropped in batches once the
//! simulation has moved past them.
//!
//! Searches address the table with a *relative* depth; every lookup resolves
//! to `depth + current_depth`.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace, warn};

use crate::common::{AgentId, EdgeId, NodeId};
use crate::error::{MapfError, MapfResult};
use crate::map::WorldGraph;

// Layers older than the current depth are dropped once this many accumulate.
const PRUNE_BATCH: usize = 64;

/// Final node of an agent's committed path and the absolute timestep it
/// arrives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub node: NodeId,
    pub arrival: usize,
}

/// Whether a contested cell may be taken from its current holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overwrite {
    pub allowed: bool,
    pub node_holder: Option<AgentId>,
    pub edge_holder: Option<AgentId>,
}

/// Position of `agent` in a priority ordering; agents missing from the list
/// rank below everyone listed.
pub fn priority_rank(priority: &[AgentId], agent: AgentId) -> usize {
    priority
        .iter()
        .position(|candidate| *candidate == agent)
        .unwrap_or(priority.len())
}

#[derive(Debug, Clone)]
pub struct ReservationTable {
    node_count: usize,
    edge_count: usize,
    edge_lookup: HashMap<(NodeId, NodeId), EdgeId>,
    incident: Vec<Vec<EdgeId>>,
    nodes: Vec<Option<AgentId>>,
    edges: Vec<Option<AgentId>>,
    // Absolute timestep of the first retained layer.
    base: usize,
    // Exclusive absolute bound of allocated layers.
    time_tracked: usize,
    current_depth: usize,
    endpoints: BTreeMap<AgentId, Endpoint>,
}

impl ReservationTable {
    pub fn build(graph: &WorldGraph) -> Self {
        let mut edge_lookup = HashMap::with_capacity(graph.edge_count() * 2);
        for node in graph.node_ids() {
            for &neighbor in graph.neighbors(node) {
                if let Some(edge) = graph.edge_between(node, neighbor) {
                    edge_lookup.insert((node, neighbor), edge);
                }
            }
        }

        let mut table = ReservationTable {
            node_count: graph.node_count(),
            edge_count: graph.edge_count(),
            edge_lookup,
            incident: graph
                .node_ids()
                .map(|node| graph.incident_edges(node).to_vec())
                .collect(),
            nodes: Vec::new(),
            edges: Vec::new(),
            base: 0,
            time_tracked: 0,
            current_depth: 0,
            endpoints: BTreeMap::new(),
        };
        table.expand_to(0);
        table
    }

    pub fn current_depth(&self) -> usize {
        self.current_depth
    }

    /// Exclusive bound of the timesteps the table has allocated.
    pub fn time_tracked(&self) -> usize {
        self.time_tracked
    }

    /// Rebases relative lookups; called once per tick before any search.
    pub fn update_simulation_depth(&mut self, depth: usize) {
        if depth < self.current_depth {
            warn!(
                "ignoring simulation depth {depth}, table already at {}",
                self.current_depth
            );
            return;
        }
        self.current_depth = depth;
        self.expand_to(depth);

        if depth - self.base >= PRUNE_BATCH {
            let layers = depth - self.base;
            self.nodes.drain(..layers * self.node_count);
            self.edges.drain(..layers * self.edge_count);
            self.base = depth;
            trace!("pruned {layers} layers, base now {depth}");
        }
    }

    fn expand_to(&mut self, time: usize) {
        if time < self.time_tracked {
            return;
        }
        let layers = time + 1 - self.base;
        self.nodes.resize(layers * self.node_count, None);
        self.edges.resize(layers * self.edge_count, None);
        trace!("expanded frontier {} -> {}", self.time_tracked, time + 1);
        self.time_tracked = time + 1;
    }

    fn node_slot(&self, time: usize, node: NodeId) -> Option<usize> {
        (time >= self.base && time < self.time_tracked)
            .then(|| (time - self.base) * self.node_count + node.index())
    }

    fn edge_slot(&self, time: usize, edge: EdgeId) -> Option<usize> {
        (time >= self.base && time < self.time_tracked)
            .then(|| (time - self.base) * self.edge_count + edge.index())
    }

    fn node_at(&self, time: usize, node: NodeId) -> Option<AgentId> {
        self.node_slot(time, node).and_then(|slot| self.nodes[slot])
    }

    fn edge_at(&self, time: usize, edge: EdgeId) -> Option<AgentId> {
        self.edge_slot(time, edge).and_then(|slot| self.edges[slot])
    }

    fn held_by_other(holder: Option<AgentId>, agent: AgentId) -> bool {
        matches!(holder, Some(holder) if holder != agent)
    }

    /// Holder of `node` at relative `depth`. Never allocates.
    pub fn node_holder(&self, depth: usize, node: NodeId) -> Option<AgentId> {
        self.node_at(self.current_depth + depth, node)
    }

    /// Holder of the edge `a`-`b` for a traversal departing at relative `depth`.
    pub fn edge_holder(&self, depth: usize, a: NodeId, b: NodeId) -> Option<AgentId> {
        let edge = *self.edge_lookup.get(&(a, b))?;
        self.edge_at(self.current_depth + depth, edge)
    }

    /// True iff `agent` may stand on `target` at relative `depth` after
    /// leaving `source` one step earlier. A wait (`target == source`) also
    /// needs every incident edge free of other agents at the departure step.
    pub fn evaluate_node_eligibility(
        &mut self,
        depth: usize,
        target: NodeId,
        source: NodeId,
        agent: AgentId,
    ) -> bool {
        let arrival = self.current_depth + depth;
        self.expand_to(arrival);

        if Self::held_by_other(self.node_at(arrival, target), agent) {
            return false;
        }
        let Some(departure) = arrival.checked_sub(1) else {
            return true;
        };

        if target == source {
            return self.incident[source.index()]
                .iter()
                .all(|edge| !Self::held_by_other(self.edge_at(departure, *edge), agent));
        }

        match self.edge_lookup.get(&(source, target)) {
            Some(edge) => !Self::held_by_other(self.edge_at(departure, *edge), agent),
            None => false,
        }
    }

    /// Whether `agent` outranks every other holder of the cells it needs to
    /// move `source -> target` at relative `depth`. Ties keep the existing
    /// holder.
    pub fn evaluate_node_overwritability(
        &mut self,
        depth: usize,
        target: NodeId,
        source: NodeId,
        agent: AgentId,
        priority: &[AgentId],
    ) -> Overwrite {
        let arrival = self.current_depth + depth;
        self.expand_to(arrival);

        let node_holder = self
            .node_at(arrival, target)
            .filter(|holder| *holder != agent);

        let edge_holders: Vec<AgentId> = match arrival.checked_sub(1) {
            None => Vec::new(),
            Some(departure) if target == source => self.incident[source.index()]
                .iter()
                .filter_map(|edge| self.edge_at(departure, *edge))
                .filter(|holder| *holder != agent)
                .collect(),
            Some(departure) => match self.edge_lookup.get(&(source, target)) {
                Some(edge) => self
                    .edge_at(departure, *edge)
                    .filter(|holder| *holder != agent)
                    .into_iter()
                    .collect(),
                None => return Overwrite::default(),
            },
        };

        let rank = priority_rank(priority, agent);
        let outranks = |holder: &AgentId| rank < priority_rank(priority, *holder);
        Overwrite {
            allowed: node_holder.iter().all(outranks) && edge_holders.iter().all(outranks),
            node_holder,
            edge_holder: edge_holders.first().copied(),
        }
    }

    /// True iff no other agent (except `ignored`) declares `target` as its
    /// endpoint or holds it at any timestep from `depth` to the frontier.
    pub fn evaluate_endpoint_eligibility(
        &mut self,
        depth: usize,
        target: NodeId,
        agent: AgentId,
        ignored: Option<AgentId>,
    ) -> bool {
        let from = self.current_depth + depth;
        self.expand_to(from);

        let is_other = |holder: AgentId| holder != agent && Some(holder) != ignored;
        if self
            .endpoints
            .iter()
            .any(|(holder, endpoint)| is_other(*holder) && endpoint.node == target)
        {
            return false;
        }

        (from..self.time_tracked).all(|time| !self.node_at(time, target).is_some_and(is_other))
    }

    /// True iff another agent (except `ignored`) is resting on `node` at
    /// relative `depth`, having reached its declared endpoint there.
    pub fn is_resting_claimed(
        &self,
        depth: usize,
        node: NodeId,
        agent: AgentId,
        ignored: Option<AgentId>,
    ) -> bool {
        let time = self.current_depth + depth;
        self.endpoints.iter().any(|(holder, endpoint)| {
            *holder != agent
                && Some(*holder) != ignored
                && endpoint.node == node
                && endpoint.arrival <= time
        })
    }

    pub fn endpoint_of(&self, agent: AgentId) -> Option<Endpoint> {
        self.endpoints.get(&agent).copied()
    }

    /// Commits `path`, whose first node is the agent's position now.
    pub fn handle_path_plan_request(&mut self, path: &[NodeId], agent: AgentId) -> MapfResult<()> {
        self.reserve_path_at(self.current_depth, path, agent)
    }

    /// Commits `path` with its first node at absolute timestep `origin`.
    /// Every cell is checked before anything is written; re-reserving cells
    /// the agent already holds is a no-op.
    pub fn reserve_path_at(
        &mut self,
        origin: usize,
        path: &[NodeId],
        agent: AgentId,
    ) -> MapfResult<()> {
        let Some(&last) = path.last() else {
            return Ok(());
        };
        let final_time = origin + path.len() - 1;
        self.expand_to(final_time);

        let mut edges = Vec::with_capacity(path.len());
        for (i, node) in path.iter().enumerate() {
            let time = origin + i;
            if let Some(holder) = self.node_at(time, *node).filter(|holder| *holder != agent) {
                return Err(MapfError::ReservationConflict {
                    agent,
                    holder,
                    time,
                });
            }
            if i == 0 || path[i - 1] == *node {
                continue;
            }
            let edge = *self
                .edge_lookup
                .get(&(path[i - 1], *node))
                .ok_or(MapfError::NotAdjacent(path[i - 1], *node))?;
            if let Some(holder) = self.edge_at(time - 1, edge).filter(|holder| *holder != agent) {
                return Err(MapfError::ReservationConflict {
                    agent,
                    holder,
                    time: time - 1,
                });
            }
            edges.push((time - 1, edge));
        }

        for (i, node) in path.iter().enumerate() {
            if let Some(slot) = self.node_slot(origin + i, *node) {
                self.nodes[slot] = Some(agent);
            }
        }
        for (time, edge) in edges {
            if let Some(slot) = self.edge_slot(time, edge) {
                self.edges[slot] = Some(agent);
            }
        }
        self.endpoints.insert(
            agent,
            Endpoint {
                node: last,
                arrival: final_time,
            },
        );

        debug!("agent {agent} reserved {} steps from t={origin}", path.len());
        Ok(())
    }

    /// Releases the cells of `path[offset..]` (first node at absolute
    /// `origin`) that `agent` still holds. Cells held by anyone else are left
    /// alone.
    pub fn handle_path_release(
        &mut self,
        path: &[NodeId],
        agent: AgentId,
        origin: usize,
        offset: usize,
    ) {
        let mut released = 0;
        for i in offset..path.len() {
            let time = origin + i;
            if let Some(slot) = self.node_slot(time, path[i]) {
                if self.nodes[slot] == Some(agent) {
                    self.nodes[slot] = None;
                    released += 1;
                }
            }
            if i == offset || path[i - 1] == path[i] {
                continue;
            }
            let Some(&edge) = self.edge_lookup.get(&(path[i - 1], path[i])) else {
                continue;
            };
            if let Some(slot) = self.edge_slot(time - 1, edge) {
                if self.edges[slot] == Some(agent) {
                    self.edges[slot] = None;
                    released += 1;
                }
            }
        }

        if let Some(&last) = path.last() {
            let claim = Endpoint {
                node: last,
                arrival: origin + path.len() - 1,
            };
            if self.endpoints.get(&agent) == Some(&claim) {
                self.endpoints.remove(&agent);
            }
        }

        debug!("agent {agent} released {released} cells from t={}", origin + offset);
    }

    /// Number of node and edge cells currently attributed to `agent`.
    pub fn reserved_cells(&self, agent: AgentId) -> usize {
        self.nodes
            .iter()
            .chain(self.edges.iter())
            .filter(|holder| **holder == Some(agent))
            .count()
    }
}
