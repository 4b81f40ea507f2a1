use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;

use crate::common::{Direction, EdgeId, NodeId, Position};
use crate::error::{MapfError, MapfResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Edge,
    Pickup,
    Deposit,
    Rest,
    Charge,
    Void,
}

impl NodeKind {
    pub fn from_char(ch: char) -> Option<NodeKind> {
        match ch {
            '.' | 'E' => Some(NodeKind::Edge),
            'P' => Some(NodeKind::Pickup),
            'D' => Some(NodeKind::Deposit),
            'R' => Some(NodeKind::Rest),
            'C' => Some(NodeKind::Charge),
            '@' | 'T' | '#' => Some(NodeKind::Void),
            _ => None,
        }
    }

    /// Nodes an agent may treat as a resting or task location.
    pub fn is_endpoint(self) -> bool {
        matches!(
            self,
            NodeKind::Pickup | NodeKind::Deposit | NodeKind::Rest | NodeKind::Charge
        )
    }
}

/// N/E/S/W flags a node declares for building adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EdgeDirs(u8);

impl EdgeDirs {
    pub const NONE: EdgeDirs = EdgeDirs(0);
    pub const ALL: EdgeDirs = EdgeDirs(0b1111);

    fn bit(direction: Direction) -> u8 {
        match direction {
            Direction::North => 0b0001,
            Direction::East => 0b0010,
            Direction::South => 0b0100,
            Direction::West => 0b1000,
        }
    }

    pub fn with(self, direction: Direction) -> EdgeDirs {
        EdgeDirs(self.0 | Self::bit(direction))
    }

    pub fn allows(self, direction: Direction) -> bool {
        self.0 & Self::bit(direction) != 0
    }
}

impl Default for EdgeDirs {
    fn default() -> Self {
        EdgeDirs::ALL
    }
}

impl TryFrom<String> for EdgeDirs {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .chars()
            .try_fold(EdgeDirs::NONE, |dirs, ch| match ch.to_ascii_uppercase() {
                'N' => Ok(dirs.with(Direction::North)),
                'E' => Ok(dirs.with(Direction::East)),
                'S' => Ok(dirs.with(Direction::South)),
                'W' => Ok(dirs.with(Direction::West)),
                other => Err(format!("unknown edge direction '{other}'")),
            })
    }
}

impl From<EdgeDirs> for String {
    fn from(dirs: EdgeDirs) -> Self {
        dirs.to_string()
    }
}

impl fmt::Display for EdgeDirs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (direction, ch) in Direction::ALL.into_iter().zip(['N', 'E', 'S', 'W']) {
            if self.allows(direction) {
                write!(f, "{ch}")?;
            }
        }
        Ok(())
    }
}

/// Collaborator-provided description of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub position: Position,
    pub kind: NodeKind,
    #[serde(default)]
    pub edge_dirs: EdgeDirs,
}

impl NodeSpec {
    pub fn new(position: impl Into<Position>, kind: NodeKind) -> Self {
        NodeSpec {
            position: position.into(),
            kind,
            edge_dirs: EdgeDirs::ALL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub position: Position,
    pub kind: NodeKind,
    pub edge_dirs: EdgeDirs,
}

/// Static undirected graph of traversable nodes, unit edge weights.
#[derive(Debug, Clone)]
pub struct WorldGraph {
    nodes: Vec<Node>,
    index: HashMap<Position, NodeId>,
    neighbors: Vec<Vec<NodeId>>,
    edges: Vec<(NodeId, NodeId)>,
    edge_index: HashMap<(NodeId, NodeId), EdgeId>,
    incident: Vec<Vec<EdgeId>>,
}

impl WorldGraph {
    /// Void nodes are dropped. Two nodes are connected iff each declares the
    /// direction toward the other.
    pub fn from_node_list(specs: Vec<NodeSpec>) -> MapfResult<Self> {
        let mut nodes = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());

        for spec in specs.into_iter().filter(|spec| spec.kind != NodeKind::Void) {
            let id = NodeId(nodes.len() as u32);
            if index.insert(spec.position, id).is_some() {
                return Err(MapfError::DuplicateNode(spec.position));
            }
            nodes.push(Node {
                position: spec.position,
                kind: spec.kind,
                edge_dirs: spec.edge_dirs,
            });
        }

        let mut neighbors = vec![Vec::new(); nodes.len()];
        let mut edges = Vec::new();
        let mut edge_index = HashMap::new();
        let mut incident = vec![Vec::new(); nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            let from = NodeId(i as u32);
            for direction in Direction::ALL {
                if !node.edge_dirs.allows(direction) {
                    continue;
                }
                let Some(&to) = index.get(&node.position.step(direction)) else {
                    continue;
                };
                if !nodes[to.index()].edge_dirs.allows(direction.opposite()) {
                    continue;
                }
                neighbors[i].push(to);

                // Each undirected edge is registered once, from its lower end.
                if from < to {
                    let edge = EdgeId(edges.len() as u32);
                    edges.push((from, to));
                    edge_index.insert((from, to), edge);
                    incident[from.index()].push(edge);
                    incident[to.index()].push(edge);
                }
            }
        }

        Ok(WorldGraph {
            nodes,
            index,
            neighbors,
            edges,
            edge_index,
            incident,
        })
    }

    /// Parses map rows; row `y`, column `x`.
    pub fn from_ascii(rows: &str) -> MapfResult<Self> {
        let mut specs = Vec::new();
        for (y, line) in rows.lines().filter(|line| !line.trim().is_empty()).enumerate() {
            for (x, ch) in line.trim_end().chars().enumerate() {
                let kind = NodeKind::from_char(ch).ok_or_else(|| {
                    MapfError::InvalidMap(format!("unknown tile '{ch}' at ({x}, {y})"))
                })?;
                specs.push(NodeSpec::new((x as i32, y as i32), kind));
            }
        }
        WorldGraph::from_node_list(specs)
    }

    pub fn open_grid(width: i32, height: i32) -> Self {
        let specs = (0..height)
            .flat_map(|y| (0..width).map(move |x| NodeSpec::new((x, y), NodeKind::Edge)))
            .collect();
        // Distinct positions, nothing can fail.
        WorldGraph::from_node_list(specs).unwrap_or_else(|_| unreachable!())
    }

    /// Loads an octile `.map` file or a `.json` node list.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("cannot read map file {path}"))?;

        if path.ends_with(".json") {
            let specs: Vec<NodeSpec> = serde_json::from_str(&content)
                .with_context(|| format!("cannot parse node list {path}"))?;
            return Ok(WorldGraph::from_node_list(specs)?);
        }

        let mut lines = content.lines();
        let _type = lines.next().ok_or_else(|| anyhow!("missing map type line"))?;
        let height = header_value(lines.next(), "height")?;
        let width = header_value(lines.next(), "width")?;
        let _map = lines.next().ok_or_else(|| anyhow!("missing map marker line"))?;

        let rows: Vec<&str> = lines.take(height).collect();
        if rows.len() != height || rows.iter().any(|row| row.trim_end().len() != width) {
            return Err(anyhow!(
                "map body does not match declared size {width}x{height}"
            ));
        }

        Ok(WorldGraph::from_ascii(&rows.join("\n"))?)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.nodes.len()
    }

    pub fn position(&self, node: NodeId) -> Position {
        self.nodes[node.index()].position
    }

    pub fn kind(&self, node: NodeId) -> NodeKind {
        self.nodes[node.index()].kind
    }

    pub fn find(&self, position: Position) -> Option<NodeId> {
        self.index.get(&position).copied()
    }

    pub fn lookup(&self, position: Position) -> MapfResult<NodeId> {
        self.find(position)
            .ok_or(MapfError::NodeNotFound(position))
    }

    pub fn ensure(&self, node: NodeId) -> MapfResult<NodeId> {
        if self.contains(node) {
            Ok(node)
        } else {
            Err(MapfError::UnknownNode(node))
        }
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }

    pub fn neighbors(&self, node: NodeId) -> &[NodeId] {
        &self.neighbors[node.index()]
    }

    pub fn are_adjacent(&self, a: NodeId, b: NodeId) -> bool {
        self.edge_between(a, b).is_some()
    }

    pub fn edge_between(&self, a: NodeId, b: NodeId) -> Option<EdgeId> {
        let key = if a < b { (a, b) } else { (b, a) };
        self.edge_index.get(&key).copied()
    }

    pub fn incident_edges(&self, node: NodeId) -> &[EdgeId] {
        &self.incident[node.index()]
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = NodeId> + '_ {
        self.node_ids().filter(move |node| self.kind(*node) == kind)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.node_ids().filter(|node| self.kind(*node).is_endpoint())
    }

    pub fn direction_between(&self, from: NodeId, to: NodeId) -> Option<Direction> {
        Direction::between(self.position(from), self.position(to))
    }
}

fn header_value(line: Option<&str>, name: &str) -> anyhow::Result<usize> {
    line.and_then(|line| line.split_whitespace().last())
        .ok_or_else(|| anyhow!("missing {name} line"))?
        .parse::<usize>()
        .with_context(|| format!("invalid {name} value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_map() {
        let graph = WorldGraph::from_file("map_file/test/warehouse.map").unwrap();

        let pickup = graph.lookup(Position::new(1, 1)).unwrap();
        assert_eq!(graph.kind(pickup), NodeKind::Pickup);
        assert!(graph.find(Position::new(0, 0)).is_some());
        assert!(graph.find(Position::new(2, 1)).is_none());
        assert!(graph.endpoints().count() >= 4);

        // Only the four cardinal neighbours, the self-loop is added by the search.
        let neighbors = graph.neighbors(pickup);
        assert!(neighbors.len() <= 4);
        assert!(!neighbors.contains(&pickup));
    }

    #[test]
    fn test_open_grid_adjacency() {
        let graph = WorldGraph::open_grid(3, 3);
        assert_eq!(graph.node_count(), 9);
        // 2 * w * (h - 1) edges in a full grid.
        assert_eq!(graph.edge_count(), 12);

        let center = graph.lookup(Position::new(1, 1)).unwrap();
        let corner = graph.lookup(Position::new(0, 0)).unwrap();
        assert_eq!(graph.neighbors(center).len(), 4);
        assert_eq!(graph.neighbors(corner).len(), 2);
        assert_eq!(graph.incident_edges(center).len(), 4);
        assert!(!graph.are_adjacent(center, corner));

        let north = graph.lookup(Position::new(1, 0)).unwrap();
        assert_eq!(graph.neighbors(center)[0], north);
        assert_eq!(graph.direction_between(center, north), Some(Direction::North));
        assert_eq!(graph.edge_between(center, north), graph.edge_between(north, center));
    }

    #[test]
    fn test_edge_requires_both_directions() {
        let specs = vec![
            NodeSpec {
                position: Position::new(0, 0),
                kind: NodeKind::Rest,
                edge_dirs: EdgeDirs::NONE.with(Direction::East),
            },
            NodeSpec {
                position: Position::new(1, 0),
                kind: NodeKind::Edge,
                edge_dirs: EdgeDirs::NONE.with(Direction::South),
            },
            NodeSpec::new((1, 1), NodeKind::Edge),
        ];
        let graph = WorldGraph::from_node_list(specs).unwrap();
        let a = graph.lookup(Position::new(0, 0)).unwrap();
        let b = graph.lookup(Position::new(1, 0)).unwrap();
        let c = graph.lookup(Position::new(1, 1)).unwrap();
        assert!(!graph.are_adjacent(a, b));
        assert!(graph.are_adjacent(b, c));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_void_and_duplicate_nodes() {
        let graph = WorldGraph::from_ascii(".@.\n...").unwrap();
        assert_eq!(graph.node_count(), 5);
        assert!(matches!(
            graph.lookup(Position::new(1, 0)),
            Err(MapfError::NodeNotFound(_))
        ));

        let duplicate = WorldGraph::from_node_list(vec![
            NodeSpec::new((0, 0), NodeKind::Edge),
            NodeSpec::new((0, 0), NodeKind::Rest),
        ]);
        assert!(matches!(duplicate, Err(MapfError::DuplicateNode(_))));
        assert!(WorldGraph::from_ascii(".x.").is_err());
    }

    #[test]
    fn test_node_list_json() {
        let json = r#"[
            {"position": [0, 0], "kind": "pickup", "edge_dirs": "E"},
            {"position": [1, 0], "kind": "edge", "edge_dirs": "WE"},
            {"position": [2, 0], "kind": "deposit"}
        ]"#;
        let specs: Vec<NodeSpec> = serde_json::from_str(json).unwrap();
        let graph = WorldGraph::from_node_list(specs).unwrap();
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.endpoints().count(), 2);
        assert_eq!(EdgeDirs::try_from("nesw".to_string()), Ok(EdgeDirs::ALL));
        assert_eq!(EdgeDirs::ALL.to_string(), "NESW");
    }
}
