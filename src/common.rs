use serde::{Deserialize, Serialize};
use std::fmt;

/// Grid coordinate identifying a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Position { x, y }
    }

    pub fn step(self, direction: Direction) -> Position {
        let (dx, dy) = direction.delta();
        Position::new(self.x + dx, self.y + dy)
    }

    pub fn manhattan(self, other: Position) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

impl From<[i32; 2]> for Position {
    fn from([x, y]: [i32; 2]) -> Self {
        Position::new(x, y)
    }
}

impl From<Position> for [i32; 2] {
    fn from(position: Position) -> Self {
        [position.x, position.y]
    }
}

impl From<(i32, i32)> for Position {
    fn from((x, y): (i32, i32)) -> Self {
        Position::new(x, y)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of an undirected edge in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

impl EdgeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub usize);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    // North is y - 1.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::East => Direction::West,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
        }
    }

    pub fn between(from: Position, to: Position) -> Option<Direction> {
        Direction::ALL
            .into_iter()
            .find(|direction| from.step(*direction) == to)
    }
}

/// Sequence of nodes, one per timestep. The first element is where the agent
/// stands when the path starts.
pub type Path = Vec<NodeId>;

/// A path anchored at the absolute timestep of its first node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub origin: usize,
    pub nodes: Path,
    /// Ends before the goal (windowed search); the agent must replan at its end.
    pub partial: bool,
}

impl Plan {
    pub fn step_index(&self, time: usize) -> Option<usize> {
        time.checked_sub(self.origin)
    }

    /// Node the plan holds at absolute `time`; after the plan ends the agent
    /// stays on the last node.
    pub fn node_at(&self, time: usize) -> Option<NodeId> {
        let index = self.step_index(time)?;
        self.nodes
            .get(index)
            .or_else(|| self.nodes.last())
            .copied()
    }

    pub fn final_time(&self) -> usize {
        self.origin + self.nodes.len().saturating_sub(1)
    }

    pub fn is_finished(&self, time: usize) -> bool {
        time >= self.final_time()
    }

    /// Steps still needed from `time` until the plan first stands on `node`.
    pub fn steps_until(&self, node: NodeId, time: usize) -> Option<usize> {
        let start = self.step_index(time)?;
        self.nodes
            .iter()
            .skip(start)
            .position(|candidate| *candidate == node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Unassigned,
    Retrieving,
    PickedUp,
    // Transient: reported for the tick the dropoff happens, then the agent
    // returns to unassigned.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentState {
    pub id: AgentId,
    pub name: String,
    pub position: NodeId,
    pub orientation: Direction,
    pub task: Option<TaskId>,
    pub phase: TaskPhase,
    /// Rest node the agent is heading to while it has no task.
    pub parking: Option<NodeId>,
    pub crashed: bool,
    pub waiting_ticks: usize,
}

impl AgentState {
    pub fn new(id: AgentId, name: String, position: NodeId) -> Self {
        AgentState {
            id,
            name,
            position,
            orientation: Direction::North,
            task: None,
            phase: TaskPhase::Unassigned,
            parking: None,
            crashed: false,
            waiting_ticks: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.task.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub pickup: NodeId,
    pub dropoff: NodeId,
    pub time_limit: Option<usize>,
    pub created_at: usize,
    pub assignee: Option<AgentId>,
    pub status: TaskPhase,
}

impl Task {
    pub fn deadline(&self) -> Option<usize> {
        self.time_limit.map(|limit| self.created_at + limit)
    }

    pub fn is_overdue(&self, time: usize) -> bool {
        self.deadline().is_some_and(|deadline| time > deadline)
    }
}
