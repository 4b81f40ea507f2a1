use thiserror::Error;

use crate::common::{AgentId, NodeId, Position, TaskId};

#[derive(Debug, Error)]
pub enum MapfError {
    #[error("node at {0} not found in graph")]
    NodeNotFound(Position),

    #[error("node {0} is not part of the graph")]
    UnknownNode(NodeId),

    #[error("duplicate node at {0}")]
    DuplicateNode(Position),

    #[error("invalid map: {0}")]
    InvalidMap(String),

    // Only reachable when a caller skips the eligibility checks.
    #[error("agent {agent} cannot reserve timestep {time}: held by agent {holder}")]
    ReservationConflict {
        agent: AgentId,
        holder: AgentId,
        time: usize,
    },

    #[error("path step {0} -> {1} does not follow a graph edge")]
    NotAdjacent(NodeId, NodeId),

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("node at {0} is already occupied by agent {1}")]
    Occupied(Position, AgentId),
}

pub type MapfResult<T> = Result<T, MapfError>;
