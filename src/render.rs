//! Abstract render events.
//!
//! The simulation describes what changed as `(kind, action, payload)`
//! triples; whoever draws the warehouse subscribes through a [`RenderSink`].

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::mpsc::Sender;
use tracing::trace;

use crate::common::{AgentId, Position, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderKind {
    Agent,
    Task,
    Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderAction {
    Spawn,
    Move,
    Wait,
    Crash,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderRequest {
    pub kind: RenderKind,
    pub action: RenderAction,
    pub payload: Value,
}

impl RenderRequest {
    pub fn agent_spawned(agent: AgentId, name: &str, at: Position) -> Self {
        RenderRequest {
            kind: RenderKind::Agent,
            action: RenderAction::Spawn,
            payload: json!({ "agent": agent.0, "name": name, "position": at }),
        }
    }

    pub fn agent_moved(agent: AgentId, from: Position, to: Position, time: usize) -> Self {
        RenderRequest {
            kind: RenderKind::Agent,
            action: RenderAction::Move,
            payload: json!({ "agent": agent.0, "from": from, "to": to, "time": time }),
        }
    }

    pub fn agent_waited(agent: AgentId, at: Position, time: usize) -> Self {
        RenderRequest {
            kind: RenderKind::Agent,
            action: RenderAction::Wait,
            payload: json!({ "agent": agent.0, "position": at, "time": time }),
        }
    }

    pub fn agent_crashed(agent: AgentId, at: Position, time: usize) -> Self {
        RenderRequest {
            kind: RenderKind::Agent,
            action: RenderAction::Crash,
            payload: json!({ "agent": agent.0, "position": at, "time": time }),
        }
    }

    pub fn path_planned(agent: AgentId, origin: usize, nodes: &[Position]) -> Self {
        RenderRequest {
            kind: RenderKind::Path,
            action: RenderAction::Update,
            payload: json!({ "agent": agent.0, "origin": origin, "nodes": nodes }),
        }
    }

    pub fn task_changed(task: TaskId, status: impl Serialize, assignee: Option<AgentId>) -> Self {
        RenderRequest {
            kind: RenderKind::Task,
            action: RenderAction::Update,
            payload: json!({ "task": task.0, "status": status, "assignee": assignee.map(|a| a.0) }),
        }
    }

    pub fn task_removed(task: TaskId) -> Self {
        RenderRequest {
            kind: RenderKind::Task,
            action: RenderAction::Remove,
            payload: json!({ "task": task.0 }),
        }
    }
}

impl fmt::Display for RenderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?} {}", self.kind, self.action, self.payload)
    }
}

/// Receives render events. Submitting must never block the simulation.
pub trait RenderSink: fmt::Debug {
    fn submit(&mut self, request: RenderRequest);
}

/// Drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn submit(&mut self, _request: RenderRequest) {}
}

/// Keeps events until someone drains them.
#[derive(Debug, Default)]
pub struct BufferedSink {
    requests: Vec<RenderRequest>,
}

impl BufferedSink {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn drain(&mut self) -> Vec<RenderRequest> {
        std::mem::take(&mut self.requests)
    }
}

impl RenderSink for BufferedSink {
    fn submit(&mut self, request: RenderRequest) {
        self.requests.push(request);
    }
}

/// Logs every event at trace level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl RenderSink for TracingSink {
    fn submit(&mut self, request: RenderRequest) {
        trace!(target: "render", "{request}");
    }
}

/// Forwards events to a renderer on another thread. Events sent after the
/// receiver hung up are dropped.
impl RenderSink for Sender<RenderRequest> {
    fn submit(&mut self, request: RenderRequest) {
        let _ = self.send(request);
    }
}
