//! Event channel: live progress published by the runner and the workflow
//! engine.
//!
//! Delivery is best-effort: no acknowledgement, no replay. A subscriber
//! that joins late or lags behind misses events; persisted state remains
//! the authority.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use loca_db::models::{Task, Workflow, WorkflowStep};

/// Default capacity of a [`BroadcastEvents`] channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// What happened. Serializes as `{"type": <name>, "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "task:started")]
    TaskStarted(Task),
    /// `content` is the whole partial result so far, not just the newest
    /// fragment.
    #[serde(rename = "task:progress")]
    TaskProgress { task_id: Uuid, content: String },
    #[serde(rename = "task:completed")]
    TaskCompleted(Task),
    #[serde(rename = "task:failed")]
    TaskFailed(Task),
    #[serde(rename = "task:cancelled")]
    TaskCancelled(Task),
    #[serde(rename = "workflow:started")]
    WorkflowStarted(Workflow),
    #[serde(rename = "workflow:progress")]
    WorkflowProgress {
        workflow_id: Uuid,
        step: WorkflowStep,
    },
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted(Workflow),
    #[serde(rename = "workflow:failed")]
    WorkflowFailed(Workflow),
    #[serde(rename = "workflow:cancelled")]
    WorkflowCancelled(Workflow),
}

impl EventPayload {
    /// Canonical event name, e.g. `task:progress`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted(_) => "task:started",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskCompleted(_) => "task:completed",
            Self::TaskFailed(_) => "task:failed",
            Self::TaskCancelled(_) => "task:cancelled",
            Self::WorkflowStarted(_) => "workflow:started",
            Self::WorkflowProgress { .. } => "workflow:progress",
            Self::WorkflowCompleted(_) => "workflow:completed",
            Self::WorkflowFailed(_) => "workflow:failed",
            Self::WorkflowCancelled(_) => "workflow:cancelled",
        }
    }
}

/// A timestamped event.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

impl From<EventPayload> for EngineEvent {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}

/// Destination for engine events.
///
/// `publish` must not block: it is called inline from the streaming loop,
/// once per received fragment.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Fan-out over a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct BroadcastEvents {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventSink for BroadcastEvents {
    fn publish(&self, event: EngineEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvents;

impl EventSink for NullEvents {
    fn publish(&self, _event: EngineEvent) {}
}
