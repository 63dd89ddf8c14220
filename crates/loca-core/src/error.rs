//! Error types surfaced by the runner and the workflow engine.

use uuid::Uuid;

use crate::provider::ProviderError;
use crate::workflow::guard::GuardError;

/// Failure of a public engine operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed dispatch, rejected before anything is spawned.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("agent {0} not found")]
    AgentNotFound(Uuid),

    /// Cancellation of a task or workflow that already finished.
    #[error("cannot cancel terminal {kind} {id} (status: {status})")]
    AlreadyTerminal {
        kind: &'static str,
        id: Uuid,
        status: String,
    },

    #[error("workflow {0} is already running")]
    AlreadyRunning(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Why a workflow step failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("guard evaluation failed: {0}")]
    Guard(#[from] GuardError),

    #[error("agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("{0}")]
    Store(String),
}

/// A step failure, tagged with the step it belongs to.
#[derive(Debug, Clone, thiserror::Error)]
#[error("step {step_name:?} failed: {source}")]
pub struct WorkflowStepError {
    pub step_id: Uuid,
    pub step_name: String,
    #[source]
    pub source: StepFailure,
}

impl WorkflowStepError {
    pub fn new(step_id: Uuid, step_name: impl Into<String>, source: impl Into<StepFailure>) -> Self {
        Self {
            step_id,
            step_name: step_name.into(),
            source: source.into(),
        }
    }
}
