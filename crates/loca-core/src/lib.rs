//! Execution engine for LLM agent tasks and multi-step workflows.
//!
//! ```text
//! WorkflowEngine --(per step)--> ProviderRegistry --> dyn Provider
//!       |                                                  |
//!       +-- workflow::context <-- step results ------------+
//!
//! TaskRunner (single prompt) --> ProviderRegistry --> dyn Provider
//!
//! both --> loca-db (persisted state) + EventSink (live progress)
//! ```

pub mod error;
pub mod events;
pub mod provider;
pub mod runner;
pub mod workflow;

pub use error::{EngineError, WorkflowStepError};
pub use events::{BroadcastEvents, EngineEvent, EventSink};
pub use provider::{Provider, ProviderError, ProviderRegistry};
pub use runner::TaskRunner;
pub use workflow::WorkflowEngine;
