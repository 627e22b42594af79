// Automation Engine
//
// Event-driven automation system for the Lattice CRM platform.
// Domain events are matched against tenant-scoped automation definitions;
// matching definitions run as resumable graph executions.

pub mod conditions;
pub mod context;
pub mod engine;
pub mod events;
pub mod executor;
pub mod graph;
pub mod tenant;
pub mod triggers;

pub use context::ExecutionContext;
pub use engine::{AutomationEngine, EventOutcome, ExecutionStatus, RunOutcome};
pub use events::{DomainEvent, EventType};
pub use executor::NodeProcessor;
pub use graph::{ActionKind, NodeKind, WorkflowGraph};

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The event references nothing a tenant can be derived from. Dropped
    /// and logged by the caller, never retried.
    #[error("event references no resolvable tenant")]
    UnresolvedTenant,
    #[error("automation {0} has no trigger node")]
    MissingTrigger(Uuid),
    #[error("workflow graph error: {0}")]
    InvalidGraph(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
