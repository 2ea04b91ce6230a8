//! Workflow domain core.
//!
//! Pure, transport-free building blocks of the orchestration service:
//! - canonical envelope schemas with boundary validation
//! - the definition engine (stage routing, progress, validation)
//! - the in-memory agent registry snapshot
//! - the per-workflow state machine as a pure decision function
//! - trace/span propagation
//!
//! Nothing in this crate performs I/O; the orchestrator daemon wires these
//! pieces to the message bus and the store.

pub mod definition;
pub mod envelope;
pub mod model;
pub mod registry;
pub mod state_machine;
pub mod trace;

pub use definition::{
    calculate_progress, first_stage, legacy_definition, next_stage, validate_definition, Route,
    StageOutcome, ON_FAILURE_FAIL, ON_FAILURE_SKIP, ROUTE_END,
};
pub use envelope::{
    event_id, parse_result_envelope, validate_task_envelope, EventType, LifecycleEvent,
    ResultEnvelope, ResultError, ResultMetrics, ResultStatus, TaskConstraints, TaskEnvelope,
    TaskMetadata, TraceInfo, ValidationFailure, WorkflowContext, ENVELOPE_VERSION,
};
pub use model::{
    AgentTask, Platform, PlatformLayer, PlatformSurface, Priority, QueuedStageEvent,
    StageDefinition, SurfaceType, TaskStatus, Workflow, WorkflowDefinition, WorkflowError,
    WorkflowStatus, WorkflowType,
};
pub use registry::{AgentLookup, AgentRecord, AgentRegistry};
pub use state_machine::{decide, Decision, Effect, Transition, WorkflowEvent, WorkflowUpdate, WorkflowView};
pub use trace::TraceContext;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Stage {stage} is not part of definition {definition}")]
    UnknownStage { stage: String, definition: String },

    #[error("Definition {definition} has no stages")]
    EmptyDefinition { definition: String },
}
