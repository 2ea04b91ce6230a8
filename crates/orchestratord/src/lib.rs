//! Orchestration daemon.
//!
//! Wires the message plane, the store and the workflow engine into the
//! running service: workflow lifecycle (create → dispatch → collect →
//! persist), result-stream consumption, the timeout watchdog, surface
//! routing and the HTTP/WebSocket API.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod service;
pub mod shutdown;
pub mod state;
pub mod surface;
pub mod watchdog;

pub use config::OrchestratorConfig;
pub use service::{
    CreateWorkflowRequest, ResultDisposition, ServiceError, SurfaceContext, WorkflowService,
};
pub use state::AppState;
