//! HTTP surface. All failure responses share the `{error: {code, message,
//! details?}}` shape; raw internal errors never reach the wire.

pub mod health;
pub mod platforms;
pub mod stats;
pub mod tasks;
pub mod traces;
pub mod webhook;
pub mod workflows;
pub mod ws;

use crate::service::ServiceError;
use crate::state::AppState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;
use workflow_store::StoreError;

pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), details: None }
    }

    pub fn not_found(entity: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{entity} not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let message = e.to_string();
        match e {
            ServiceError::Validation { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
            }
            ServiceError::DefinitionNotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "DEFINITION_NOT_FOUND", message)
            }
            ServiceError::PlatformNotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "PLATFORM_NOT_FOUND", message)
            }
            ServiceError::SurfaceNotBound { .. } => {
                ApiError::new(StatusCode::FORBIDDEN, "SURFACE_NOT_BOUND", message)
            }
            ServiceError::AgentUnknown { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "AGENT_UNKNOWN", message)
            }
            ServiceError::DuplicateIdempotencyKey { .. } => {
                ApiError::new(StatusCode::CONFLICT, "DUPLICATE_IDEMPOTENCY_KEY", message)
            }
            ServiceError::WorkflowNotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND", message)
            }
            ServiceError::InvalidState { .. } => {
                ApiError::new(StatusCode::CONFLICT, "INVALID_STATE", message)
            }
            ServiceError::StageNotInDefinition => {
                ApiError::new(StatusCode::BAD_REQUEST, "STAGE_NOT_IN_DEFINITION", message)
            }
            ServiceError::CasExhausted { .. } => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "WRITE_CONTENTION", message)
            }
            ServiceError::Store(store) => store.into(),
            ServiceError::Bus(_) => {
                error!(error = %message, "bus failure surfaced to API");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "DEPENDENCY_UNAVAILABLE",
                    "message bus unavailable",
                )
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, .. } => ApiError::not_found(entity),
            StoreError::Conflict { message } => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
            other => {
                error!(error = %other, "store failure surfaced to API");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal storage error",
                )
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/workflows", post(workflows::create).get(workflows::list))
        .route("/workflows/:id", get(workflows::detail))
        .route("/workflows/:id/cancel", post(workflows::cancel))
        .route("/workflows/:id/retry", post(workflows::retry))
        .route("/workflows/:id/pause", post(workflows::pause))
        .route("/workflows/:id/resume", post(workflows::resume))
        .route("/workflows/:id/tasks", get(workflows::tasks))
        .route("/tasks/:id", get(tasks::detail))
        .route("/traces", get(traces::list))
        .route("/traces/:id", get(traces::detail))
        .route("/traces/:id/spans", get(traces::spans))
        .route("/stats/overview", get(stats::overview))
        .route("/stats/agents", get(stats::agents))
        .route("/stats/timeseries", get(stats::timeseries))
        .route("/stats/workflows", get(stats::workflows))
        .route("/agents", get(stats::registry_agents))
        .route("/platforms", post(platforms::create).get(platforms::list))
        .route(
            "/platforms/:id",
            get(platforms::detail).put(platforms::update).delete(platforms::remove),
        )
        .route(
            "/platforms/:id/definitions",
            post(platforms::create_definition).get(platforms::list_definitions),
        )
        .route(
            "/platforms/:id/definitions/:definition_id",
            get(platforms::definition_detail)
                .put(platforms::update_definition)
                .delete(platforms::remove_definition),
        )
        .route(
            "/platforms/:id/surfaces",
            put(platforms::bind_surface).get(platforms::list_surfaces),
        )
        .route(
            "/platforms/:id/surfaces/:surface_type",
            delete(platforms::unbind_surface),
        )
        .route("/github/webhook", post(webhook::github));

    Router::new()
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/health/detailed", get(health::detailed))
        .route("/ws", get(ws::upgrade))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
