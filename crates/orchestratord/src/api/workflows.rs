use super::ApiError;
use crate::service::CreateWorkflowRequest;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;
use workflow_engine::{AgentTask, Workflow, WorkflowStatus, WorkflowType};
use workflow_store::WorkflowFilter;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<WorkflowStatus>,
    #[serde(rename = "type")]
    pub workflow_type: Option<WorkflowType>,
    pub platform_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RetryBody {
    pub from_stage: Option<String>,
}

#[instrument(skip(state, headers, request))]
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    if !state.is_accepting() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "service is shutting down",
        ));
    }

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let creator = headers
        .get("x-requested-by")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("api")
        .to_string();

    let normalized = state.surface_router.normalize_rest(request, None);
    let workflow = state
        .service
        .create_workflow(normalized.request, &creator, normalized.surface, idempotency_key)
        .await?;

    Ok((StatusCode::CREATED, Json(workflow)))
}

#[instrument(skip(state))]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    let filter = WorkflowFilter {
        status: query.status,
        workflow_type: query.workflow_type,
        platform_id: query.platform_id,
        trace_id: query.trace_id,
        limit: query.limit.unwrap_or(50),
        offset: query.offset.unwrap_or(0),
    };
    Ok(Json(state.workflows.list(&filter).await?))
}

#[instrument(skip(state))]
pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Workflow>, ApiError> {
    state
        .workflows
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("workflow"))
}

#[instrument(skip(state))]
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, body))]
pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RetryBody>>,
) -> Result<StatusCode, ApiError> {
    let from_stage = body.and_then(|b| b.0.from_stage);
    state.service.retry(id, from_stage).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.pause(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.resume(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AgentTask>>, ApiError> {
    if state.workflows.get(id).await?.is_none() {
        return Err(ApiError::not_found("workflow"));
    }
    Ok(Json(state.tasks.for_workflow(id).await?))
}
