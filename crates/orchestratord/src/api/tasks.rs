use super::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use tracing::instrument;
use uuid::Uuid;
use workflow_engine::AgentTask;

#[instrument(skip(state))]
pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AgentTask>, ApiError> {
    state.tasks.get(id).await?.map(Json).ok_or_else(|| ApiError::not_found("task"))
}
