use super::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;
use workflow_store::{SpanRecord, TraceSummary};

#[derive(Debug, Deserialize)]
pub struct TraceQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[instrument(skip(state))]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<TraceQuery>,
) -> Result<Json<Vec<TraceSummary>>, ApiError> {
    Ok(Json(
        state.spans.traces(query.limit.unwrap_or(50), query.offset.unwrap_or(0)).await?,
    ))
}

#[instrument(skip(state))]
pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TraceSummary>, ApiError> {
    state.spans.trace(id).await?.map(Json).ok_or_else(|| ApiError::not_found("trace"))
}

#[instrument(skip(state))]
pub async fn spans(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<SpanRecord>>, ApiError> {
    Ok(Json(state.spans.spans(id).await?))
}
