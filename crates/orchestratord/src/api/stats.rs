use super::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use tracing::instrument;
use workflow_engine::AgentRecord;
use workflow_store::{AgentTypeStats, StatsOverview, StatsPeriod, TimeBucket, WorkflowRollup};

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    pub period: Option<String>,
}

#[instrument(skip(state))]
pub async fn overview(State(state): State<AppState>) -> Result<Json<StatsOverview>, ApiError> {
    Ok(Json(state.stats.overview().await?))
}

#[instrument(skip(state))]
pub async fn agents(State(state): State<AppState>) -> Result<Json<Vec<AgentTypeStats>>, ApiError> {
    Ok(Json(state.stats.agents().await?))
}

#[instrument(skip(state))]
pub async fn timeseries(
    State(state): State<AppState>,
    Query(query): Query<TimeseriesQuery>,
) -> Result<Json<Vec<TimeBucket>>, ApiError> {
    let raw = query.period.as_deref().unwrap_or("24h");
    let period = StatsPeriod::parse(raw)
        .ok_or_else(|| ApiError::bad_request(format!("unknown period {raw:?}; use 1h, 24h, 7d or 30d")))?;
    Ok(Json(state.stats.timeseries(period).await?))
}

#[instrument(skip(state))]
pub async fn workflows(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkflowRollup>>, ApiError> {
    Ok(Json(state.stats.workflows().await?))
}

/// Current in-memory registry snapshot.
#[instrument(skip(state))]
pub async fn registry_agents(
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    let mut agents = state.service.registry().all();
    agents.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
    Ok(Json(agents))
}
