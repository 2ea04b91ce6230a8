//! Platform, definition and surface CRUD.

use super::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;
use workflow_engine::{
    validate_definition, Platform, PlatformLayer, PlatformSurface, StageDefinition, SurfaceType,
    WorkflowDefinition,
};

#[derive(Debug, Deserialize)]
pub struct CreatePlatformBody {
    pub name: String,
    pub layer: PlatformLayer,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlatformBody {
    pub name: Option<String>,
    pub layer: Option<PlatformLayer>,
    pub config: Option<serde_json::Value>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DefinitionBody {
    pub name: String,
    pub version: String,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct BindSurfaceBody {
    pub surface_type: SurfaceType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[instrument(skip(state, body), fields(name = %body.name))]
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreatePlatformBody>,
) -> Result<(StatusCode, Json<Platform>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("platform name must be non-empty"));
    }
    let now = Utc::now();
    let platform = Platform {
        id: Uuid::new_v4(),
        name: body.name,
        layer: body.layer,
        enabled: body.enabled,
        config: body.config,
        created_at: now,
        updated_at: now,
    };
    state.platforms.insert(&platform).await?;
    Ok((StatusCode::CREATED, Json(platform)))
}

#[instrument(skip(state))]
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Platform>>, ApiError> {
    Ok(Json(state.platforms.list().await?))
}

#[instrument(skip(state))]
pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Platform>, ApiError> {
    state.platforms.get(id).await?.map(Json).ok_or_else(|| ApiError::not_found("platform"))
}

#[instrument(skip(state, body))]
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePlatformBody>,
) -> Result<Json<Platform>, ApiError> {
    let mut platform =
        state.platforms.get(id).await?.ok_or_else(|| ApiError::not_found("platform"))?;

    if let Some(name) = body.name {
        platform.name = name;
    }
    if let Some(layer) = body.layer {
        platform.layer = layer;
    }
    if let Some(config) = body.config {
        platform.config = config;
    }
    if let Some(enabled) = body.enabled {
        platform.enabled = enabled;
    }
    platform.updated_at = Utc::now();

    state.platforms.update(&platform).await?;
    Ok(Json(platform))
}

#[instrument(skip(state))]
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.platforms.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("platform"))
    }
}

#[instrument(skip(state, body), fields(platform_id = %id, name = %body.name))]
pub async fn create_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DefinitionBody>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    if state.platforms.get(id).await?.is_none() {
        return Err(ApiError::not_found("platform"));
    }

    let now = Utc::now();
    let definition = WorkflowDefinition {
        id: Uuid::new_v4(),
        platform_id: Some(id),
        name: body.name,
        version: body.version,
        stages: body.stages,
        metadata: body.metadata,
        created_at: now,
        updated_at: now,
    };

    let registry = state.service.registry();
    let issues = validate_definition(&definition, |agent_type| {
        registry.validate_agent(agent_type, Some(id)).exists
    });
    if !issues.is_empty() {
        return Err(ApiError::bad_request("definition validation failed")
            .with_details(serde_json::json!({ "issues": issues })));
    }

    state.definitions.insert(&definition).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

#[instrument(skip(state))]
pub async fn list_definitions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WorkflowDefinition>>, ApiError> {
    if state.platforms.get(id).await?.is_none() {
        return Err(ApiError::not_found("platform"));
    }
    Ok(Json(state.definitions.list(Some(id)).await?))
}

#[instrument(skip(state))]
pub async fn definition_detail(
    State(state): State<AppState>,
    Path((id, definition_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let definition = state
        .definitions
        .get(definition_id)
        .await?
        .filter(|d| d.platform_id == Some(id))
        .ok_or_else(|| ApiError::not_found("workflow definition"))?;
    Ok(Json(definition))
}

#[instrument(skip(state, body))]
pub async fn update_definition(
    State(state): State<AppState>,
    Path((id, definition_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<DefinitionBody>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let mut definition = state
        .definitions
        .get(definition_id)
        .await?
        .filter(|d| d.platform_id == Some(id))
        .ok_or_else(|| ApiError::not_found("workflow definition"))?;

    definition.name = body.name;
    definition.version = body.version;
    definition.stages = body.stages;
    definition.metadata = body.metadata;
    definition.updated_at = Utc::now();

    let registry = state.service.registry();
    let issues = validate_definition(&definition, |agent_type| {
        registry.validate_agent(agent_type, Some(id)).exists
    });
    if !issues.is_empty() {
        return Err(ApiError::bad_request("definition validation failed")
            .with_details(serde_json::json!({ "issues": issues })));
    }

    state.definitions.update(&definition).await?;
    Ok(Json(definition))
}

#[instrument(skip(state))]
pub async fn remove_definition(
    State(state): State<AppState>,
    Path((id, definition_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let exists = state
        .definitions
        .get(definition_id)
        .await?
        .filter(|d| d.platform_id == Some(id))
        .is_some();
    if !exists {
        return Err(ApiError::not_found("workflow definition"));
    }
    state.definitions.delete(definition_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, body), fields(platform_id = %id))]
pub async fn bind_surface(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<BindSurfaceBody>,
) -> Result<Json<PlatformSurface>, ApiError> {
    if state.platforms.get(id).await?.is_none() {
        return Err(ApiError::not_found("platform"));
    }

    let surface = PlatformSurface {
        id: Uuid::new_v4(),
        platform_id: id,
        surface_type: body.surface_type,
        config: body.config,
        enabled: body.enabled,
    };
    state.platforms.upsert_surface(&surface).await?;
    Ok(Json(surface))
}

#[instrument(skip(state))]
pub async fn list_surfaces(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<PlatformSurface>>, ApiError> {
    if state.platforms.get(id).await?.is_none() {
        return Err(ApiError::not_found("platform"));
    }
    Ok(Json(state.platforms.list_surfaces(id).await?))
}

#[instrument(skip(state))]
pub async fn unbind_surface(
    State(state): State<AppState>,
    Path((id, surface_type)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    let surface_type: SurfaceType =
        serde_json::from_value(serde_json::Value::String(surface_type.clone()))
            .map_err(|_| ApiError::bad_request(format!("unknown surface type {surface_type:?}")))?;

    if state.platforms.delete_surface(id, surface_type).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("platform surface"))
    }
}
