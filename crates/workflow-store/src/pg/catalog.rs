//! Platform, definition, surface and agent-registry tables.

use super::{enum_text, parse_enum, PgStore};
use crate::repo::{AgentRepository, DefinitionRepository, PlatformRepository};
use crate::StoreError;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;
use workflow_engine::{
    AgentRecord, Platform, PlatformSurface, SurfaceType, WorkflowDefinition,
};

fn platform_from_row(row: &PgRow) -> Result<Platform, StoreError> {
    let layer: String = row.try_get("layer")?;
    Ok(Platform {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        layer: parse_enum(&layer, "layer")?,
        enabled: row.try_get("enabled")?,
        config: row.try_get("config")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, StoreError> {
    Ok(WorkflowDefinition {
        id: row.try_get("id")?,
        platform_id: row.try_get("platform_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        stages: serde_json::from_value(row.try_get("stages")?)?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn surface_from_row(row: &PgRow) -> Result<PlatformSurface, StoreError> {
    let surface_type: String = row.try_get("surface_type")?;
    Ok(PlatformSurface {
        id: row.try_get("id")?,
        platform_id: row.try_get("platform_id")?,
        surface_type: parse_enum(&surface_type, "surface_type")?,
        config: row.try_get("config")?,
        enabled: row.try_get("enabled")?,
    })
}

fn unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl PlatformRepository for PgStore {
    #[instrument(skip(self, platform), fields(name = %platform.name))]
    async fn insert(&self, platform: &Platform) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO platforms (id, name, layer, enabled, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(platform.id)
        .bind(&platform.name)
        .bind(enum_text(&platform.layer)?)
        .bind(platform.enabled)
        .bind(&platform.config)
        .bind(platform.created_at)
        .bind(platform.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                StoreError::Conflict { message: format!("platform {} already exists", platform.name) }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<Platform>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, layer, enabled, config, created_at, updated_at \
             FROM platforms WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| platform_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_name(&self, name: &str) -> Result<Option<Platform>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, layer, enabled, config, created_at, updated_at \
             FROM platforms WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| platform_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Platform>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, layer, enabled, config, created_at, updated_at \
             FROM platforms ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(platform_from_row).collect()
    }

    #[instrument(skip(self, platform), fields(platform_id = %platform.id))]
    async fn update(&self, platform: &Platform) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE platforms
            SET name = $2, layer = $3, enabled = $4, config = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(platform.id)
        .bind(&platform.name)
        .bind(enum_text(&platform.layer)?)
        .bind(platform.enabled)
        .bind(&platform.config)
        .bind(platform.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "platform", id: platform.id.to_string() });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM platforms WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, surface), fields(platform_id = %surface.platform_id))]
    async fn upsert_surface(&self, surface: &PlatformSurface) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO platform_surfaces (id, platform_id, surface_type, config, enabled)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (platform_id, surface_type)
            DO UPDATE SET config = EXCLUDED.config, enabled = EXCLUDED.enabled
            "#,
        )
        .bind(surface.id)
        .bind(surface.platform_id)
        .bind(surface.surface_type.as_str())
        .bind(&surface.config)
        .bind(surface.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_surface(
        &self,
        platform_id: Uuid,
        surface_type: SurfaceType,
    ) -> Result<Option<PlatformSurface>, StoreError> {
        let row = sqlx::query(
            "SELECT id, platform_id, surface_type, config, enabled \
             FROM platform_surfaces WHERE platform_id = $1 AND surface_type = $2",
        )
        .bind(platform_id)
        .bind(surface_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| surface_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list_surfaces(&self, platform_id: Uuid) -> Result<Vec<PlatformSurface>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, platform_id, surface_type, config, enabled \
             FROM platform_surfaces WHERE platform_id = $1 ORDER BY surface_type",
        )
        .bind(platform_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(surface_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn delete_surface(
        &self,
        platform_id: Uuid,
        surface_type: SurfaceType,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM platform_surfaces WHERE platform_id = $1 AND surface_type = $2",
        )
        .bind(platform_id)
        .bind(surface_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DefinitionRepository for PgStore {
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    async fn insert(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, platform_id, name, version, stages, metadata,
                                              created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(definition.id)
        .bind(definition.platform_id)
        .bind(&definition.name)
        .bind(&definition.version)
        .bind(serde_json::to_value(&definition.stages)?)
        .bind(&definition.metadata)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                StoreError::Conflict {
                    message: format!("definition {} already exists for platform", definition.name),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT id, platform_id, name, version, stages, metadata, created_at, updated_at \
             FROM workflow_definitions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| definition_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_name(
        &self,
        platform_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT id, platform_id, name, version, stages, metadata, created_at, updated_at \
             FROM workflow_definitions \
             WHERE platform_id IS NOT DISTINCT FROM $1 AND name = $2",
        )
        .bind(platform_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| definition_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, platform_id: Option<Uuid>) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, platform_id, name, version, stages, metadata, created_at, updated_at \
             FROM workflow_definitions \
             WHERE $1::uuid IS NULL OR platform_id = $1 \
             ORDER BY name",
        )
        .bind(platform_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(definition_from_row).collect()
    }

    #[instrument(skip(self, definition), fields(definition_id = %definition.id))]
    async fn update(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_definitions
            SET name = $2, version = $3, stages = $4, metadata = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(&definition.version)
        .bind(serde_json::to_value(&definition.stages)?)
        .bind(&definition.metadata)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "workflow_definition",
                id: definition.id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AgentRepository for PgStore {
    #[instrument(skip(self, record), fields(agent_type = %record.agent_type))]
    async fn upsert(&self, record: &AgentRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, agent_type, platform_id, enabled, heartbeat_interval_secs,
                                last_heartbeat, online)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (COALESCE(platform_id, '00000000-0000-0000-0000-000000000000'::uuid), agent_type)
            DO UPDATE SET enabled = EXCLUDED.enabled,
                          heartbeat_interval_secs = EXCLUDED.heartbeat_interval_secs,
                          last_heartbeat = EXCLUDED.last_heartbeat,
                          online = EXCLUDED.online
            "#,
        )
        .bind(record.id)
        .bind(&record.agent_type)
        .bind(record.platform_id)
        .bind(record.enabled)
        .bind(record.heartbeat_interval_secs as i64)
        .bind(record.last_heartbeat)
        .bind(record.online)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, agent_type, platform_id, enabled, heartbeat_interval_secs, \
             last_heartbeat, online FROM agents",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let interval: i64 = row.try_get("heartbeat_interval_secs")?;
                Ok(AgentRecord {
                    id: row.try_get("id")?,
                    agent_type: row.try_get("agent_type")?,
                    platform_id: row.try_get("platform_id")?,
                    enabled: row.try_get("enabled")?,
                    heartbeat_interval_secs: interval.max(0) as u64,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                    online: row.try_get("online")?,
                })
            })
            .collect()
    }
}
