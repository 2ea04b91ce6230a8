use super::{enum_text, parse_enum, PgStore};
use crate::repo::{CasResult, StageAudit, WorkflowFilter, WorkflowRepository};
use crate::StoreError;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;
use workflow_engine::Workflow;

fn workflow_from_row(row: &PgRow) -> Result<Workflow, StoreError> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let workflow_type: Option<String> = row.try_get("workflow_type")?;
    let progress: i16 = row.try_get("progress")?;

    Ok(Workflow {
        id: row.try_get("id")?,
        platform_id: row.try_get("platform_id")?,
        workflow_definition_id: row.try_get("workflow_definition_id")?,
        surface_id: row.try_get("surface_id")?,
        name: row.try_get("name")?,
        workflow_type: workflow_type
            .map(|t| parse_enum(&t, "workflow_type"))
            .transpose()?,
        status: parse_enum(&status, "status")?,
        current_stage: row.try_get("current_stage")?,
        progress: progress.clamp(0, 100) as u8,
        priority: parse_enum(&priority, "priority")?,
        version: row.try_get("version")?,
        stage_outputs: serde_json::from_value(row.try_get("stage_outputs")?)?,
        queued_events: serde_json::from_value(row.try_get("queued_events")?)?,
        error: row
            .try_get::<Option<serde_json::Value>, _>("error")?
            .map(serde_json::from_value)
            .transpose()?,
        trace_id: row.try_get("trace_id")?,
        current_span_id: row.try_get("current_span_id")?,
        input_data: row.try_get("input_data")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        created_by: row.try_get("created_by")?,
    })
}

const WORKFLOW_COLUMNS: &str = "id, platform_id, workflow_definition_id, surface_id, name, \
     workflow_type, status, current_stage, progress, priority, version, stage_outputs, \
     queued_events, error, trace_id, current_span_id, input_data, created_at, updated_at, \
     completed_at, created_by";

#[async_trait]
impl WorkflowRepository for PgStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn insert(&self, workflow: &Workflow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, platform_id, workflow_definition_id, surface_id, name,
                                   workflow_type, status, current_stage, progress, priority,
                                   version, stage_outputs, queued_events, error, trace_id,
                                   current_span_id, input_data, created_at, updated_at,
                                   completed_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.platform_id)
        .bind(workflow.workflow_definition_id)
        .bind(workflow.surface_id)
        .bind(&workflow.name)
        .bind(workflow.workflow_type.as_ref().map(enum_text).transpose()?)
        .bind(enum_text(&workflow.status)?)
        .bind(&workflow.current_stage)
        .bind(workflow.progress as i16)
        .bind(enum_text(&workflow.priority)?)
        .bind(workflow.version)
        .bind(serde_json::to_value(&workflow.stage_outputs)?)
        .bind(serde_json::to_value(&workflow.queued_events)?)
        .bind(workflow.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(workflow.trace_id)
        .bind(workflow.current_span_id)
        .bind(&workflow.input_data)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .bind(workflow.completed_at)
        .bind(&workflow.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| workflow_from_row(&r)).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>, StoreError> {
        let query = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE ($1::text IS NULL OR status = $1) \
             AND ($2::text IS NULL OR workflow_type = $2) \
             AND ($3::uuid IS NULL OR platform_id = $3) \
             AND ($4::uuid IS NULL OR trace_id = $4) \
             ORDER BY created_at DESC LIMIT $5 OFFSET $6"
        );

        let rows = sqlx::query(&query)
            .bind(filter.status.as_ref().map(enum_text).transpose()?)
            .bind(filter.workflow_type.as_ref().map(enum_text).transpose()?)
            .bind(filter.platform_id)
            .bind(filter.trace_id)
            .bind(filter.effective_limit())
            .bind(filter.offset.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id, expected_version))]
    async fn update_cas(
        &self,
        workflow: &Workflow,
        expected_version: i64,
    ) -> Result<CasResult, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = $3, current_stage = $4, progress = $5, version = version + 1,
                stage_outputs = $6, queued_events = $7, error = $8, current_span_id = $9,
                updated_at = $10, completed_at = $11
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(workflow.id)
        .bind(expected_version)
        .bind(enum_text(&workflow.status)?)
        .bind(&workflow.current_stage)
        .bind(workflow.progress as i16)
        .bind(serde_json::to_value(&workflow.stage_outputs)?)
        .bind(serde_json::to_value(&workflow.queued_events)?)
        .bind(workflow.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(workflow.current_span_id)
        .bind(workflow.updated_at)
        .bind(workflow.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CasResult::Applied { version: expected_version + 1 });
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM workflows WHERE id = $1")
            .bind(workflow.id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match exists {
            Some(_) => CasResult::VersionMismatch,
            None => CasResult::NotFound,
        })
    }

    #[instrument(skip(self, audit), fields(workflow_id = %audit.workflow_id, stage = %audit.stage))]
    async fn record_stage_audit(&self, audit: &StageAudit) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_stages (id, workflow_id, stage, outcome, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(audit.id)
        .bind(audit.workflow_id)
        .bind(&audit.stage)
        .bind(&audit.outcome)
        .bind(&audit.detail)
        .bind(audit.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stage_audits(&self, workflow_id: Uuid) -> Result<Vec<StageAudit>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, stage, outcome, detail, created_at \
             FROM workflow_stages WHERE workflow_id = $1 ORDER BY created_at",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StageAudit {
                    id: row.try_get("id")?,
                    workflow_id: row.try_get("workflow_id")?,
                    stage: row.try_get("stage")?,
                    outcome: row.try_get("outcome")?,
                    detail: row.try_get("detail")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
