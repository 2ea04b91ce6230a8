use super::{enum_text, parse_enum, PgStore};
use crate::repo::TaskRepository;
use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;
use workflow_engine::{AgentTask, TaskStatus};

fn task_from_row(row: &PgRow) -> Result<AgentTask, StoreError> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    let timeout_ms: i64 = row.try_get("timeout_ms")?;

    Ok(AgentTask {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        workflow_id: row.try_get("workflow_id")?,
        stage: row.try_get("stage")?,
        agent_type: row.try_get("agent_type")?,
        status: parse_enum(&status, "status")?,
        priority: parse_enum(&priority, "priority")?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        trace_id: row.try_get("trace_id")?,
        span_id: row.try_get("span_id")?,
        parent_span_id: row.try_get("parent_span_id")?,
        assigned_at: row.try_get("assigned_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        timeout_ms: timeout_ms.max(0) as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const TASK_COLUMNS: &str = "id, task_id, workflow_id, stage, agent_type, status, priority, \
     payload, result, trace_id, span_id, parent_span_id, assigned_at, started_at, completed_at, \
     retry_count, max_retries, timeout_ms, created_at, updated_at";

#[async_trait]
impl TaskRepository for PgStore {
    #[instrument(skip(self, task), fields(task_id = %task.task_id, stage = %task.stage))]
    async fn insert(&self, task: &AgentTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_tasks (id, task_id, workflow_id, stage, agent_type, status,
                                     priority, payload, result, trace_id, span_id,
                                     parent_span_id, assigned_at, started_at, completed_at,
                                     retry_count, max_retries, timeout_ms, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20)
            "#,
        )
        .bind(task.id)
        .bind(task.task_id)
        .bind(task.workflow_id)
        .bind(&task.stage)
        .bind(&task.agent_type)
        .bind(enum_text(&task.status)?)
        .bind(enum_text(&task.priority)?)
        .bind(&task.payload)
        .bind(&task.result)
        .bind(task.trace_id)
        .bind(task.span_id)
        .bind(task.parent_span_id)
        .bind(task.assigned_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.timeout_ms as i64)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, task_id: Uuid) -> Result<Option<AgentTask>, StoreError> {
        let row =
            sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM agent_tasks WHERE task_id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn for_workflow(&self, workflow_id: Uuid) -> Result<Vec<AgentTask>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE workflow_id = $1 ORDER BY created_at"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn mark_running(&self, task_id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE agent_tasks
            SET status = 'running',
                assigned_at = COALESCE(assigned_at, $2),
                started_at = COALESCE(started_at, $2),
                updated_at = $2
            WHERE task_id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout')
            "#,
        )
        .bind(task_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, result))]
    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE agent_tasks
            SET status = $2, result = COALESCE($3, result), completed_at = $4, updated_at = $4
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(enum_text(&status)?)
        .bind(result)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "task", id: task_id.to_string() });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn active_for_stage(
        &self,
        workflow_id: Uuid,
        stage: &str,
    ) -> Result<Option<AgentTask>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks \
             WHERE workflow_id = $1 AND stage = $2 \
               AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout') \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(workflow_id)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn cancel_open_for_workflow(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE agent_tasks
            SET status = 'cancelled', completed_at = $2, updated_at = $2
            WHERE workflow_id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout')
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<AgentTask>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks \
             WHERE status NOT IN ('completed', 'failed', 'cancelled', 'timeout') \
               AND created_at + (timeout_ms * interval '1 millisecond') < $1"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }
}
