//! Aggregate and tracing queries. Spans are derived from workflow and task
//! rows; there is no separate spans table.

use super::{parse_enum, PgStore};
use crate::repo::{
    AgentTypeStats, SpanRecord, SpanRepository, StatsOverview, StatsPeriod, StatsRepository,
    TimeBucket, TraceSummary, WorkflowRollup,
};
use crate::StoreError;
use async_trait::async_trait;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::instrument;
use uuid::Uuid;

impl StatsPeriod {
    fn window_and_bucket(&self) -> (&'static str, &'static str) {
        match self {
            StatsPeriod::Hour => ("1 hour", "minute"),
            StatsPeriod::Day => ("24 hours", "hour"),
            StatsPeriod::Week => ("7 days", "day"),
            StatsPeriod::Month => ("30 days", "day"),
        }
    }
}

#[async_trait]
impl StatsRepository for PgStore {
    #[instrument(skip(self))]
    async fn overview(&self) -> Result<StatsOverview, StoreError> {
        let status_rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM workflows GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workflows_by_status = BTreeMap::new();
        let mut total_workflows = 0i64;
        for row in &status_rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            total_workflows += count;
            workflows_by_status.insert(status, count);
        }

        let totals = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM agent_tasks) AS total_tasks, \
             (SELECT AVG(EXTRACT(EPOCH FROM (completed_at - created_at)) * 1000.0)::double precision \
              FROM workflows WHERE completed_at IS NOT NULL) AS avg_duration_ms",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatsOverview {
            total_workflows,
            workflows_by_status,
            total_tasks: totals.try_get("total_tasks")?,
            avg_workflow_duration_ms: totals.try_get("avg_duration_ms")?,
        })
    }

    #[instrument(skip(self))]
    async fn agents(&self) -> Result<Vec<AgentTypeStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT agent_type,
                   COUNT(*) AS total_tasks,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status IN ('failed', 'timeout')) AS failed,
                   (AVG(EXTRACT(EPOCH FROM (completed_at - created_at)) * 1000.0)
                       FILTER (WHERE completed_at IS NOT NULL))::double precision AS avg_duration_ms
            FROM agent_tasks
            GROUP BY agent_type
            ORDER BY agent_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AgentTypeStats {
                    agent_type: row.try_get("agent_type")?,
                    total_tasks: row.try_get("total_tasks")?,
                    completed: row.try_get("completed")?,
                    failed: row.try_get("failed")?,
                    avg_duration_ms: row.try_get("avg_duration_ms")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn timeseries(&self, period: StatsPeriod) -> Result<Vec<TimeBucket>, StoreError> {
        let (window, bucket) = period.window_and_bucket();
        let query = format!(
            "SELECT date_trunc('{bucket}', created_at) AS bucket, \
                    COUNT(*) AS created, \
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed \
             FROM workflows \
             WHERE created_at > NOW() - interval '{window}' \
             GROUP BY bucket ORDER BY bucket"
        );

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(TimeBucket {
                    bucket: row.try_get("bucket")?,
                    created: row.try_get("created")?,
                    completed: row.try_get("completed")?,
                    failed: row.try_get("failed")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn workflows(&self) -> Result<Vec<WorkflowRollup>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT w.id, w.name, w.status,
                   COUNT(t.id) AS task_count,
                   CASE WHEN w.completed_at IS NOT NULL
                        THEN (EXTRACT(EPOCH FROM (w.completed_at - w.created_at)) * 1000.0)::bigint
                   END AS duration_ms
            FROM workflows w
            LEFT JOIN agent_tasks t ON t.workflow_id = w.id
            GROUP BY w.id, w.name, w.status, w.completed_at, w.created_at
            ORDER BY w.created_at DESC
            LIMIT 200
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(WorkflowRollup {
                    workflow_id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    status: parse_enum(&status, "status")?,
                    task_count: row.try_get("task_count")?,
                    duration_ms: row.try_get("duration_ms")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SpanRepository for PgStore {
    #[instrument(skip(self))]
    async fn traces(&self, limit: i64, offset: i64) -> Result<Vec<TraceSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT w.trace_id, w.id AS workflow_id, w.name, w.status, w.created_at,
                   w.completed_at,
                   1 + (SELECT COUNT(*) FROM agent_tasks t WHERE t.trace_id = w.trace_id)
                       AS span_count
            FROM workflows w
            ORDER BY w.created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(if limit <= 0 { 50 } else { limit.min(500) })
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(TraceSummary {
                    trace_id: row.try_get("trace_id")?,
                    workflow_id: row.try_get("workflow_id")?,
                    workflow_name: row.try_get("name")?,
                    status: parse_enum(&status, "status")?,
                    started_at: row.try_get("created_at")?,
                    completed_at: row.try_get("completed_at")?,
                    span_count: row.try_get("span_count")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn trace(&self, trace_id: Uuid) -> Result<Option<TraceSummary>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT w.trace_id, w.id AS workflow_id, w.name, w.status, w.created_at,
                   w.completed_at,
                   1 + (SELECT COUNT(*) FROM agent_tasks t WHERE t.trace_id = w.trace_id)
                       AS span_count
            FROM workflows w
            WHERE w.trace_id = $1
            "#,
        )
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status: String = row.try_get("status")?;
            Ok(TraceSummary {
                trace_id: row.try_get("trace_id")?,
                workflow_id: row.try_get("workflow_id")?,
                workflow_name: row.try_get("name")?,
                status: parse_enum(&status, "status")?,
                started_at: row.try_get("created_at")?,
                completed_at: row.try_get("completed_at")?,
                span_count: row.try_get("span_count")?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn spans(&self, trace_id: Uuid) -> Result<Vec<SpanRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT current_span_id AS span_id, NULL::uuid AS parent_span_id, trace_id,
                   name, 'workflow' AS kind, created_at AS started_at, completed_at,
                   status
            FROM workflows
            WHERE trace_id = $1 AND current_span_id IS NOT NULL
            UNION ALL
            SELECT span_id, parent_span_id, trace_id, stage AS name, 'task' AS kind,
                   created_at AS started_at, completed_at, status
            FROM agent_tasks
            WHERE trace_id = $1
            ORDER BY started_at
            "#,
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SpanRecord {
                    span_id: row.try_get("span_id")?,
                    parent_span_id: row.try_get("parent_span_id")?,
                    trace_id: row.try_get("trace_id")?,
                    name: row.try_get("name")?,
                    kind: row.try_get("kind")?,
                    started_at: row.try_get("started_at")?,
                    completed_at: row.try_get("completed_at")?,
                    status: row.try_get("status")?,
                })
            })
            .collect()
    }
}
