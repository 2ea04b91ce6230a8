//! Repository ports. One trait per aggregate; adapters must preserve the
//! CAS contract on workflow rows.

use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use workflow_engine::{
    AgentRecord, AgentTask, Platform, PlatformSurface, SurfaceType, TaskStatus, Workflow,
    WorkflowDefinition, WorkflowStatus, WorkflowType,
};

/// Result of a version-checked workflow write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    Applied { version: i64 },
    VersionMismatch,
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub workflow_type: Option<WorkflowType>,
    pub platform_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl WorkflowFilter {
    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            50
        } else {
            self.limit.min(500)
        }
    }
}

/// Per-stage audit row, written whenever a stage event is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAudit {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub stage: String,
    /// "completed", "failed", "skipped" or "retried".
    pub outcome: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn insert(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>, StoreError>;

    /// Persist the given row state if and only if the stored version still
    /// equals `expected_version`; the stored version increments on success.
    async fn update_cas(
        &self,
        workflow: &Workflow,
        expected_version: i64,
    ) -> Result<CasResult, StoreError>;

    async fn record_stage_audit(&self, audit: &StageAudit) -> Result<(), StoreError>;

    async fn stage_audits(&self, workflow_id: Uuid) -> Result<Vec<StageAudit>, StoreError>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &AgentTask) -> Result<(), StoreError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<AgentTask>, StoreError>;

    async fn for_workflow(&self, workflow_id: Uuid) -> Result<Vec<AgentTask>, StoreError>;

    /// Record that an agent picked the task up and is executing it.
    async fn mark_running(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Close a task with a terminal status; sets `completed_at`, which also
    /// closes the task's span.
    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// The non-terminal task for a (workflow, stage), if any. At most one
    /// exists at a time.
    async fn active_for_stage(
        &self,
        workflow_id: Uuid,
        stage: &str,
    ) -> Result<Option<AgentTask>, StoreError>;

    /// Mark every non-terminal task of a workflow cancelled. Returns how
    /// many were affected.
    async fn cancel_open_for_workflow(&self, workflow_id: Uuid) -> Result<u64, StoreError>;

    /// Non-terminal tasks whose deadline has passed; drives the restart-safe
    /// side of the timeout watchdog.
    async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<AgentTask>, StoreError>;
}

#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    async fn insert(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn get_by_name(
        &self,
        platform_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn list(&self, platform_id: Option<Uuid>) -> Result<Vec<WorkflowDefinition>, StoreError>;

    async fn update(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait PlatformRepository: Send + Sync {
    async fn insert(&self, platform: &Platform) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Platform>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Platform>, StoreError>;

    async fn list(&self) -> Result<Vec<Platform>, StoreError>;

    async fn update(&self, platform: &Platform) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn upsert_surface(&self, surface: &PlatformSurface) -> Result<(), StoreError>;

    async fn get_surface(
        &self,
        platform_id: Uuid,
        surface_type: SurfaceType,
    ) -> Result<Option<PlatformSurface>, StoreError>;

    async fn list_surfaces(&self, platform_id: Uuid) -> Result<Vec<PlatformSurface>, StoreError>;

    async fn delete_surface(
        &self,
        platform_id: Uuid,
        surface_type: SurfaceType,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn upsert(&self, record: &AgentRecord) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<AgentRecord>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsPeriod {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl StatsPeriod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1h" => Some(StatsPeriod::Hour),
            "24h" => Some(StatsPeriod::Day),
            "7d" => Some(StatsPeriod::Week),
            "30d" => Some(StatsPeriod::Month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsOverview {
    pub total_workflows: i64,
    pub workflows_by_status: BTreeMap<String, i64>,
    pub total_tasks: i64,
    pub avg_workflow_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentTypeStats {
    pub agent_type: String,
    pub total_tasks: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeBucket {
    pub bucket: DateTime<Utc>,
    pub created: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRollup {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub task_count: i64,
    pub duration_ms: Option<i64>,
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn overview(&self) -> Result<StatsOverview, StoreError>;

    async fn agents(&self) -> Result<Vec<AgentTypeStats>, StoreError>;

    async fn timeseries(&self, period: StatsPeriod) -> Result<Vec<TimeBucket>, StoreError>;

    async fn workflows(&self) -> Result<Vec<WorkflowRollup>, StoreError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub span_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub name: String,
    /// "workflow" for the root span, "task" for stage spans.
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
}

/// Spans are a view over workflow and task rows, not a separate table.
#[async_trait]
pub trait SpanRepository: Send + Sync {
    async fn traces(&self, limit: i64, offset: i64) -> Result<Vec<TraceSummary>, StoreError>;

    async fn trace(&self, trace_id: Uuid) -> Result<Option<TraceSummary>, StoreError>;

    async fn spans(&self, trace_id: Uuid) -> Result<Vec<SpanRecord>, StoreError>;
}
