//! Persistent domain model: platforms, definitions, surfaces, workflows and
//! agent tasks. All identifiers are opaque UUIDs; enums serialize as
//! lower_snake strings on the wire and in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A named orchestration tenant. Owns workflow definitions and surface
/// bindings, and optionally platform-scoped agent types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub id: Uuid,
    pub name: String,
    pub layer: PlatformLayer,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformLayer {
    Application,
    Data,
    Infrastructure,
    Enterprise,
}

/// A trigger channel bound to a platform. Workflow creation through a
/// surface is only allowed while the binding exists and is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSurface {
    pub id: Uuid,
    pub platform_id: Uuid,
    pub surface_type: SurfaceType,
    pub config: serde_json::Value,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    Rest,
    Webhook,
    Cli,
    Dashboard,
    MobileApi,
}

impl SurfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceType::Rest => "rest",
            SurfaceType::Webhook => "webhook",
            SurfaceType::Cli => "cli",
            SurfaceType::Dashboard => "dashboard",
            SurfaceType::MobileApi => "mobile_api",
        }
    }
}

/// One node of a definition: an agent binding plus routing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub agent_type: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Next stage name, or "END".
    pub on_success: String,
    /// "fail", "skip", or an explicit stage name to jump to.
    pub on_failure: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A named, versioned DAG of stages owned by a platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub platform_id: Option<Uuid>,
    pub name: String,
    pub version: String,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initiated,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Initiated => "initiated",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

/// Legacy workflow kind; selects a built-in definition when no explicit
/// definition id is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    App,
    Feature,
    Bugfix,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::App => "app",
            WorkflowType::Feature => "feature",
            WorkflowType::Bugfix => "bugfix",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// First fatal error of a failed workflow, surfaced through the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    pub code: String,
    pub message: String,
    pub stage: Option<String>,
    pub retryable: bool,
}

/// A stage result that arrived while the workflow was paused. Persisted on
/// the workflow row and replayed in arrival order on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedStageEvent {
    pub event_id: String,
    pub stage: String,
    pub success: bool,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// A single workflow execution. The persisted row is the authoritative FSM
/// state; every mutation goes through a version-checked CAS update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub platform_id: Option<Uuid>,
    pub workflow_definition_id: Option<Uuid>,
    pub surface_id: Option<Uuid>,
    pub name: String,
    #[serde(rename = "type")]
    pub workflow_type: Option<WorkflowType>,
    pub status: WorkflowStatus,
    pub current_stage: Option<String>,
    pub progress: u8,
    pub priority: Priority,
    /// Monotonic CAS counter; increments on every persisted change.
    pub version: i64,
    /// Results of completed stages, keyed by stage name. BTreeMap keeps
    /// serialization stable for the byte-identical terminal-row invariant.
    pub stage_outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub queued_events: Vec<QueuedStageEvent>,
    pub error: Option<WorkflowError>,
    pub trace_id: Uuid,
    pub current_span_id: Option<Uuid>,
    pub input_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl Workflow {
    pub fn completed_stages(&self) -> Vec<String> {
        self.stage_outputs.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }
}

/// One attempted execution of one stage. At most one non-terminal task per
/// (workflow, stage) exists at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub stage: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_serialize_lower_snake() {
        assert_eq!(serde_json::to_string(&WorkflowStatus::Initiated).unwrap(), "\"initiated\"");
        assert_eq!(serde_json::to_string(&SurfaceType::MobileApi).unwrap(), "\"mobile_api\"");
        assert_eq!(serde_json::to_string(&TaskStatus::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(serde_json::to_string(&PlatformLayer::Enterprise).unwrap(), "\"enterprise\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }

    #[test]
    fn workflow_type_round_trips() {
        let parsed: WorkflowType = serde_json::from_str("\"bugfix\"").unwrap();
        assert_eq!(parsed, WorkflowType::Bugfix);
        assert_eq!(parsed.as_str(), "bugfix");
    }
}
