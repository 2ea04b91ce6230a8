//! Canonical envelope schemas.
//!
//! The orchestrator is the sole producer of task envelopes and the sole
//! consumer of result envelopes; both shapes are validated at the boundary.
//! Payloads stay opaque to the core: only the envelope shell is typed.

use crate::model::{Priority, TaskStatus, WorkflowType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const ENVELOPE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceInfo {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConstraints {
    pub timeout_ms: u64,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub envelope_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_type: Option<WorkflowType>,
    pub current_stage: String,
    /// All prior stage results, so agents never need to query the core.
    pub stage_outputs: BTreeMap<String, serde_json::Value>,
    pub platform_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surface_id: Option<Uuid>,
}

/// Orchestrator → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub constraints: TaskConstraints,
    pub payload: serde_json::Value,
    pub metadata: TaskMetadata,
    pub trace: TraceInfo,
    pub workflow_context: WorkflowContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Partial,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Queued => "queued",
            ResultStatus::Running => "running",
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
            ResultStatus::Cancelled => "cancelled",
            ResultStatus::Timeout => "timeout",
            ResultStatus::Partial => "partial",
        }
    }

    /// Partial results route like success.
    pub fn is_success(&self) -> bool {
        matches!(self, ResultStatus::Completed | ResultStatus::Partial)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub retryable: bool,
}

/// Agent → orchestrator. `stage` names the workflow stage the result belongs
/// to, never the agent type; the defensive gate routes on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_id: String,
    pub agent_type: String,
    pub success: bool,
    pub status: ResultStatus,
    pub action: String,
    /// Opaque payload wrapper; domain data never appears outside it.
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<serde_json::Value>>,
    pub metrics: ResultMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub stage: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "stage.completed")]
    StageCompleted,
    #[serde(rename = "stage.failed")]
    StageFailed,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "workflow.paused")]
    WorkflowPaused,
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "agent.registered")]
    AgentRegistered,
    #[serde(rename = "agent.offline")]
    AgentOffline,
}

/// Orchestrator → observers, broadcast on the events topic and its mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LifecycleEvent {
    pub fn new(
        event_type: EventType,
        workflow_id: Option<Uuid>,
        trace_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self { event_type, workflow_id, trace_id, timestamp: Utc::now(), payload }
    }
}

/// Stable dedup key for a result event: sha1 over task id, agent id and
/// result status. Identical redeliveries always hash to the same id.
pub fn event_id(task_id: Uuid, agent_id: &str, status: ResultStatus) -> String {
    let mut hasher = Sha1::new();
    hasher.update(task_id.as_bytes());
    hasher.update(agent_id.as_bytes());
    hasher.update(status.as_str().as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationFailure {
    pub issues: Vec<String>,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "envelope validation failed: {}", self.issues.join("; "))
    }
}

/// Parse and validate a result envelope from a raw bus payload.
pub fn parse_result_envelope(value: &serde_json::Value) -> Result<ResultEnvelope, ValidationFailure> {
    let envelope: ResultEnvelope = serde_json::from_value(value.clone())
        .map_err(|e| ValidationFailure { issues: vec![format!("malformed result envelope: {e}")] })?;

    let mut issues = Vec::new();
    if envelope.agent_id.trim().is_empty() {
        issues.push("agent_id must be non-empty".to_string());
    }
    if envelope.agent_type.trim().is_empty() {
        issues.push("agent_type must be non-empty".to_string());
    }
    if envelope.stage.trim().is_empty() {
        issues.push("stage must be non-empty".to_string());
    }
    if envelope.version != ENVELOPE_VERSION {
        issues.push(format!(
            "unsupported envelope version {} (expected {ENVELOPE_VERSION})",
            envelope.version
        ));
    }
    if envelope.success && envelope.error.is_some() {
        issues.push("successful result must not carry an error".to_string());
    }
    if !envelope.success && !envelope.status.is_success() && envelope.error.is_none() {
        issues.push("failed result must carry an error".to_string());
    }

    if issues.is_empty() {
        Ok(envelope)
    } else {
        Err(ValidationFailure { issues })
    }
}

/// Validate a task envelope before it leaves the orchestrator.
pub fn validate_task_envelope(envelope: &TaskEnvelope) -> Result<(), ValidationFailure> {
    let mut issues = Vec::new();
    if envelope.agent_type.trim().is_empty() {
        issues.push("agent_type must be non-empty".to_string());
    }
    if envelope.status != TaskStatus::Pending {
        issues.push(format!("task envelope status must be pending, got {}", envelope.status.as_str()));
    }
    if envelope.constraints.timeout_ms == 0 {
        issues.push("constraints.timeout_ms must be positive".to_string());
    }
    if envelope.metadata.envelope_version != ENVELOPE_VERSION {
        issues.push(format!(
            "unsupported envelope version {} (expected {ENVELOPE_VERSION})",
            envelope.metadata.envelope_version
        ));
    }
    if envelope.workflow_context.current_stage.trim().is_empty() {
        issues.push("workflow_context.current_stage must be non-empty".to_string());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure { issues })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> serde_json::Value {
        serde_json::json!({
            "task_id": "7f8d6a10-58f4-4a3c-9b59-47a9f8a1a001",
            "workflow_id": "7f8d6a10-58f4-4a3c-9b59-47a9f8a1a002",
            "agent_id": "scaffold-worker-1",
            "agent_type": "scaffold",
            "success": true,
            "status": "completed",
            "action": "scaffold_project",
            "result": {"files": 12},
            "metrics": {"duration_ms": 1500},
            "timestamp": "2025-01-10T12:00:00.000Z",
            "version": "1.0.0",
            "stage": "scaffold"
        })
    }

    #[test]
    fn result_envelope_round_trips() {
        let value = sample_result();
        let envelope = parse_result_envelope(&value).unwrap();
        assert_eq!(envelope.stage, "scaffold");
        assert_eq!(envelope.metrics.duration_ms, 1500);

        let reserialized = serde_json::to_value(&envelope).unwrap();
        let reparsed = parse_result_envelope(&reserialized).unwrap();
        assert_eq!(reparsed.task_id, envelope.task_id);
        assert_eq!(reparsed.status, envelope.status);
    }

    #[test]
    fn result_envelope_rejects_missing_metrics() {
        let mut value = sample_result();
        value.as_object_mut().unwrap().remove("metrics");
        assert!(parse_result_envelope(&value).is_err());
    }

    #[test]
    fn result_envelope_rejects_wrong_version() {
        let mut value = sample_result();
        value["version"] = serde_json::json!("2.0.0");
        let err = parse_result_envelope(&value).unwrap_err();
        assert!(err.issues[0].contains("unsupported envelope version"));
    }

    #[test]
    fn result_envelope_rejects_empty_agent_id() {
        let mut value = sample_result();
        value["agent_id"] = serde_json::json!("");
        assert!(parse_result_envelope(&value).is_err());
    }

    #[test]
    fn failed_result_requires_error() {
        let mut value = sample_result();
        value["success"] = serde_json::json!(false);
        value["status"] = serde_json::json!("failed");
        assert!(parse_result_envelope(&value).is_err());

        value["error"] = serde_json::json!({
            "code": "CODEGEN_ERROR",
            "message": "compilation failed",
            "retryable": true
        });
        assert!(parse_result_envelope(&value).is_ok());
    }

    #[test]
    fn partial_status_counts_as_success() {
        assert!(ResultStatus::Partial.is_success());
        assert!(ResultStatus::Completed.is_success());
        assert!(!ResultStatus::Failed.is_success());
    }

    #[test]
    fn event_id_is_stable_and_status_sensitive() {
        let task = Uuid::new_v4();
        let a = event_id(task, "agent-1", ResultStatus::Completed);
        let b = event_id(task, "agent-1", ResultStatus::Completed);
        let c = event_id(task, "agent-1", ResultStatus::Failed);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(serde_json::to_string(&EventType::WorkflowCreated).unwrap(), "\"workflow.created\"");
        assert_eq!(serde_json::to_string(&EventType::StageFailed).unwrap(), "\"stage.failed\"");
        assert_eq!(serde_json::to_string(&EventType::AgentOffline).unwrap(), "\"agent.offline\"");
    }
}
