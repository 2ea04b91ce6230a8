//! Workflow lifecycle service: create → dispatch → collect → persist.
//!
//! All workflow mutations funnel through [`WorkflowService::apply_event`]:
//! load the row, run the pure state machine, persist under CAS (retrying the
//! whole compute on version conflicts), then execute the transition's
//! effects exactly once. Result deduplication is cluster-wide through the
//! KV store.

use crate::events::EventPublisher;
use crate::watchdog::{TimeoutFire, Watchdog};
use chrono::Utc;
use message_bus::{tasks_topic, BusError, KeyValueStore, MessageBus, PublishOptions};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use workflow_engine::{
    decide, event_id, first_stage, legacy_definition, validate_task_envelope, AgentTask, Decision,
    Effect, EventType, LifecycleEvent, Priority, QueuedStageEvent, ResultEnvelope, ResultError,
    ResultStatus, SurfaceType, TaskConstraints, TaskEnvelope, TaskMetadata, TaskStatus,
    TraceContext, TraceInfo, Workflow, WorkflowContext, WorkflowDefinition, WorkflowEvent,
    WorkflowStatus, WorkflowType, WorkflowView,
};
use workflow_store::{
    CasResult, DefinitionRepository, PlatformRepository, StageAudit, StoreError, TaskRepository,
    WorkflowRepository,
};

const CAS_ATTEMPTS: u32 = 5;
const CAS_BACKOFF_MS: u64 = 50;
const DEDUP_TTL: Duration = Duration::from_secs(48 * 3600);
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Workflow definition {name} not found")]
    DefinitionNotFound { name: String },

    #[error("Platform {id} not found")]
    PlatformNotFound { id: Uuid },

    #[error("Surface {surface_type:?} is not bound to platform {platform_id}; enable the surface in platform settings")]
    SurfaceNotBound { platform_id: Uuid, surface_type: SurfaceType },

    #[error("Agent type {agent_type:?} is not registered{}", suggestion_text(.suggestion))]
    AgentUnknown { agent_type: String, suggestion: Option<String> },

    #[error("A workflow was already created with idempotency key {key:?}")]
    DuplicateIdempotencyKey { key: String },

    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: Uuid },

    #[error("Operation not valid in the current workflow state: {reason}")]
    InvalidState { reason: &'static str },

    #[error("Stage is not part of the workflow definition")]
    StageNotInDefinition,

    #[error("State update lost {attempts} CAS races for workflow {workflow_id}")]
    CasExhausted { workflow_id: Uuid, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

fn suggestion_text(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(". Did you mean '{s}'?"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub workflow_type: Option<WorkflowType>,
    pub platform_id: Option<Uuid>,
    pub definition_id: Option<Uuid>,
    pub definition_name: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub input_data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SurfaceContext {
    pub surface_id: Uuid,
    pub surface_type: SurfaceType,
    pub metadata: serde_json::Value,
}

/// How a result envelope was ultimately handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    Applied,
    Duplicate,
    LateArrival,
    StageMismatch,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyOutcome {
    Applied,
    Ignored(&'static str),
    Rejected(&'static str),
}

struct ApplyResult {
    outcome: ApplyOutcome,
    replays: Vec<QueuedStageEvent>,
}

struct PreparedDispatch {
    task: AgentTask,
    envelope: TaskEnvelope,
    topic: String,
}

pub struct WorkflowService {
    workflows: Arc<dyn WorkflowRepository>,
    tasks: Arc<dyn TaskRepository>,
    definitions: Arc<dyn DefinitionRepository>,
    platforms: Arc<dyn PlatformRepository>,
    registry: Arc<workflow_engine::AgentRegistry>,
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KeyValueStore>,
    events: Arc<EventPublisher>,
    watchdog: Arc<Watchdog>,
    legacy: HashMap<WorkflowType, WorkflowDefinition>,
    default_timeout_ms: u64,
    instance: String,
}

impl WorkflowService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        tasks: Arc<dyn TaskRepository>,
        definitions: Arc<dyn DefinitionRepository>,
        platforms: Arc<dyn PlatformRepository>,
        registry: Arc<workflow_engine::AgentRegistry>,
        bus: Arc<dyn MessageBus>,
        kv: Arc<dyn KeyValueStore>,
        events: Arc<EventPublisher>,
        watchdog: Arc<Watchdog>,
        default_timeout_ms: u64,
    ) -> Self {
        let legacy = [WorkflowType::App, WorkflowType::Feature, WorkflowType::Bugfix]
            .into_iter()
            .map(|t| (t, legacy_definition(t)))
            .collect();

        Self {
            workflows,
            tasks,
            definitions,
            platforms,
            registry,
            bus,
            kv,
            events,
            watchdog,
            legacy,
            default_timeout_ms,
            instance: format!("orchestrator-{}", Uuid::new_v4()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    pub fn registry(&self) -> &workflow_engine::AgentRegistry {
        &self.registry
    }

    /// Built-in definition for a legacy workflow type.
    pub fn legacy_definition_for(&self, workflow_type: WorkflowType) -> &WorkflowDefinition {
        &self.legacy[&workflow_type]
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    #[instrument(skip(self, request, surface), fields(name = %request.name))]
    pub async fn create_workflow(
        &self,
        request: CreateWorkflowRequest,
        creator: &str,
        surface: Option<SurfaceContext>,
        idempotency_key: Option<String>,
    ) -> Result<Workflow, ServiceError> {
        if request.name.trim().is_empty() {
            return Err(ServiceError::Validation { message: "name must be non-empty".into() });
        }

        let workflow_id = Uuid::new_v4();

        if let Some(key) = &idempotency_key {
            let fresh = self
                .kv
                .set_if_absent(
                    &format!("idem:{key}"),
                    serde_json::json!(workflow_id),
                    Some(IDEMPOTENCY_TTL),
                )
                .await?;
            if !fresh {
                return Err(ServiceError::DuplicateIdempotencyKey { key: key.clone() });
            }
        }

        // Resolve the definition before anything is persisted: validation
        // failures must not leave an orphan workflow row.
        let (definition, is_legacy) = self.resolve_definition(&request).await?;

        if let Some(platform_id) = request.platform_id {
            let platform = self
                .platforms
                .get(platform_id)
                .await?
                .ok_or(ServiceError::PlatformNotFound { id: platform_id })?;
            if !platform.enabled {
                return Err(ServiceError::PlatformNotFound { id: platform_id });
            }

            // Surface-binding enforcement: the trigger channel must exist
            // and be enabled for this platform.
            if let Some(surface) = &surface {
                let binding =
                    self.platforms.get_surface(platform_id, surface.surface_type).await?;
                match binding {
                    Some(binding) if binding.enabled => {}
                    _ => {
                        return Err(ServiceError::SurfaceNotBound {
                            platform_id,
                            surface_type: surface.surface_type,
                        })
                    }
                }
            }
        }

        // Fail fast on an unknown first-stage agent, with a near-miss
        // suggestion in the error.
        let entry_stage = first_stage(&definition)
            .map_err(|e| ServiceError::Validation { message: e.to_string() })?;
        let entry_agent = definition
            .stage(&entry_stage)
            .map(|s| s.agent_type.clone())
            .ok_or(ServiceError::StageNotInDefinition)?;
        let lookup = self.registry.validate_agent(&entry_agent, request.platform_id);
        if !lookup.exists {
            return Err(ServiceError::AgentUnknown {
                agent_type: entry_agent,
                suggestion: lookup.suggestion,
            });
        }

        let trace = TraceContext::new_root();
        let now = Utc::now();
        let workflow = Workflow {
            id: workflow_id,
            platform_id: request.platform_id,
            workflow_definition_id: (!is_legacy).then_some(definition.id),
            surface_id: surface.as_ref().map(|s| s.surface_id),
            name: request.name.clone(),
            workflow_type: request.workflow_type,
            status: WorkflowStatus::Initiated,
            current_stage: None,
            progress: 0,
            priority: request.priority.unwrap_or_default(),
            version: 1,
            stage_outputs: BTreeMap::new(),
            queued_events: Vec::new(),
            error: None,
            trace_id: trace.trace_id,
            current_span_id: Some(trace.span_id),
            input_data: request.input_data.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            created_by: creator.to_string(),
        };

        self.workflows.insert(&workflow).await?;
        info!(workflow_id = %workflow.id, trace_id = %workflow.trace_id, "workflow created");

        self.events
            .publish(LifecycleEvent::new(
                EventType::WorkflowCreated,
                Some(workflow.id),
                workflow.trace_id,
                serde_json::json!({
                    "name": workflow.name,
                    "platform_id": workflow.platform_id,
                    "created_by": creator,
                }),
            ))
            .await;

        let result = self.apply_event(workflow.id, &WorkflowEvent::Start).await?;
        if !matches!(result.outcome, ApplyOutcome::Applied) {
            warn!(workflow_id = %workflow.id, outcome = ?result.outcome, "start did not apply");
        }

        self.workflows
            .get(workflow.id)
            .await?
            .ok_or(ServiceError::WorkflowNotFound { id: workflow.id })
    }

    async fn resolve_definition(
        &self,
        request: &CreateWorkflowRequest,
    ) -> Result<(WorkflowDefinition, bool), ServiceError> {
        if let Some(id) = request.definition_id {
            let definition = self
                .definitions
                .get(id)
                .await?
                .ok_or(ServiceError::DefinitionNotFound { name: id.to_string() })?;
            return Ok((definition, false));
        }
        if let Some(name) = &request.definition_name {
            let definition = self
                .definitions
                .get_by_name(request.platform_id, name)
                .await?
                .ok_or(ServiceError::DefinitionNotFound { name: name.clone() })?;
            return Ok((definition, false));
        }
        let workflow_type = request.workflow_type.ok_or_else(|| ServiceError::Validation {
            message: "either a definition or a legacy workflow type is required".into(),
        })?;
        Ok((self.legacy[&workflow_type].clone(), true))
    }

    async fn definition_for(&self, workflow: &Workflow) -> Result<WorkflowDefinition, ServiceError> {
        if let Some(id) = workflow.workflow_definition_id {
            return self
                .definitions
                .get(id)
                .await?
                .ok_or(ServiceError::DefinitionNotFound { name: id.to_string() });
        }
        let workflow_type = workflow.workflow_type.ok_or_else(|| ServiceError::Validation {
            message: format!("workflow {} has neither definition nor type", workflow.id),
        })?;
        Ok(self.legacy[&workflow_type].clone())
    }

    // ------------------------------------------------------------------
    // Result handling
    // ------------------------------------------------------------------

    #[instrument(skip(self, envelope), fields(workflow_id = %envelope.workflow_id, stage = %envelope.stage, trace_id))]
    pub async fn handle_result(
        &self,
        envelope: &ResultEnvelope,
    ) -> Result<ResultDisposition, ServiceError> {
        // Intermediate statuses are progress reports, not stage outcomes:
        // record them on the task row and stop.
        if matches!(
            envelope.status,
            ResultStatus::Pending | ResultStatus::Queued | ResultStatus::Running
        ) {
            if envelope.status == ResultStatus::Running {
                if let Some(task) = self.tasks.get(envelope.task_id).await? {
                    if !task.status.is_terminal() {
                        self.tasks.mark_running(task.task_id).await?;
                    }
                }
            }
            return Ok(ResultDisposition::Ignored);
        }

        let event_key = event_id(envelope.task_id, &envelope.agent_id, envelope.status);

        // Cluster-wide at-most-once application.
        let fresh = self
            .kv
            .set_if_absent(&format!("seen:{event_key}"), serde_json::json!(1), Some(DEDUP_TTL))
            .await?;
        if !fresh {
            info!(event = "event.ignored", reason = "duplicate", event_id = %event_key);
            return Ok(ResultDisposition::Duplicate);
        }

        let event = if envelope.status.is_success() {
            WorkflowEvent::StageCompleted {
                stage: envelope.stage.clone(),
                result: envelope.result.clone(),
                event_id: event_key.clone(),
            }
        } else {
            let error = envelope.error.clone().unwrap_or_else(|| ResultError {
                code: "AGENT_FAILURE".to_string(),
                message: format!("agent {} reported {}", envelope.agent_id, envelope.status.as_str()),
                details: None,
                stack: None,
                retryable: false,
            });
            WorkflowEvent::StageFailed {
                stage: envelope.stage.clone(),
                error,
                event_id: event_key.clone(),
            }
        };

        let result = self.apply_event(envelope.workflow_id, &event).await?;
        self.replay(envelope.workflow_id, result.replays).await?;

        Ok(match result.outcome {
            ApplyOutcome::Applied => ResultDisposition::Applied,
            ApplyOutcome::Ignored("terminal_state") => {
                info!(event = "event.ignored", reason = "late_arrival", event_id = %event_key);
                ResultDisposition::LateArrival
            }
            ApplyOutcome::Ignored(reason) => {
                info!(event = "event.ignored", reason, event_id = %event_key);
                ResultDisposition::Ignored
            }
            ApplyOutcome::Rejected("stage_mismatch") => {
                warn!(
                    event = "event.rejected",
                    reason = "stage_mismatch",
                    stage = %envelope.stage,
                    "result does not match the workflow's current stage"
                );
                ResultDisposition::StageMismatch
            }
            ApplyOutcome::Rejected(reason) => {
                warn!(event = "event.rejected", reason);
                ResultDisposition::Ignored
            }
        })
    }

    // ------------------------------------------------------------------
    // Operator signals
    // ------------------------------------------------------------------

    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), ServiceError> {
        self.signal(workflow_id, &WorkflowEvent::Cancel).await
    }

    pub async fn pause(&self, workflow_id: Uuid) -> Result<(), ServiceError> {
        self.signal(workflow_id, &WorkflowEvent::Pause).await
    }

    pub async fn resume(&self, workflow_id: Uuid) -> Result<(), ServiceError> {
        self.signal(workflow_id, &WorkflowEvent::Resume).await
    }

    pub async fn retry(
        &self,
        workflow_id: Uuid,
        from_stage: Option<String>,
    ) -> Result<(), ServiceError> {
        self.signal(workflow_id, &WorkflowEvent::Retry { from_stage }).await
    }

    async fn signal(&self, workflow_id: Uuid, event: &WorkflowEvent) -> Result<(), ServiceError> {
        let result = self.apply_event(workflow_id, event).await?;
        self.replay(workflow_id, result.replays).await?;
        match result.outcome {
            ApplyOutcome::Applied => Ok(()),
            ApplyOutcome::Ignored(_) => Ok(()),
            ApplyOutcome::Rejected("stage_not_in_definition") => {
                Err(ServiceError::StageNotInDefinition)
            }
            ApplyOutcome::Rejected(reason) => Err(ServiceError::InvalidState { reason }),
        }
    }

    /// Synthetic stage failure from the watchdog. Idempotent: the dedup
    /// record absorbs double fires across replicas and restarts.
    #[instrument(skip(self, fire), fields(task_id = %fire.task_id))]
    pub async fn handle_timeout(&self, fire: &TimeoutFire) -> Result<(), ServiceError> {
        let Some(task) = self.tasks.get(fire.task_id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        let key = format!("seen:timeout:{}:{}", fire.task_id, task.retry_count);
        if !self.kv.set_if_absent(&key, serde_json::json!(1), Some(DEDUP_TTL)).await? {
            return Ok(());
        }

        warn!(workflow_id = %fire.workflow_id, stage = %fire.stage, "task deadline exceeded");
        let event =
            WorkflowEvent::Timeout { task_id: fire.task_id, stage: fire.stage.clone() };
        let result = self.apply_event(fire.workflow_id, &event).await?;
        self.replay(fire.workflow_id, result.replays).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Core apply loop
    // ------------------------------------------------------------------

    async fn apply_event(
        &self,
        workflow_id: Uuid,
        event: &WorkflowEvent,
    ) -> Result<ApplyResult, ServiceError> {
        for _attempt in 0..CAS_ATTEMPTS {
            let Some(workflow) = self.workflows.get(workflow_id).await? else {
                return Err(ServiceError::WorkflowNotFound { id: workflow_id });
            };
            let definition = self.definition_for(&workflow).await?;
            let view = self.view_of(&workflow, event).await?;

            let transition = match decide(&view, &definition, event) {
                Decision::Ignored { reason } => {
                    return Ok(ApplyResult { outcome: ApplyOutcome::Ignored(reason), replays: vec![] })
                }
                Decision::Rejected { reason } => {
                    return Ok(ApplyResult {
                        outcome: ApplyOutcome::Rejected(reason),
                        replays: vec![],
                    })
                }
                Decision::Transition(transition) => *transition,
            };

            let mut updated = workflow.clone();
            transition.update.apply_to(&mut updated);

            // Pre-build dispatches so the new span is persisted in the same
            // CAS write that commits the transition.
            let mut dispatches = Vec::new();
            for effect in &transition.effects {
                if let Effect::DispatchStage { stage, agent_type, retry_count } = effect {
                    let prepared = self.prepare_dispatch(
                        &updated,
                        &definition,
                        stage,
                        agent_type,
                        *retry_count,
                    )?;
                    updated.current_span_id = Some(prepared.task.span_id);
                    dispatches.push(prepared);
                }
            }

            match self.workflows.update_cas(&updated, workflow.version).await? {
                CasResult::Applied { version } => {
                    updated.version = version;
                    let replays =
                        self.execute_effects(&updated, transition.effects, dispatches).await?;
                    return Ok(ApplyResult { outcome: ApplyOutcome::Applied, replays });
                }
                CasResult::VersionMismatch => {
                    let jitter = rand::thread_rng().gen_range(0..CAS_BACKOFF_MS / 2);
                    tokio::time::sleep(Duration::from_millis(CAS_BACKOFF_MS + jitter)).await;
                    continue;
                }
                CasResult::NotFound => {
                    return Ok(ApplyResult {
                        outcome: ApplyOutcome::Ignored("workflow_missing"),
                        replays: vec![],
                    })
                }
            }
        }

        error!(workflow_id = %workflow_id, "CAS retry budget exhausted");
        Err(ServiceError::CasExhausted { workflow_id, attempts: CAS_ATTEMPTS })
    }

    async fn view_of(
        &self,
        workflow: &Workflow,
        event: &WorkflowEvent,
    ) -> Result<WorkflowView, ServiceError> {
        let event_stage = match event {
            WorkflowEvent::StageCompleted { stage, .. }
            | WorkflowEvent::StageFailed { stage, .. }
            | WorkflowEvent::Timeout { stage, .. } => Some(stage.as_str()),
            _ => None,
        };

        let retry_count = match event_stage {
            Some(stage) => self
                .tasks
                .active_for_stage(workflow.id, stage)
                .await?
                .map(|t| t.retry_count)
                .unwrap_or(0),
            None => 0,
        };

        Ok(WorkflowView {
            status: workflow.status,
            current_stage: workflow.current_stage.clone(),
            progress: workflow.progress,
            completed_stages: workflow.completed_stages(),
            queued_events: workflow.queued_events.clone(),
            error: workflow.error.clone(),
            retry_count,
        })
    }

    fn prepare_dispatch(
        &self,
        workflow: &Workflow,
        definition: &WorkflowDefinition,
        stage: &str,
        agent_type: &str,
        retry_count: u32,
    ) -> Result<PreparedDispatch, ServiceError> {
        let stage_def =
            definition.stage(stage).ok_or(ServiceError::StageNotInDefinition)?;

        let timeout_ms = if stage_def.timeout_ms > 0 {
            stage_def.timeout_ms
        } else {
            self.default_timeout_ms
        };

        let task_id = Uuid::new_v4();
        let span_id = Uuid::new_v4();
        let parent_span_id = workflow.current_span_id;
        let now = Utc::now();

        let payload = serde_json::json!({
            "input": workflow.input_data,
            "stage_config": stage_def.config,
        });

        let task = AgentTask {
            id: Uuid::new_v4(),
            task_id,
            workflow_id: workflow.id,
            stage: stage.to_string(),
            agent_type: agent_type.to_string(),
            status: TaskStatus::Pending,
            priority: workflow.priority,
            payload: payload.clone(),
            result: None,
            trace_id: workflow.trace_id,
            span_id,
            parent_span_id,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_count,
            max_retries: stage_def.max_retries,
            timeout_ms,
            created_at: now,
            updated_at: now,
        };

        let envelope = TaskEnvelope {
            message_id: Uuid::new_v4(),
            task_id,
            workflow_id: workflow.id,
            agent_type: agent_type.to_string(),
            priority: workflow.priority,
            status: TaskStatus::Pending,
            constraints: TaskConstraints {
                timeout_ms,
                max_retries: stage_def.max_retries,
                required_confidence: None,
            },
            payload,
            metadata: TaskMetadata {
                created_at: now,
                created_by: workflow.created_by.clone(),
                envelope_version: workflow_engine::ENVELOPE_VERSION.to_string(),
            },
            trace: TraceInfo { trace_id: workflow.trace_id, span_id, parent_span_id },
            workflow_context: WorkflowContext {
                workflow_type: workflow.workflow_type,
                current_stage: stage.to_string(),
                stage_outputs: workflow.stage_outputs.clone(),
                platform_id: workflow.platform_id,
                surface_id: workflow.surface_id,
            },
        };

        validate_task_envelope(&envelope)
            .map_err(|e| ServiceError::Validation { message: e.to_string() })?;

        Ok(PreparedDispatch {
            task,
            envelope,
            topic: tasks_topic(agent_type),
        })
    }

    async fn execute_effects(
        &self,
        workflow: &Workflow,
        effects: Vec<Effect>,
        mut dispatches: Vec<PreparedDispatch>,
    ) -> Result<Vec<QueuedStageEvent>, ServiceError> {
        let mut replays = Vec::new();
        let mut dispatch_queue = dispatches.drain(..).collect::<std::collections::VecDeque<_>>();

        for effect in effects {
            match effect {
                Effect::CompleteTask { stage, status, result } => {
                    if let Some(task) = self.tasks.active_for_stage(workflow.id, &stage).await? {
                        self.tasks.complete(task.task_id, status, result.clone()).await?;
                        self.watchdog.disarm(task.task_id);
                    }
                    let outcome = match status {
                        TaskStatus::Completed => "completed",
                        TaskStatus::Timeout => "timeout",
                        _ => "failed",
                    };
                    self.workflows
                        .record_stage_audit(&StageAudit {
                            id: Uuid::new_v4(),
                            workflow_id: workflow.id,
                            stage,
                            outcome: outcome.to_string(),
                            detail: result.unwrap_or(serde_json::Value::Null),
                            created_at: Utc::now(),
                        })
                        .await?;
                }
                Effect::Publish { event_type, payload } => {
                    self.events
                        .publish(LifecycleEvent::new(
                            event_type,
                            Some(workflow.id),
                            workflow.trace_id,
                            payload,
                        ))
                        .await;
                }
                Effect::DispatchStage { .. } => {
                    let Some(prepared) = dispatch_queue.pop_front() else {
                        error!(workflow_id = %workflow.id, "dispatch effect without prepared task");
                        continue;
                    };
                    self.execute_dispatch(workflow, prepared).await?;
                }
                Effect::CancelOutstandingTasks => {
                    let cancelled = self.tasks.cancel_open_for_workflow(workflow.id).await?;
                    if cancelled > 0 {
                        info!(workflow_id = %workflow.id, cancelled, "outstanding tasks cancelled");
                    }
                }
                Effect::CancelTimers => {
                    self.watchdog.disarm_workflow(workflow.id);
                }
                Effect::ReplayQueued { events } => {
                    replays.extend(events);
                }
            }
        }

        Ok(replays)
    }

    async fn execute_dispatch(
        &self,
        workflow: &Workflow,
        prepared: PreparedDispatch,
    ) -> Result<(), ServiceError> {
        let PreparedDispatch { task, envelope, topic } = prepared;

        self.tasks.insert(&task).await?;

        let payload = serde_json::to_value(&envelope)
            .map_err(|e| ServiceError::Validation { message: e.to_string() })?;
        self.bus
            .publish(&topic, payload, PublishOptions { mirror: true, ttl: None })
            .await?;

        self.events
            .publish(LifecycleEvent::new(
                EventType::TaskCreated,
                Some(workflow.id),
                workflow.trace_id,
                serde_json::json!({
                    "task_id": task.task_id,
                    "stage": task.stage,
                    "agent_type": task.agent_type,
                    "retry_count": task.retry_count,
                }),
            ))
            .await;

        self.watchdog.arm(
            task.task_id,
            workflow.id,
            task.stage.clone(),
            Duration::from_millis(task.timeout_ms),
        );

        info!(
            workflow_id = %workflow.id,
            task_id = %task.task_id,
            stage = %task.stage,
            agent_type = %task.agent_type,
            trace_id = %workflow.trace_id,
            "task dispatched"
        );
        Ok(())
    }

    /// Apply stage events that were queued while the workflow was paused.
    /// Replayed events already passed dedup at first arrival.
    async fn replay(
        &self,
        workflow_id: Uuid,
        queued: Vec<QueuedStageEvent>,
    ) -> Result<(), ServiceError> {
        for entry in queued {
            let event = if entry.success {
                WorkflowEvent::StageCompleted {
                    stage: entry.stage.clone(),
                    result: entry.payload.clone(),
                    event_id: entry.event_id.clone(),
                }
            } else {
                let error =
                    serde_json::from_value(entry.payload.clone()).unwrap_or_else(|_| ResultError {
                        code: "AGENT_FAILURE".to_string(),
                        message: "queued failure".to_string(),
                        details: None,
                        stack: None,
                        retryable: false,
                    });
                WorkflowEvent::StageFailed {
                    stage: entry.stage.clone(),
                    error,
                    event_id: entry.event_id.clone(),
                }
            };

            let result = self.apply_event(workflow_id, &event).await?;
            if let ApplyOutcome::Rejected(reason) = result.outcome {
                warn!(workflow_id = %workflow_id, reason, "queued event rejected on replay");
            }
            // Replays of replays cannot happen: stage events never queue
            // replays of their own.
            debug_assert!(result.replays.is_empty());
        }
        Ok(())
    }

    /// Overdue scan backing the watchdog across restarts.
    pub async fn scan_overdue_tasks(&self) -> Result<usize, ServiceError> {
        let overdue = self.tasks.overdue(Utc::now()).await?;
        let count = overdue.len();
        for task in overdue {
            self.handle_timeout(&TimeoutFire {
                task_id: task.task_id,
                workflow_id: task.workflow_id,
                stage: task.stage.clone(),
            })
            .await?;
        }
        Ok(count)
    }
}
