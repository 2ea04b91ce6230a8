//! End-to-end scenarios against the in-memory bus, KV store and store
//! fallback: the full create → dispatch → collect → persist loop with the
//! real results handler subscribed on the results topic.

use chrono::Utc;
use message_bus::{
    results_topic, tasks_topic, InMemoryBus, InMemoryKv, KeyValueStore, MessageBus,
    PublishOptions, SubscriptionSpec,
};
use orchestratord::dispatch::{ResultsHandler, RESULTS_GROUP};
use orchestratord::events::EventPublisher;
use orchestratord::service::{CreateWorkflowRequest, SurfaceContext, WorkflowService};
use orchestratord::watchdog::Watchdog;
use std::sync::Arc;
use uuid::Uuid;
use workflow_engine::{
    AgentRecord, AgentRegistry, Platform, PlatformLayer, PlatformSurface, StageDefinition,
    SurfaceType, TaskStatus, WorkflowDefinition, WorkflowStatus, WorkflowType,
};
use workflow_store::{
    DefinitionRepository, MemoryStore, PlatformRepository, TaskRepository, WorkflowFilter,
    WorkflowRepository,
};

struct Harness {
    service: Arc<WorkflowService>,
    store: Arc<MemoryStore>,
    bus: Arc<InMemoryBus>,
    kv: Arc<InMemoryKv>,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryBus::new(5));
    let kv = Arc::new(InMemoryKv::new());

    let registry = Arc::new(AgentRegistry::new());
    let mut agents: Vec<AgentRecord> = [
        "planning",
        "architecture",
        "scaffold",
        "codegen",
        "validation",
        "testing",
        "deployment",
        "monitoring",
        "ml-training",
    ]
    .iter()
    .map(|t| AgentRecord::global(t))
    .collect();
    agents.push(AgentRecord::global("builder"));
    registry.rebuild(agents);

    let (watchdog, mut timeout_rx) = Watchdog::new();
    let watchdog = Arc::new(watchdog);

    let events = Arc::new(EventPublisher::new(bus.clone() as Arc<dyn MessageBus>));
    let service = Arc::new(WorkflowService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        registry,
        bus.clone(),
        kv.clone(),
        events.clone(),
        watchdog,
        300_000,
    ));

    {
        let service = service.clone();
        tokio::spawn(async move {
            while let Some(fire) = timeout_rx.recv().await {
                let _ = service.handle_timeout(&fire).await;
            }
        });
    }

    bus.subscribe(
        SubscriptionSpec {
            topic: results_topic(),
            group: RESULTS_GROUP.to_string(),
            consumer: "test-consumer".to_string(),
        },
        Arc::new(ResultsHandler::new(service.clone(), events)),
    )
    .await
    .unwrap();

    Harness { service, store, bus, kv }
}

fn bugfix_request(name: &str) -> CreateWorkflowRequest {
    CreateWorkflowRequest {
        name: name.to_string(),
        workflow_type: Some(WorkflowType::Bugfix),
        platform_id: None,
        definition_id: None,
        definition_name: None,
        priority: None,
        input_data: serde_json::json!({ "issue": 42 }),
    }
}

/// Result envelope answering the most recent task published for an agent
/// type, as an agent would produce it.
fn result_for(task_envelope: &serde_json::Value, agent_id: &str, success: bool) -> serde_json::Value {
    let status = if success { "completed" } else { "failed" };
    let mut envelope = serde_json::json!({
        "task_id": task_envelope["task_id"],
        "workflow_id": task_envelope["workflow_id"],
        "agent_id": agent_id,
        "agent_type": task_envelope["agent_type"],
        "success": success,
        "status": status,
        "action": "execute_stage",
        "result": { "output": format!("{}-output", task_envelope["workflow_context"]["current_stage"].as_str().unwrap()) },
        "metrics": { "duration_ms": 1200 },
        "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "version": "1.0.0",
        "stage": task_envelope["workflow_context"]["current_stage"],
    });
    if !success {
        envelope["error"] = serde_json::json!({
            "code": "AGENT_ERROR",
            "message": "stage execution failed",
            "retryable": false,
        });
    }
    envelope
}

fn last_task(bus: &InMemoryBus, agent_type: &str) -> serde_json::Value {
    bus.published(&tasks_topic(agent_type)).last().cloned().expect("task published")
}

async fn wf(h: &Harness, id: Uuid) -> workflow_engine::Workflow {
    WorkflowRepository::get(h.store.as_ref(), id).await.unwrap().expect("workflow exists")
}

async fn all_workflows(h: &Harness) -> Vec<workflow_engine::Workflow> {
    WorkflowRepository::list(h.store.as_ref(), &WorkflowFilter::default()).await.unwrap()
}

async fn answer(harness: &Harness, agent_type: &str, agent_id: &str, success: bool) {
    let task = last_task(&harness.bus, agent_type);
    let result = result_for(&task, agent_id, success);
    harness.bus.publish(&results_topic(), result, PublishOptions::default()).await.unwrap();
}

fn events_of_type(bus: &InMemoryBus, event_type: &str) -> Vec<serde_json::Value> {
    bus.published("events")
        .into_iter()
        .filter(|e| e["event_type"] == event_type)
        .collect()
}

// ---------------------------------------------------------------------
// Scenario A: happy path, legacy 3-stage bugfix.
// ---------------------------------------------------------------------
#[tokio::test]
async fn bugfix_happy_path_runs_all_three_stages() {
    let h = harness().await;
    let workflow =
        h.service.create_workflow(bugfix_request("fix-login"), "tests", None, None).await.unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert_eq!(workflow.current_stage.as_deref(), Some("scaffold"));
    assert_eq!(h.bus.published_count(&tasks_topic("scaffold")), 1);

    answer(&h, "scaffold", "scaffold-1", true).await;
    let mid = wf(&h, workflow.id).await;
    assert_eq!(mid.current_stage.as_deref(), Some("validation"));
    assert_eq!(mid.progress, 33);

    answer(&h, "validation", "validation-1", true).await;
    answer(&h, "deployment", "deployment-1", true).await;

    let done = wf(&h, workflow.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.current_stage, None);
    assert_eq!(done.stage_outputs.len(), 3);
    assert!(done.completed_at.is_some());

    // Three tasks dispatched in order, all spans closed.
    let tasks = h.store.for_workflow(workflow.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(
        tasks.iter().map(|t| t.stage.as_str()).collect::<Vec<_>>(),
        vec!["scaffold", "validation", "deployment"]
    );
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(tasks.iter().all(|t| t.completed_at.is_some()));
    assert!(tasks.iter().all(|t| t.trace_id == done.trace_id));

    // Span parents chain through the workflow's span at publish time.
    assert_eq!(tasks[1].parent_span_id, Some(tasks[0].span_id));
    assert_eq!(tasks[2].parent_span_id, Some(tasks[1].span_id));

    assert_eq!(events_of_type(&h.bus, "workflow.completed").len(), 1);
    assert_eq!(events_of_type(&h.bus, "stage.completed").len(), 3);
}

// ---------------------------------------------------------------------
// Scenario B: duplicate result delivery applies exactly once.
// ---------------------------------------------------------------------
#[tokio::test]
async fn duplicate_result_delivery_is_applied_once() {
    let h = harness().await;
    let workflow =
        h.service.create_workflow(bugfix_request("fix-dup"), "tests", None, None).await.unwrap();

    let task = last_task(&h.bus, "scaffold");
    let result = result_for(&task, "scaffold-1", true);

    h.bus.publish(&results_topic(), result.clone(), PublishOptions::default()).await.unwrap();
    h.bus.publish(&results_topic(), result, PublishOptions::default()).await.unwrap();

    let stored = wf(&h, workflow.id).await;
    // Advanced exactly one stage.
    assert_eq!(stored.current_stage.as_deref(), Some("validation"));
    assert_eq!(stored.stage_outputs.len(), 1);
    assert_eq!(events_of_type(&h.bus, "stage.completed").len(), 1);

    // The dedup record is present in the KV store.
    let task_id: Uuid = task["task_id"].as_str().unwrap().parse().unwrap();
    let event_key = workflow_engine::event_id(
        task_id,
        "scaffold-1",
        workflow_engine::ResultStatus::Completed,
    );
    assert!(h.kv.get(&format!("seen:{event_key}")).await.unwrap().is_some());

    // Nothing was dead-lettered.
    assert!(h.bus.dead_letters(&results_topic()).is_empty());
}

// ---------------------------------------------------------------------
// Scenario C: stage mismatch is rejected by the defensive gate.
// ---------------------------------------------------------------------
#[tokio::test]
async fn misrouted_result_is_rejected_without_state_change() {
    let h = harness().await;
    let workflow =
        h.service.create_workflow(bugfix_request("fix-gate"), "tests", None, None).await.unwrap();

    answer(&h, "scaffold", "scaffold-1", true).await;
    let before = wf(&h, workflow.id).await;
    assert_eq!(before.current_stage.as_deref(), Some("validation"));

    // An agent erroneously reports the already-finished scaffold stage.
    let mut stray = result_for(&last_task(&h.bus, "scaffold"), "rogue-agent", true);
    stray["task_id"] = serde_json::json!(Uuid::new_v4());
    h.bus.publish(&results_topic(), stray, PublishOptions::default()).await.unwrap();

    let after = wf(&h, workflow.id).await;
    assert_eq!(after.version, before.version);
    assert_eq!(after.current_stage.as_deref(), Some("validation"));
    assert_eq!(after.stage_outputs.len(), 1);

    // Acked, not redelivered: no dead letters, no extra stage events.
    assert!(h.bus.dead_letters(&results_topic()).is_empty());
    assert_eq!(events_of_type(&h.bus, "stage.completed").len(), 1);
}

// ---------------------------------------------------------------------
// Scenario D: definition routing with on_failure = "skip".
// ---------------------------------------------------------------------
fn stage(name: &str, agent: &str, on_success: &str, on_failure: &str) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        agent_type: agent.to_string(),
        timeout_ms: 300_000,
        max_retries: 0,
        on_success: on_success.to_string(),
        on_failure: on_failure.to_string(),
        config: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn skip_routing_completes_without_the_failed_stage() {
    let h = harness().await;

    let now = Utc::now();
    let definition = WorkflowDefinition {
        id: Uuid::new_v4(),
        platform_id: None,
        name: "abc-pipeline".to_string(),
        version: "1.0.0".to_string(),
        stages: vec![
            stage("A", "scaffold", "B", "fail"),
            stage("B", "validation", "C", "skip"),
            stage("C", "deployment", "END", "fail"),
        ],
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };
    DefinitionRepository::insert(h.store.as_ref(), &definition).await.unwrap();

    let request = CreateWorkflowRequest {
        name: "skip-run".to_string(),
        workflow_type: None,
        platform_id: None,
        definition_id: None,
        definition_name: Some("abc-pipeline".to_string()),
        priority: None,
        input_data: serde_json::Value::Null,
    };
    let workflow = h.service.create_workflow(request, "tests", None, None).await.unwrap();

    answer(&h, "scaffold", "a-1", true).await;
    let after_a = wf(&h, workflow.id).await;
    assert_eq!(after_a.progress, 33);

    answer(&h, "validation", "b-1", false).await;
    let after_b = wf(&h, workflow.id).await;
    assert_eq!(after_b.status, WorkflowStatus::Running);
    assert_eq!(after_b.current_stage.as_deref(), Some("C"));
    // Skipped stages do not move progress.
    assert_eq!(after_b.progress, 33);

    answer(&h, "deployment", "c-1", true).await;
    let done = wf(&h, workflow.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.stage_outputs.contains_key("A"));
    assert!(done.stage_outputs.contains_key("C"));
    assert!(!done.stage_outputs.contains_key("B"));

    assert_eq!(events_of_type(&h.bus, "stage.failed").len(), 1);
    assert_eq!(events_of_type(&h.bus, "workflow.completed").len(), 1);
}

// ---------------------------------------------------------------------
// Scenario E: surface-binding enforcement.
// ---------------------------------------------------------------------
#[tokio::test]
async fn unbound_surface_is_refused_without_an_orphan_row() {
    let h = harness().await;

    let now = Utc::now();
    let platform = Platform {
        id: Uuid::new_v4(),
        name: "payments".to_string(),
        layer: PlatformLayer::Application,
        enabled: true,
        config: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };
    PlatformRepository::insert(h.store.as_ref(), &platform).await.unwrap();

    let mut request = bugfix_request("surface-check");
    request.platform_id = Some(platform.id);
    let surface = SurfaceContext {
        surface_id: Uuid::new_v4(),
        surface_type: SurfaceType::Rest,
        metadata: serde_json::Value::Null,
    };

    let err = h
        .service
        .create_workflow(request.clone(), "tests", Some(surface.clone()), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("enable the surface"));

    // No orphan workflow row, no task published.
    let rows = all_workflows(&h).await;
    assert!(rows.is_empty());
    assert_eq!(h.bus.published_count(&tasks_topic("scaffold")), 0);

    // Bind the surface and retry: creation now succeeds.
    h.store
        .upsert_surface(&PlatformSurface {
            id: Uuid::new_v4(),
            platform_id: platform.id,
            surface_type: SurfaceType::Rest,
            config: serde_json::Value::Null,
            enabled: true,
        })
        .await
        .unwrap();

    let workflow =
        h.service.create_workflow(request, "tests", Some(surface), None).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert!(workflow.surface_id.is_some());
    assert_eq!(h.bus.published_count(&tasks_topic("scaffold")), 1);
}

// ---------------------------------------------------------------------
// Scenario F: unknown agent type with a near-miss suggestion.
// ---------------------------------------------------------------------
#[tokio::test]
async fn unknown_agent_fails_fast_with_a_suggestion() {
    let h = harness().await;

    let now = Utc::now();
    let definition = WorkflowDefinition {
        id: Uuid::new_v4(),
        platform_id: None,
        name: "training-pipeline".to_string(),
        version: "1.0.0".to_string(),
        stages: vec![stage("train", "ml-trainng", "END", "fail")],
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };
    DefinitionRepository::insert(h.store.as_ref(), &definition).await.unwrap();

    let request = CreateWorkflowRequest {
        name: "train-model".to_string(),
        workflow_type: None,
        platform_id: None,
        definition_id: None,
        definition_name: Some("training-pipeline".to_string()),
        priority: None,
        input_data: serde_json::Value::Null,
    };

    let err = h.service.create_workflow(request, "tests", None, None).await.unwrap_err();
    assert!(err.to_string().contains("Did you mean 'ml-training'?"), "got: {err}");

    let rows = all_workflows(&h).await;
    assert!(rows.is_empty());
    assert_eq!(h.bus.published_count(&tasks_topic("ml-trainng")), 0);
}

// ---------------------------------------------------------------------
// Cancellation, pause/resume, timeouts, retry, idempotency.
// ---------------------------------------------------------------------
#[tokio::test]
async fn late_result_after_cancel_is_absorbed() {
    let h = harness().await;
    let workflow =
        h.service.create_workflow(bugfix_request("fix-cancel"), "tests", None, None).await.unwrap();

    h.service.cancel(workflow.id).await.unwrap();
    let cancelled = wf(&h, workflow.id).await;
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

    // Outstanding task was marked cancelled.
    let tasks = h.store.for_workflow(workflow.id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));

    // The in-flight agent still reports; the result is absorbed but its
    // dedup record is written.
    let task = last_task(&h.bus, "scaffold");
    answer(&h, "scaffold", "scaffold-late", true).await;

    let after = wf(&h, workflow.id).await;
    assert_eq!(after.status, WorkflowStatus::Cancelled);
    assert_eq!(after.version, cancelled.version);
    assert!(after.stage_outputs.is_empty());

    let task_id: Uuid = task["task_id"].as_str().unwrap().parse().unwrap();
    let event_key = workflow_engine::event_id(
        task_id,
        "scaffold-late",
        workflow_engine::ResultStatus::Completed,
    );
    assert!(h.kv.get(&format!("seen:{event_key}")).await.unwrap().is_some());

    // A second cancel is an invalid-state error (409 at the API).
    assert!(h.service.cancel(workflow.id).await.is_err());
}

#[tokio::test]
async fn paused_workflow_queues_results_and_applies_them_on_resume() {
    let h = harness().await;
    let workflow =
        h.service.create_workflow(bugfix_request("fix-pause"), "tests", None, None).await.unwrap();

    h.service.pause(workflow.id).await.unwrap();

    // The in-flight scaffold result arrives while paused: queued, durable.
    answer(&h, "scaffold", "scaffold-1", true).await;
    let paused = wf(&h, workflow.id).await;
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.queued_events.len(), 1);
    assert!(paused.stage_outputs.is_empty());

    h.service.resume(workflow.id).await.unwrap();
    let resumed = wf(&h, workflow.id).await;
    assert_eq!(resumed.status, WorkflowStatus::Running);
    assert!(resumed.queued_events.is_empty());
    // The queued completion advanced the workflow to validation.
    assert_eq!(resumed.current_stage.as_deref(), Some("validation"));
    assert!(resumed.stage_outputs.contains_key("scaffold"));
    assert_eq!(h.bus.published_count(&tasks_topic("validation")), 1);
}

#[tokio::test]
async fn task_timeout_fails_the_stage_and_honors_retry_budget() {
    let h = harness().await;

    let now = Utc::now();
    let mut quick = stage("only", "builder", "END", "fail");
    quick.timeout_ms = 40;
    quick.max_retries = 1;
    let definition = WorkflowDefinition {
        id: Uuid::new_v4(),
        platform_id: None,
        name: "quick".to_string(),
        version: "1.0.0".to_string(),
        stages: vec![quick],
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };
    DefinitionRepository::insert(h.store.as_ref(), &definition).await.unwrap();

    let request = CreateWorkflowRequest {
        name: "timeout-run".to_string(),
        workflow_type: None,
        platform_id: None,
        definition_id: None,
        definition_name: Some("quick".to_string()),
        priority: None,
        input_data: serde_json::Value::Null,
    };
    let workflow = h.service.create_workflow(request, "tests", None, None).await.unwrap();

    // First deadline expires → one retry dispatch; second expires → failed.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let done = wf(&h, workflow.id).await;
    assert_eq!(done.status, WorkflowStatus::Failed);
    let error = done.error.unwrap();
    assert_eq!(error.code, "TIMEOUT");
    assert!(error.retryable);

    // Two attempts were dispatched in total.
    assert_eq!(h.bus.published_count(&tasks_topic("builder")), 2);
    let tasks = h.store.for_workflow(workflow.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Timeout));
}

#[tokio::test]
async fn failed_workflow_can_be_retried_from_the_failed_stage() {
    let h = harness().await;
    let workflow =
        h.service.create_workflow(bugfix_request("fix-retry"), "tests", None, None).await.unwrap();

    answer(&h, "scaffold", "scaffold-1", false).await;
    let failed = wf(&h, workflow.id).await;
    assert_eq!(failed.status, WorkflowStatus::Failed);
    assert_eq!(failed.error.as_ref().unwrap().stage.as_deref(), Some("scaffold"));

    // Retry from an unknown stage is a validation error.
    assert!(h.service.retry(workflow.id, Some("ghost".to_string())).await.is_err());

    h.service.retry(workflow.id, None).await.unwrap();
    let retried = wf(&h, workflow.id).await;
    assert_eq!(retried.status, WorkflowStatus::Running);
    assert_eq!(retried.current_stage.as_deref(), Some("scaffold"));
    assert!(retried.error.is_none());
    assert_eq!(h.bus.published_count(&tasks_topic("scaffold")), 2);

    // The rerun completes normally.
    answer(&h, "scaffold", "scaffold-2", true).await;
    answer(&h, "validation", "validation-1", true).await;
    answer(&h, "deployment", "deployment-1", true).await;
    let done = wf(&h, workflow.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn idempotency_key_refuses_duplicate_creation() {
    let h = harness().await;
    let key = Some("create-once".to_string());

    h.service
        .create_workflow(bugfix_request("fix-idem"), "tests", None, key.clone())
        .await
        .unwrap();
    let err = h
        .service
        .create_workflow(bugfix_request("fix-idem"), "tests", None, key)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("idempotency key"));

    let rows = all_workflows(&h).await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn invalid_result_envelope_is_dead_lettered() {
    let h = harness().await;
    h.service.create_workflow(bugfix_request("fix-poison"), "tests", None, None).await.unwrap();

    // Missing metrics and wrong version: fails validation at the boundary.
    let poison = serde_json::json!({
        "task_id": Uuid::new_v4(),
        "workflow_id": Uuid::new_v4(),
        "agent_id": "bad-agent",
        "agent_type": "scaffold",
        "success": true,
        "status": "completed",
        "action": "x",
        "result": {},
        "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "version": "9.9.9",
        "stage": "scaffold"
    });
    h.bus.publish(&results_topic(), poison, PublishOptions::default()).await.unwrap();

    assert_eq!(h.bus.dead_letters(&results_topic()).len(), 1);
    assert_eq!(events_of_type(&h.bus, "stage.failed").len(), 1);
}
