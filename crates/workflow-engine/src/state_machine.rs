//! Per-workflow state machine.
//!
//! The persisted row is the authoritative state; [`decide`] is a pure
//! function from (persisted view, definition, event) to a row update plus a
//! set of effects. Deduplication and the CAS write loop live in the caller,
//! which makes every transition here unit-testable without I/O.

use crate::definition::{calculate_progress, first_stage, next_stage, Route, StageOutcome};
use crate::envelope::{EventType, ResultError};
use crate::model::{
    QueuedStageEvent, TaskStatus, WorkflowDefinition, WorkflowError, WorkflowStatus,
};
use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Start,
    StageCompleted { stage: String, result: serde_json::Value, event_id: String },
    StageFailed { stage: String, error: ResultError, event_id: String },
    Pause,
    Resume,
    Cancel,
    Retry { from_stage: Option<String> },
    Timeout { task_id: Uuid, stage: String },
}

/// What the state machine reads from the persisted workflow plus the active
/// task attempt.
#[derive(Debug, Clone)]
pub struct WorkflowView {
    pub status: WorkflowStatus,
    pub current_stage: Option<String>,
    pub progress: u8,
    pub completed_stages: Vec<String>,
    pub queued_events: Vec<QueuedStageEvent>,
    pub error: Option<WorkflowError>,
    /// Retry count of the in-flight task for the current stage.
    pub retry_count: u32,
}

/// Field-level patch applied to the workflow row under CAS.
#[derive(Debug, Clone)]
pub struct WorkflowUpdate {
    pub status: WorkflowStatus,
    pub current_stage: Option<String>,
    pub progress: u8,
    pub record_output: Option<(String, serde_json::Value)>,
    pub error: Option<WorkflowError>,
    pub clear_error: bool,
    pub queued_events: Option<Vec<QueuedStageEvent>>,
    pub mark_completed: bool,
    pub clear_completed: bool,
}

impl WorkflowUpdate {
    fn carry(view: &WorkflowView) -> Self {
        Self {
            status: view.status,
            current_stage: view.current_stage.clone(),
            progress: view.progress,
            record_output: None,
            error: None,
            clear_error: false,
            queued_events: None,
            mark_completed: false,
            clear_completed: false,
        }
    }

    /// Fold this patch into a loaded workflow row. The caller persists the
    /// result under CAS; the version bump happens at the store.
    pub fn apply_to(&self, workflow: &mut crate::model::Workflow) {
        let now = Utc::now();
        workflow.status = self.status;
        workflow.current_stage = self.current_stage.clone();
        workflow.progress = self.progress;
        if let Some((stage, output)) = &self.record_output {
            workflow.stage_outputs.insert(stage.clone(), output.clone());
        }
        if self.clear_error {
            workflow.error = None;
        }
        if let Some(error) = &self.error {
            workflow.error = Some(error.clone());
        }
        if let Some(queued) = &self.queued_events {
            workflow.queued_events = queued.clone();
        }
        if self.mark_completed {
            workflow.completed_at = Some(now);
        }
        if self.clear_completed {
            workflow.completed_at = None;
        }
        workflow.updated_at = now;
    }
}

#[derive(Debug, Clone)]
pub enum Effect {
    /// Build and publish a task envelope for this stage.
    DispatchStage { stage: String, agent_type: String, retry_count: u32 },
    /// Emit a workflow lifecycle event.
    Publish { event_type: EventType, payload: serde_json::Value },
    /// Close the active task row for this stage (its span closes with it).
    CompleteTask { stage: String, status: TaskStatus, result: Option<serde_json::Value> },
    /// Mark all outstanding tasks cancelled.
    CancelOutstandingTasks,
    /// Disarm timeout watchdogs for this workflow.
    CancelTimers,
    /// Re-apply stage events queued during a pause, in arrival order.
    ReplayQueued { events: Vec<QueuedStageEvent> },
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub update: WorkflowUpdate,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Transition(Box<Transition>),
    /// No state change, no error: terminal absorption, stale timers.
    Ignored { reason: &'static str },
    /// Invalid for the current state; surfaced to the caller.
    Rejected { reason: &'static str },
}

impl Decision {
    fn transition(update: WorkflowUpdate, effects: Vec<Effect>) -> Self {
        Decision::Transition(Box::new(Transition { update, effects }))
    }
}

pub fn decide(view: &WorkflowView, def: &WorkflowDefinition, event: &WorkflowEvent) -> Decision {
    match event {
        WorkflowEvent::Start => start(view, def),
        WorkflowEvent::StageCompleted { stage, result, event_id } => {
            stage_settled(view, def, stage, event_id, Settled::Success(result.clone()))
        }
        WorkflowEvent::StageFailed { stage, error, event_id } => {
            stage_settled(view, def, stage, event_id, Settled::Failure(error.clone()))
        }
        WorkflowEvent::Timeout { task_id, stage } => {
            if view.status.is_terminal() {
                return Decision::Ignored { reason: "terminal_state" };
            }
            if view.current_stage.as_deref() != Some(stage.as_str()) {
                // The result beat the timer; nothing to do.
                return Decision::Ignored { reason: "stale_timeout" };
            }
            let error = ResultError {
                code: "TIMEOUT".to_string(),
                message: format!("task {task_id} exceeded its deadline"),
                details: None,
                stack: None,
                retryable: true,
            };
            let event_id = format!("timeout:{task_id}:{}", view.retry_count);
            stage_settled(view, def, stage, &event_id, Settled::Timeout(error))
        }
        WorkflowEvent::Pause => pause(view),
        WorkflowEvent::Resume => resume(view),
        WorkflowEvent::Cancel => cancel(view),
        WorkflowEvent::Retry { from_stage } => retry(view, def, from_stage.as_deref()),
    }
}

fn start(view: &WorkflowView, def: &WorkflowDefinition) -> Decision {
    if view.status != WorkflowStatus::Initiated {
        return Decision::Ignored { reason: "already_started" };
    }
    let Ok(entry) = first_stage(def) else {
        return Decision::Rejected { reason: "empty_definition" };
    };
    let Some(stage_def) = def.stage(&entry) else {
        return Decision::Rejected { reason: "unknown_entry_stage" };
    };

    let mut update = WorkflowUpdate::carry(view);
    update.status = WorkflowStatus::Running;
    update.current_stage = Some(entry.clone());
    update.progress = 0;

    Decision::transition(
        update,
        vec![
            Effect::Publish {
                event_type: EventType::WorkflowStarted,
                payload: serde_json::json!({ "first_stage": entry }),
            },
            Effect::DispatchStage {
                stage: entry,
                agent_type: stage_def.agent_type.clone(),
                retry_count: 0,
            },
        ],
    )
}

enum Settled {
    Success(serde_json::Value),
    Failure(ResultError),
    Timeout(ResultError),
}

fn stage_settled(
    view: &WorkflowView,
    def: &WorkflowDefinition,
    stage: &str,
    event_id: &str,
    settled: Settled,
) -> Decision {
    if view.status.is_terminal() {
        return Decision::Ignored { reason: "terminal_state" };
    }

    if view.status == WorkflowStatus::Paused {
        // Durable pause: the result is queued and applied on resume.
        let mut queued = view.queued_events.clone();
        let (success, payload) = match &settled {
            Settled::Success(result) => (true, result.clone()),
            Settled::Failure(error) | Settled::Timeout(error) => {
                (false, serde_json::to_value(error).unwrap_or_default())
            }
        };
        queued.push(QueuedStageEvent {
            event_id: event_id.to_string(),
            stage: stage.to_string(),
            success,
            payload,
            received_at: Utc::now(),
        });
        let mut update = WorkflowUpdate::carry(view);
        update.queued_events = Some(queued);
        return Decision::transition(update, Vec::new());
    }

    if view.status != WorkflowStatus::Running {
        return Decision::Rejected { reason: "not_running" };
    }

    // Defensive gate: results for any stage other than the current one are
    // agent misrouting and must not touch state.
    if view.current_stage.as_deref() != Some(stage) {
        return Decision::Rejected { reason: "stage_mismatch" };
    }

    let Some(stage_def) = def.stage(stage) else {
        return Decision::Rejected { reason: "stage_not_in_definition" };
    };

    match settled {
        Settled::Success(result) => stage_succeeded(view, def, stage, result),
        Settled::Failure(error) => {
            stage_failed(view, def, stage, error, TaskStatus::Failed, stage_def.max_retries)
        }
        Settled::Timeout(error) => {
            stage_failed(view, def, stage, error, TaskStatus::Timeout, stage_def.max_retries)
        }
    }
}

fn stage_succeeded(
    view: &WorkflowView,
    def: &WorkflowDefinition,
    stage: &str,
    result: serde_json::Value,
) -> Decision {
    let route = match next_stage(def, stage, StageOutcome::Success) {
        Ok(route) => route,
        Err(_) => return Decision::Rejected { reason: "stage_not_in_definition" },
    };

    let mut completed = view.completed_stages.clone();
    completed.push(stage.to_string());

    let mut update = WorkflowUpdate::carry(view);
    update.record_output = Some((stage.to_string(), result.clone()));

    let mut effects = vec![
        Effect::CompleteTask {
            stage: stage.to_string(),
            status: TaskStatus::Completed,
            result: Some(result),
        },
        Effect::Publish {
            event_type: EventType::StageCompleted,
            payload: serde_json::json!({ "stage": stage }),
        },
    ];

    match route {
        Route::Stage(next) => {
            let Some(next_def) = def.stage(&next) else {
                return Decision::Rejected { reason: "route_target_missing" };
            };
            update.status = WorkflowStatus::Running;
            update.current_stage = Some(next.clone());
            update.progress = calculate_progress(def, &completed);
            effects.push(Effect::DispatchStage {
                stage: next,
                agent_type: next_def.agent_type.clone(),
                retry_count: 0,
            });
        }
        Route::End => {
            update.status = WorkflowStatus::Completed;
            update.current_stage = None;
            update.progress = 100;
            update.mark_completed = true;
            effects.push(Effect::Publish {
                event_type: EventType::WorkflowCompleted,
                payload: serde_json::json!({ "final_stage": stage }),
            });
            effects.push(Effect::CancelTimers);
        }
        Route::Fail => return Decision::Rejected { reason: "invalid_success_route" },
    }

    Decision::transition(update, effects)
}

fn stage_failed(
    view: &WorkflowView,
    def: &WorkflowDefinition,
    stage: &str,
    error: ResultError,
    task_status: TaskStatus,
    max_retries: u32,
) -> Decision {
    // Retry budget first: a retryable failure re-dispatches the same stage
    // before on_failure routing is consulted.
    if error.retryable && view.retry_count < max_retries {
        let Some(stage_def) = def.stage(stage) else {
            return Decision::Rejected { reason: "stage_not_in_definition" };
        };
        let update = WorkflowUpdate::carry(view);
        return Decision::transition(
            update,
            vec![
                Effect::CompleteTask { stage: stage.to_string(), status: task_status, result: None },
                Effect::Publish {
                    event_type: EventType::TaskFailed,
                    payload: serde_json::json!({
                        "stage": stage,
                        "error": error,
                        "attempt": view.retry_count + 1,
                    }),
                },
                Effect::DispatchStage {
                    stage: stage.to_string(),
                    agent_type: stage_def.agent_type.clone(),
                    retry_count: view.retry_count + 1,
                },
            ],
        );
    }

    let route = match next_stage(def, stage, StageOutcome::Failure) {
        Ok(route) => route,
        Err(_) => return Decision::Rejected { reason: "stage_not_in_definition" },
    };

    let mut update = WorkflowUpdate::carry(view);
    let mut effects = vec![
        Effect::CompleteTask { stage: stage.to_string(), status: task_status, result: None },
        Effect::Publish {
            event_type: EventType::StageFailed,
            payload: serde_json::json!({ "stage": stage, "error": error }),
        },
    ];

    match route {
        Route::Fail => {
            update.status = WorkflowStatus::Failed;
            update.error = Some(WorkflowError {
                code: error.code.clone(),
                message: error.message.clone(),
                stage: Some(stage.to_string()),
                retryable: error.retryable,
            });
            update.mark_completed = true;
            effects.push(Effect::Publish {
                event_type: EventType::WorkflowFailed,
                payload: serde_json::json!({ "stage": stage, "error": error }),
            });
            effects.push(Effect::CancelTimers);
        }
        Route::Stage(next) => {
            let Some(next_def) = def.stage(&next) else {
                return Decision::Rejected { reason: "route_target_missing" };
            };
            update.status = WorkflowStatus::Running;
            update.current_stage = Some(next.clone());
            effects.push(Effect::DispatchStage {
                stage: next,
                agent_type: next_def.agent_type.clone(),
                retry_count: 0,
            });
        }
        Route::End => {
            // on_failure = "skip" on the last stage: the workflow still
            // completes successfully.
            update.status = WorkflowStatus::Completed;
            update.current_stage = None;
            update.progress = 100;
            update.mark_completed = true;
            effects.push(Effect::Publish {
                event_type: EventType::WorkflowCompleted,
                payload: serde_json::json!({ "final_stage": stage, "skipped_failure": true }),
            });
            effects.push(Effect::CancelTimers);
        }
    }

    Decision::transition(update, effects)
}

fn pause(view: &WorkflowView) -> Decision {
    if view.status.is_terminal() {
        return Decision::Rejected { reason: "already_terminal" };
    }
    if view.status == WorkflowStatus::Paused {
        return Decision::Ignored { reason: "already_paused" };
    }

    let mut update = WorkflowUpdate::carry(view);
    update.status = WorkflowStatus::Paused;
    Decision::transition(
        update,
        vec![Effect::Publish {
            event_type: EventType::WorkflowPaused,
            payload: serde_json::Value::Null,
        }],
    )
}

fn resume(view: &WorkflowView) -> Decision {
    if view.status != WorkflowStatus::Paused {
        return Decision::Rejected { reason: "not_paused" };
    }

    let mut update = WorkflowUpdate::carry(view);
    update.status = WorkflowStatus::Running;
    update.queued_events = Some(Vec::new());

    let mut effects = vec![Effect::Publish {
        event_type: EventType::WorkflowResumed,
        payload: serde_json::json!({ "queued_events": view.queued_events.len() }),
    }];
    if !view.queued_events.is_empty() {
        effects.push(Effect::ReplayQueued { events: view.queued_events.clone() });
    }

    Decision::transition(update, effects)
}

fn cancel(view: &WorkflowView) -> Decision {
    if view.status.is_terminal() {
        return Decision::Rejected { reason: "already_terminal" };
    }

    // Progress freezes at its current value.
    let mut update = WorkflowUpdate::carry(view);
    update.status = WorkflowStatus::Cancelled;
    update.mark_completed = true;

    Decision::transition(
        update,
        vec![
            Effect::Publish {
                event_type: EventType::WorkflowCancelled,
                payload: serde_json::Value::Null,
            },
            Effect::CancelOutstandingTasks,
            Effect::CancelTimers,
        ],
    )
}

fn retry(view: &WorkflowView, def: &WorkflowDefinition, from_stage: Option<&str>) -> Decision {
    if view.status != WorkflowStatus::Failed {
        return Decision::Rejected { reason: "retry_requires_failed_state" };
    }

    let target = from_stage
        .map(str::to_string)
        .or_else(|| view.error.as_ref().and_then(|e| e.stage.clone()))
        .or_else(|| view.current_stage.clone());

    let Some(target) = target else {
        return Decision::Rejected { reason: "no_retry_stage" };
    };
    let Some(stage_def) = def.stage(&target) else {
        return Decision::Rejected { reason: "stage_not_in_definition" };
    };

    let mut update = WorkflowUpdate::carry(view);
    update.status = WorkflowStatus::Running;
    update.current_stage = Some(target.clone());
    update.clear_error = true;
    update.clear_completed = true;

    Decision::transition(
        update,
        vec![
            Effect::Publish {
                event_type: EventType::WorkflowResumed,
                payload: serde_json::json!({ "reason": "retry", "from_stage": target }),
            },
            Effect::DispatchStage {
                stage: target,
                agent_type: stage_def.agent_type.clone(),
                retry_count: 0,
            },
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageDefinition;

    fn stage(name: &str, on_success: &str, on_failure: &str, max_retries: u32) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            agent_type: name.to_string(),
            timeout_ms: 1000,
            max_retries,
            on_success: on_success.to_string(),
            on_failure: on_failure.to_string(),
            config: serde_json::Value::Null,
        }
    }

    fn three_stage_def() -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::new_v4(),
            platform_id: None,
            name: "abc".to_string(),
            version: "1.0.0".to_string(),
            stages: vec![
                stage("a", "b", "fail", 0),
                stage("b", "c", "skip", 0),
                stage("c", "END", "fail", 0),
            ],
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    fn running_at(stage_name: &str) -> WorkflowView {
        WorkflowView {
            status: WorkflowStatus::Running,
            current_stage: Some(stage_name.to_string()),
            progress: 0,
            completed_stages: vec![],
            queued_events: vec![],
            error: None,
            retry_count: 0,
        }
    }

    fn completed(stage_name: &str) -> WorkflowEvent {
        WorkflowEvent::StageCompleted {
            stage: stage_name.to_string(),
            result: serde_json::json!({ "ok": true }),
            event_id: format!("evt-{stage_name}"),
        }
    }

    fn failed(stage_name: &str, retryable: bool) -> WorkflowEvent {
        WorkflowEvent::StageFailed {
            stage: stage_name.to_string(),
            error: ResultError {
                code: "AGENT_ERROR".to_string(),
                message: "boom".to_string(),
                details: None,
                stack: None,
                retryable,
            },
            event_id: format!("evt-fail-{stage_name}"),
        }
    }

    fn expect_transition(decision: Decision) -> Transition {
        match decision {
            Decision::Transition(t) => *t,
            other => panic!("expected transition, got {other:?}"),
        }
    }

    fn has_dispatch(effects: &[Effect], expected_stage: &str) -> bool {
        effects.iter().any(
            |e| matches!(e, Effect::DispatchStage { stage, .. } if stage == expected_stage),
        )
    }

    fn has_event(effects: &[Effect], expected: EventType) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Publish { event_type, .. } if *event_type == expected))
    }

    #[test]
    fn start_dispatches_entry_stage() {
        let def = three_stage_def();
        let view = WorkflowView {
            status: WorkflowStatus::Initiated,
            current_stage: None,
            progress: 0,
            completed_stages: vec![],
            queued_events: vec![],
            error: None,
            retry_count: 0,
        };

        let t = expect_transition(decide(&view, &def, &WorkflowEvent::Start));
        assert_eq!(t.update.status, WorkflowStatus::Running);
        assert_eq!(t.update.current_stage.as_deref(), Some("a"));
        assert!(has_dispatch(&t.effects, "a"));
        assert!(has_event(&t.effects, EventType::WorkflowStarted));
    }

    #[test]
    fn stage_completion_advances_and_updates_progress() {
        let def = three_stage_def();
        let t = expect_transition(decide(&running_at("a"), &def, &completed("a")));

        assert_eq!(t.update.status, WorkflowStatus::Running);
        assert_eq!(t.update.current_stage.as_deref(), Some("b"));
        assert_eq!(t.update.progress, 33);
        assert_eq!(t.update.record_output.as_ref().unwrap().0, "a");
        assert!(has_dispatch(&t.effects, "b"));
        assert!(has_event(&t.effects, EventType::StageCompleted));
    }

    #[test]
    fn final_stage_completes_the_workflow_at_100() {
        let def = three_stage_def();
        let mut view = running_at("c");
        view.completed_stages = vec!["a".to_string(), "b".to_string()];
        view.progress = 67;

        let t = expect_transition(decide(&view, &def, &completed("c")));
        assert_eq!(t.update.status, WorkflowStatus::Completed);
        assert_eq!(t.update.current_stage, None);
        assert_eq!(t.update.progress, 100);
        assert!(t.update.mark_completed);
        assert!(has_event(&t.effects, EventType::WorkflowCompleted));
    }

    #[test]
    fn single_stage_definition_completes_from_entry() {
        let now = Utc::now();
        let def = WorkflowDefinition {
            id: Uuid::new_v4(),
            platform_id: None,
            name: "single".to_string(),
            version: "1.0.0".to_string(),
            stages: vec![stage("only", "END", "fail", 0)],
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };

        let t = expect_transition(decide(&running_at("only"), &def, &completed("only")));
        assert_eq!(t.update.status, WorkflowStatus::Completed);
        assert_eq!(t.update.progress, 100);
    }

    #[test]
    fn stage_mismatch_is_rejected_without_state_change() {
        let def = three_stage_def();
        let decision = decide(&running_at("b"), &def, &completed("a"));
        assert!(matches!(decision, Decision::Rejected { reason: "stage_mismatch" }));
    }

    #[test]
    fn terminal_workflows_absorb_stage_events() {
        let def = three_stage_def();
        let mut view = running_at("c");
        view.status = WorkflowStatus::Completed;
        assert!(matches!(
            decide(&view, &def, &completed("c")),
            Decision::Ignored { reason: "terminal_state" }
        ));

        view.status = WorkflowStatus::Cancelled;
        assert!(matches!(
            decide(&view, &def, &failed("c", false)),
            Decision::Ignored { reason: "terminal_state" }
        ));
    }

    #[test]
    fn non_retryable_failure_with_on_failure_fail_fails_the_workflow() {
        let def = three_stage_def();
        let t = expect_transition(decide(&running_at("a"), &def, &failed("a", false)));

        assert_eq!(t.update.status, WorkflowStatus::Failed);
        let error = t.update.error.unwrap();
        assert_eq!(error.code, "AGENT_ERROR");
        assert_eq!(error.stage.as_deref(), Some("a"));
        assert!(has_event(&t.effects, EventType::StageFailed));
        assert!(has_event(&t.effects, EventType::WorkflowFailed));
    }

    #[test]
    fn skip_routes_past_the_failed_stage() {
        let def = three_stage_def();
        let mut view = running_at("b");
        view.completed_stages = vec!["a".to_string()];
        view.progress = 33;

        let t = expect_transition(decide(&view, &def, &failed("b", false)));
        assert_eq!(t.update.status, WorkflowStatus::Running);
        assert_eq!(t.update.current_stage.as_deref(), Some("c"));
        // Skipped stages do not advance progress.
        assert_eq!(t.update.progress, 33);
        assert!(t.update.record_output.is_none());
        assert!(has_dispatch(&t.effects, "c"));
    }

    #[test]
    fn skip_on_last_stage_completes_successfully() {
        let now = Utc::now();
        let def = WorkflowDefinition {
            id: Uuid::new_v4(),
            platform_id: None,
            name: "skip-end".to_string(),
            version: "1.0.0".to_string(),
            stages: vec![stage("a", "b", "fail", 0), stage("b", "END", "skip", 0)],
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        let mut view = running_at("b");
        view.completed_stages = vec!["a".to_string()];

        let t = expect_transition(decide(&view, &def, &failed("b", false)));
        assert_eq!(t.update.status, WorkflowStatus::Completed);
        assert_eq!(t.update.progress, 100);
        assert!(has_event(&t.effects, EventType::WorkflowCompleted));
    }

    #[test]
    fn retryable_failure_redispatches_within_budget() {
        let now = Utc::now();
        let def = WorkflowDefinition {
            id: Uuid::new_v4(),
            platform_id: None,
            name: "retrying".to_string(),
            version: "1.0.0".to_string(),
            stages: vec![stage("a", "END", "fail", 2)],
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };

        let t = expect_transition(decide(&running_at("a"), &def, &failed("a", true)));
        assert_eq!(t.update.status, WorkflowStatus::Running);
        assert!(t.effects.iter().any(|e| matches!(
            e,
            Effect::DispatchStage { stage, retry_count: 1, .. } if stage == "a"
        )));

        // Budget exhausted: routes on_failure instead.
        let mut view = running_at("a");
        view.retry_count = 2;
        let t = expect_transition(decide(&view, &def, &failed("a", true)));
        assert_eq!(t.update.status, WorkflowStatus::Failed);
    }

    #[test]
    fn timeout_behaves_like_a_retryable_failure() {
        let now = Utc::now();
        let def = WorkflowDefinition {
            id: Uuid::new_v4(),
            platform_id: None,
            name: "timeouts".to_string(),
            version: "1.0.0".to_string(),
            stages: vec![stage("a", "END", "fail", 1)],
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };

        let event = WorkflowEvent::Timeout { task_id: Uuid::new_v4(), stage: "a".to_string() };
        let t = expect_transition(decide(&running_at("a"), &def, &event));
        assert!(t.effects.iter().any(|e| matches!(
            e,
            Effect::CompleteTask { status: TaskStatus::Timeout, .. }
        )));
        assert!(has_dispatch(&t.effects, "a"));
    }

    #[test]
    fn stale_timeout_is_ignored() {
        let def = three_stage_def();
        let event = WorkflowEvent::Timeout { task_id: Uuid::new_v4(), stage: "a".to_string() };
        assert!(matches!(
            decide(&running_at("b"), &def, &event),
            Decision::Ignored { reason: "stale_timeout" }
        ));
    }

    #[test]
    fn pause_queues_results_until_resume() {
        let def = three_stage_def();

        let t = expect_transition(decide(&running_at("a"), &def, &WorkflowEvent::Pause));
        assert_eq!(t.update.status, WorkflowStatus::Paused);

        let mut paused = running_at("a");
        paused.status = WorkflowStatus::Paused;
        let t = expect_transition(decide(&paused, &def, &completed("a")));
        let queued = t.update.queued_events.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].stage, "a");
        assert!(queued[0].success);
        assert!(t.effects.is_empty());

        paused.queued_events = queued;
        let t = expect_transition(decide(&paused, &def, &WorkflowEvent::Resume));
        assert_eq!(t.update.status, WorkflowStatus::Running);
        assert!(t.update.queued_events.unwrap().is_empty());
        assert!(t.effects.iter().any(|e| matches!(
            e,
            Effect::ReplayQueued { events } if events.len() == 1
        )));
    }

    #[test]
    fn cancel_freezes_progress_and_cancels_tasks() {
        let def = three_stage_def();
        let mut view = running_at("b");
        view.progress = 33;

        let t = expect_transition(decide(&view, &def, &WorkflowEvent::Cancel));
        assert_eq!(t.update.status, WorkflowStatus::Cancelled);
        assert_eq!(t.update.progress, 33);
        assert!(t.effects.iter().any(|e| matches!(e, Effect::CancelOutstandingTasks)));

        // Cancel on a terminal workflow is rejected (409 at the API).
        let mut terminal = view.clone();
        terminal.status = WorkflowStatus::Completed;
        assert!(matches!(
            decide(&terminal, &def, &WorkflowEvent::Cancel),
            Decision::Rejected { reason: "already_terminal" }
        ));
    }

    #[test]
    fn retry_resurrects_a_failed_workflow() {
        let def = three_stage_def();
        let mut view = running_at("b");
        view.status = WorkflowStatus::Failed;
        view.error = Some(WorkflowError {
            code: "AGENT_ERROR".to_string(),
            message: "boom".to_string(),
            stage: Some("b".to_string()),
            retryable: true,
        });

        let t = expect_transition(decide(&view, &def, &WorkflowEvent::Retry { from_stage: None }));
        assert_eq!(t.update.status, WorkflowStatus::Running);
        assert_eq!(t.update.current_stage.as_deref(), Some("b"));
        assert!(t.update.clear_error);
        assert!(has_dispatch(&t.effects, "b"));

        // Unknown from_stage is rejected (400 at the API).
        assert!(matches!(
            decide(&view, &def, &WorkflowEvent::Retry { from_stage: Some("ghost".to_string()) }),
            Decision::Rejected { reason: "stage_not_in_definition" }
        ));

        // Retry requires the failed state (409 otherwise).
        assert!(matches!(
            decide(&running_at("b"), &def, &WorkflowEvent::Retry { from_stage: None }),
            Decision::Rejected { reason: "retry_requires_failed_state" }
        ));
    }
}
