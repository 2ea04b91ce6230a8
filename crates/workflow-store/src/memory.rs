//! In-memory store with the same CAS semantics as the Postgres adapter.
//! Backs the integration test suites and degraded single-node operation.

use crate::repo::{
    AgentRepository, AgentTypeStats, CasResult, DefinitionRepository, PlatformRepository,
    SpanRecord, SpanRepository, StageAudit, StatsOverview, StatsPeriod, StatsRepository,
    TaskRepository, TimeBucket, TraceSummary, WorkflowFilter, WorkflowRepository, WorkflowRollup,
};
use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use uuid::Uuid;
use workflow_engine::{
    AgentRecord, AgentTask, Platform, PlatformSurface, SurfaceType, TaskStatus, Workflow,
    WorkflowDefinition, WorkflowStatus,
};

#[derive(Default)]
pub struct MemoryStore {
    workflows: DashMap<Uuid, Workflow>,
    audits: Mutex<Vec<StageAudit>>,
    tasks: DashMap<Uuid, AgentTask>,
    definitions: DashMap<Uuid, WorkflowDefinition>,
    platforms: DashMap<Uuid, Platform>,
    surfaces: DashMap<(Uuid, SurfaceType), PlatformSurface>,
    agents: DashMap<(Option<Uuid>, String), AgentRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn insert(&self, workflow: &Workflow) -> Result<(), StoreError> {
        if self.workflows.contains_key(&workflow.id) {
            return Err(StoreError::Conflict {
                message: format!("workflow {} already exists", workflow.id),
            });
        }
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.get(&id).map(|w| w.clone()))
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>, StoreError> {
        let mut rows: Vec<Workflow> = self
            .workflows
            .iter()
            .map(|entry| entry.clone())
            .filter(|w| filter.status.map_or(true, |s| w.status == s))
            .filter(|w| filter.workflow_type.map_or(true, |t| w.workflow_type == Some(t)))
            .filter(|w| filter.platform_id.map_or(true, |p| w.platform_id == Some(p)))
            .filter(|w| filter.trace_id.map_or(true, |t| w.trace_id == t))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn update_cas(
        &self,
        workflow: &Workflow,
        expected_version: i64,
    ) -> Result<CasResult, StoreError> {
        let Some(mut entry) = self.workflows.get_mut(&workflow.id) else {
            return Ok(CasResult::NotFound);
        };
        if entry.version != expected_version {
            return Ok(CasResult::VersionMismatch);
        }
        let mut updated = workflow.clone();
        updated.version = expected_version + 1;
        *entry = updated;
        Ok(CasResult::Applied { version: expected_version + 1 })
    }

    async fn record_stage_audit(&self, audit: &StageAudit) -> Result<(), StoreError> {
        self.audits.lock().push(audit.clone());
        Ok(())
    }

    async fn stage_audits(&self, workflow_id: Uuid) -> Result<Vec<StageAudit>, StoreError> {
        Ok(self
            .audits
            .lock()
            .iter()
            .filter(|a| a.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn insert(&self, task: &AgentTask) -> Result<(), StoreError> {
        self.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<AgentTask>, StoreError> {
        Ok(self.tasks.get(&task_id).map(|t| t.clone()))
    }

    async fn for_workflow(&self, workflow_id: Uuid) -> Result<Vec<AgentTask>, StoreError> {
        let mut rows: Vec<AgentTask> = self
            .tasks
            .iter()
            .filter(|t| t.workflow_id == workflow_id)
            .map(|t| t.clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn mark_running(&self, task_id: Uuid) -> Result<(), StoreError> {
        let Some(mut task) = self.tasks.get_mut(&task_id) else {
            return Err(StoreError::NotFound { entity: "task", id: task_id.to_string() });
        };
        if task.status.is_terminal() {
            return Ok(());
        }
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.assigned_at.get_or_insert(now);
        task.started_at.get_or_insert(now);
        task.updated_at = now;
        Ok(())
    }

    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let Some(mut task) = self.tasks.get_mut(&task_id) else {
            return Err(StoreError::NotFound { entity: "task", id: task_id.to_string() });
        };
        let now = Utc::now();
        task.status = status;
        task.result = result;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    async fn active_for_stage(
        &self,
        workflow_id: Uuid,
        stage: &str,
    ) -> Result<Option<AgentTask>, StoreError> {
        Ok(self
            .tasks
            .iter()
            .find(|t| {
                t.workflow_id == workflow_id && t.stage == stage && !t.status.is_terminal()
            })
            .map(|t| t.clone()))
    }

    async fn cancel_open_for_workflow(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let mut cancelled = 0u64;
        let now = Utc::now();
        for mut task in self.tasks.iter_mut() {
            if task.workflow_id == workflow_id && !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
                task.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<AgentTask>, StoreError> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| {
                let deadline = t.created_at + ChronoDuration::milliseconds(t.timeout_ms as i64);
                now > deadline
            })
            .map(|t| t.clone())
            .collect())
    }
}

#[async_trait]
impl DefinitionRepository for MemoryStore {
    async fn insert(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let duplicate = self.definitions.iter().any(|d| {
            d.platform_id == definition.platform_id && d.name == definition.name
        });
        if duplicate {
            return Err(StoreError::Conflict {
                message: format!("definition {} already exists for platform", definition.name),
            });
        }
        self.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions.get(&id).map(|d| d.clone()))
    }

    async fn get_by_name(
        &self,
        platform_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .definitions
            .iter()
            .find(|d| d.platform_id == platform_id && d.name == name)
            .map(|d| d.clone()))
    }

    async fn list(&self, platform_id: Option<Uuid>) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut rows: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .filter(|d| platform_id.is_none() || d.platform_id == platform_id)
            .map(|d| d.clone())
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn update(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        if !self.definitions.contains_key(&definition.id) {
            return Err(StoreError::NotFound {
                entity: "workflow_definition",
                id: definition.id.to_string(),
            });
        }
        self.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.definitions.remove(&id).is_some())
    }
}

#[async_trait]
impl PlatformRepository for MemoryStore {
    async fn insert(&self, platform: &Platform) -> Result<(), StoreError> {
        let duplicate = self.platforms.iter().any(|p| p.name == platform.name);
        if duplicate {
            return Err(StoreError::Conflict {
                message: format!("platform {} already exists", platform.name),
            });
        }
        self.platforms.insert(platform.id, platform.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Platform>, StoreError> {
        Ok(self.platforms.get(&id).map(|p| p.clone()))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Platform>, StoreError> {
        Ok(self.platforms.iter().find(|p| p.name == name).map(|p| p.clone()))
    }

    async fn list(&self) -> Result<Vec<Platform>, StoreError> {
        let mut rows: Vec<Platform> = self.platforms.iter().map(|p| p.clone()).collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn update(&self, platform: &Platform) -> Result<(), StoreError> {
        if !self.platforms.contains_key(&platform.id) {
            return Err(StoreError::NotFound { entity: "platform", id: platform.id.to_string() });
        }
        self.platforms.insert(platform.id, platform.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.surfaces.retain(|(platform_id, _), _| *platform_id != id);
        Ok(self.platforms.remove(&id).is_some())
    }

    async fn upsert_surface(&self, surface: &PlatformSurface) -> Result<(), StoreError> {
        self.surfaces.insert((surface.platform_id, surface.surface_type), surface.clone());
        Ok(())
    }

    async fn get_surface(
        &self,
        platform_id: Uuid,
        surface_type: SurfaceType,
    ) -> Result<Option<PlatformSurface>, StoreError> {
        Ok(self.surfaces.get(&(platform_id, surface_type)).map(|s| s.clone()))
    }

    async fn list_surfaces(&self, platform_id: Uuid) -> Result<Vec<PlatformSurface>, StoreError> {
        Ok(self
            .surfaces
            .iter()
            .filter(|s| s.platform_id == platform_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn delete_surface(
        &self,
        platform_id: Uuid,
        surface_type: SurfaceType,
    ) -> Result<bool, StoreError> {
        Ok(self.surfaces.remove(&(platform_id, surface_type)).is_some())
    }
}

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn upsert(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.agents.insert((record.platform_id, record.agent_type.clone()), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.agents.iter().map(|a| a.clone()).collect())
    }
}

#[async_trait]
impl StatsRepository for MemoryStore {
    async fn overview(&self) -> Result<StatsOverview, StoreError> {
        let mut by_status: BTreeMap<String, i64> = BTreeMap::new();
        let mut durations = Vec::new();
        for workflow in self.workflows.iter() {
            *by_status.entry(workflow.status.as_str().to_string()).or_insert(0) += 1;
            if let Some(completed_at) = workflow.completed_at {
                durations.push((completed_at - workflow.created_at).num_milliseconds() as f64);
            }
        }
        let avg = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };
        Ok(StatsOverview {
            total_workflows: self.workflows.len() as i64,
            workflows_by_status: by_status,
            total_tasks: self.tasks.len() as i64,
            avg_workflow_duration_ms: avg,
        })
    }

    async fn agents(&self) -> Result<Vec<AgentTypeStats>, StoreError> {
        let mut by_type: BTreeMap<String, (i64, i64, i64, Vec<f64>)> = BTreeMap::new();
        for task in self.tasks.iter() {
            let entry = by_type.entry(task.agent_type.clone()).or_default();
            entry.0 += 1;
            match task.status {
                TaskStatus::Completed => entry.1 += 1,
                TaskStatus::Failed | TaskStatus::Timeout => entry.2 += 1,
                _ => {}
            }
            if let Some(completed_at) = task.completed_at {
                entry.3.push((completed_at - task.created_at).num_milliseconds() as f64);
            }
        }
        Ok(by_type
            .into_iter()
            .map(|(agent_type, (total, completed, failed, durations))| AgentTypeStats {
                agent_type,
                total_tasks: total,
                completed,
                failed,
                avg_duration_ms: if durations.is_empty() {
                    None
                } else {
                    Some(durations.iter().sum::<f64>() / durations.len() as f64)
                },
            })
            .collect())
    }

    async fn timeseries(&self, period: StatsPeriod) -> Result<Vec<TimeBucket>, StoreError> {
        let (window, bucket_minutes) = match period {
            StatsPeriod::Hour => (ChronoDuration::hours(1), 5i64),
            StatsPeriod::Day => (ChronoDuration::hours(24), 60),
            StatsPeriod::Week => (ChronoDuration::days(7), 24 * 60),
            StatsPeriod::Month => (ChronoDuration::days(30), 24 * 60),
        };
        let since = Utc::now() - window;
        let mut buckets: BTreeMap<i64, TimeBucket> = BTreeMap::new();
        let bucket_ms = bucket_minutes * 60_000;

        for workflow in self.workflows.iter() {
            if workflow.created_at < since {
                continue;
            }
            let slot = workflow.created_at.timestamp_millis() / bucket_ms;
            let bucket = buckets.entry(slot).or_insert_with(|| TimeBucket {
                bucket: DateTime::from_timestamp_millis(slot * bucket_ms).unwrap_or_default(),
                created: 0,
                completed: 0,
                failed: 0,
            });
            bucket.created += 1;
            match workflow.status {
                WorkflowStatus::Completed => bucket.completed += 1,
                WorkflowStatus::Failed => bucket.failed += 1,
                _ => {}
            }
        }

        Ok(buckets.into_values().collect())
    }

    async fn workflows(&self) -> Result<Vec<WorkflowRollup>, StoreError> {
        let mut rollups = Vec::new();
        for workflow in self.workflows.iter() {
            let task_count =
                self.tasks.iter().filter(|t| t.workflow_id == workflow.id).count() as i64;
            rollups.push(WorkflowRollup {
                workflow_id: workflow.id,
                name: workflow.name.clone(),
                status: workflow.status,
                task_count,
                duration_ms: workflow
                    .completed_at
                    .map(|at| (at - workflow.created_at).num_milliseconds()),
            });
        }
        rollups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rollups)
    }
}

#[async_trait]
impl SpanRepository for MemoryStore {
    async fn traces(&self, limit: i64, offset: i64) -> Result<Vec<TraceSummary>, StoreError> {
        let mut summaries: Vec<TraceSummary> = Vec::new();
        for workflow in self.workflows.iter() {
            let span_count =
                1 + self.tasks.iter().filter(|t| t.trace_id == workflow.trace_id).count() as i64;
            summaries.push(TraceSummary {
                trace_id: workflow.trace_id,
                workflow_id: workflow.id,
                workflow_name: workflow.name.clone(),
                status: workflow.status,
                started_at: workflow.created_at,
                completed_at: workflow.completed_at,
                span_count,
            });
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(if limit <= 0 { 50 } else { limit as usize })
            .collect())
    }

    async fn trace(&self, trace_id: Uuid) -> Result<Option<TraceSummary>, StoreError> {
        let traces = self.traces(i64::MAX, 0).await?;
        Ok(traces.into_iter().find(|t| t.trace_id == trace_id))
    }

    async fn spans(&self, trace_id: Uuid) -> Result<Vec<SpanRecord>, StoreError> {
        let mut spans = Vec::new();

        for workflow in self.workflows.iter() {
            if workflow.trace_id != trace_id {
                continue;
            }
            if let Some(span_id) = workflow.current_span_id {
                spans.push(SpanRecord {
                    span_id,
                    parent_span_id: None,
                    trace_id,
                    name: workflow.name.clone(),
                    kind: "workflow".to_string(),
                    started_at: workflow.created_at,
                    completed_at: workflow.completed_at,
                    status: workflow.status.as_str().to_string(),
                });
            }
        }

        for task in self.tasks.iter() {
            if task.trace_id != trace_id {
                continue;
            }
            spans.push(SpanRecord {
                span_id: task.span_id,
                parent_span_id: task.parent_span_id,
                trace_id,
                name: task.stage.clone(),
                kind: "task".to_string(),
                started_at: task.created_at,
                completed_at: task.completed_at,
                status: task.status.as_str().to_string(),
            });
        }

        spans.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_engine::{Priority, WorkflowType};

    fn workflow() -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Uuid::new_v4(),
            platform_id: None,
            workflow_definition_id: None,
            surface_id: None,
            name: "fix-login".to_string(),
            workflow_type: Some(WorkflowType::Bugfix),
            status: WorkflowStatus::Initiated,
            current_stage: None,
            progress: 0,
            priority: Priority::Medium,
            version: 1,
            stage_outputs: BTreeMap::new(),
            queued_events: vec![],
            error: None,
            trace_id: Uuid::new_v4(),
            current_span_id: Some(Uuid::new_v4()),
            input_data: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            completed_at: None,
            created_by: "tests".to_string(),
        }
    }

    #[tokio::test]
    async fn cas_applies_only_on_matching_version() {
        let store = MemoryStore::new();
        let mut wf = workflow();
        WorkflowRepository::insert(&store, &wf).await.unwrap();

        wf.status = WorkflowStatus::Running;
        assert_eq!(
            store.update_cas(&wf, 1).await.unwrap(),
            CasResult::Applied { version: 2 }
        );
        assert_eq!(store.update_cas(&wf, 1).await.unwrap(), CasResult::VersionMismatch);

        let stored = WorkflowRepository::get(&store, wf.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, WorkflowStatus::Running);

        let ghost = workflow();
        assert_eq!(store.update_cas(&ghost, 1).await.unwrap(), CasResult::NotFound);
    }

    #[tokio::test]
    async fn duplicate_workflow_insert_conflicts() {
        let store = MemoryStore::new();
        let wf = workflow();
        WorkflowRepository::insert(&store, &wf).await.unwrap();
        assert!(matches!(
            WorkflowRepository::insert(&store, &wf).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = MemoryStore::new();
        let mut a = workflow();
        a.status = WorkflowStatus::Running;
        let b = workflow();
        WorkflowRepository::insert(&store, &a).await.unwrap();
        WorkflowRepository::insert(&store, &b).await.unwrap();

        let filter = WorkflowFilter { status: Some(WorkflowStatus::Running), ..Default::default() };
        let rows = WorkflowRepository::list(&store, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a.id);
    }

    #[tokio::test]
    async fn overdue_finds_expired_open_tasks() {
        let store = MemoryStore::new();
        let wf = workflow();
        let now = Utc::now();
        let task = AgentTask {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            workflow_id: wf.id,
            stage: "scaffold".to_string(),
            agent_type: "scaffold".to_string(),
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            payload: serde_json::Value::Null,
            result: None,
            trace_id: wf.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 2,
            timeout_ms: 1000,
            created_at: now - ChronoDuration::seconds(5),
            updated_at: now,
        };
        TaskRepository::insert(&store, &task).await.unwrap();

        let overdue = store.overdue(now).await.unwrap();
        assert_eq!(overdue.len(), 1);

        store.complete(task.task_id, TaskStatus::Completed, None).await.unwrap();
        assert!(store.overdue(now).await.unwrap().is_empty());
    }
}
