//! Shared application state handed to every HTTP handler.

use crate::config::OrchestratorConfig;
use crate::events::EventPublisher;
use crate::service::WorkflowService;
use crate::surface::SurfaceRouter;
use message_bus::{KeyValueStore, MessageBus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use workflow_store::{
    AgentRepository, DefinitionRepository, PlatformRepository, SpanRepository, StatsRepository,
    TaskRepository, WorkflowRepository,
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WorkflowService>,
    pub surface_router: Arc<SurfaceRouter>,
    pub events: Arc<EventPublisher>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub definitions: Arc<dyn DefinitionRepository>,
    pub platforms: Arc<dyn PlatformRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub stats: Arc<dyn StatsRepository>,
    pub spans: Arc<dyn SpanRepository>,
    pub bus: Arc<dyn MessageBus>,
    pub kv: Arc<dyn KeyValueStore>,
    pub config: Arc<OrchestratorConfig>,
    pub started_at: Instant,
    pub accepting: Arc<AtomicBool>,
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
