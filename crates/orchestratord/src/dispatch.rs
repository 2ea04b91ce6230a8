//! Bus-facing handlers: the single result-consumption path of the core and
//! the registry ingestion of agent heartbeat events.

use crate::events::EventPublisher;
use crate::service::{ResultDisposition, ServiceError, WorkflowService};
use async_trait::async_trait;
use chrono::Utc;
use message_bus::{Delivery, MessageHandler, Verdict};
use std::sync::Arc;
use tracing::{info, warn};
use workflow_engine::{
    parse_result_envelope, AgentRecord, EventType, LifecycleEvent,
};
use workflow_store::AgentRepository;

/// Consumer group shared by every core replica on the results topic.
pub const RESULTS_GROUP: &str = "orchestrator-group";
/// Separate group so registry ingestion does not steal observer traffic.
pub const REGISTRY_GROUP: &str = "orchestrator-registry";

/// Handler for `orchestrator:results`. Exactly one result-handling path
/// exists in the core; everything a result can cause goes through here.
pub struct ResultsHandler {
    service: Arc<WorkflowService>,
    events: Arc<EventPublisher>,
}

impl ResultsHandler {
    pub fn new(service: Arc<WorkflowService>, events: Arc<EventPublisher>) -> Self {
        Self { service, events }
    }
}

#[async_trait]
impl MessageHandler for ResultsHandler {
    async fn handle(&self, delivery: Delivery) -> Verdict {
        // Poison-message policy: an envelope that cannot be parsed or
        // validated produces a stage.failed event and goes to the DLQ,
        // acked, so the stream never blocks on it.
        let envelope = match parse_result_envelope(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(failure) => {
                warn!(
                    topic = %delivery.topic,
                    issues = ?failure.issues,
                    "rejecting invalid result envelope"
                );
                let workflow_id = delivery
                    .payload
                    .get("workflow_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok());
                let trace_id = delivery
                    .payload
                    .get("trace_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(uuid::Uuid::nil);
                self.events
                    .publish(LifecycleEvent::new(
                        EventType::StageFailed,
                        workflow_id,
                        trace_id,
                        serde_json::json!({
                            "reason": "invalid_result_envelope",
                            "issues": failure.issues,
                        }),
                    ))
                    .await;
                return Verdict::Nack { requeue: false };
            }
        };

        match self.service.handle_result(&envelope).await {
            Ok(ResultDisposition::Applied) => Verdict::Ack,
            Ok(disposition) => {
                info!(?disposition, task_id = %envelope.task_id, "result settled without transition");
                Verdict::Ack
            }
            Err(ServiceError::WorkflowNotFound { id }) => {
                warn!(workflow_id = %id, "result for unknown workflow");
                Verdict::Nack { requeue: false }
            }
            Err(ServiceError::CasExhausted { workflow_id, .. }) => {
                // Force redelivery; the next attempt recomputes from a
                // fresh row.
                warn!(%workflow_id, "CAS budget exhausted, requeueing result");
                Verdict::Nack { requeue: true }
            }
            Err(e) => {
                warn!(error = %e, "transient failure handling result, requeueing");
                Verdict::Nack { requeue: true }
            }
        }
    }
}

/// Handler for agent lifecycle traffic on the events topic: periodic
/// `agent.registered` events act as heartbeats and (re)register the agent.
pub struct AgentEventsHandler {
    service: Arc<WorkflowService>,
    agents: Arc<dyn AgentRepository>,
}

impl AgentEventsHandler {
    pub fn new(service: Arc<WorkflowService>, agents: Arc<dyn AgentRepository>) -> Self {
        Self { service, agents }
    }
}

#[async_trait]
impl MessageHandler for AgentEventsHandler {
    async fn handle(&self, delivery: Delivery) -> Verdict {
        let Ok(event) = serde_json::from_value::<LifecycleEvent>(delivery.payload.clone()) else {
            return Verdict::Ack;
        };
        if event.event_type != EventType::AgentRegistered {
            return Verdict::Ack;
        }

        let Some(agent_type) = event.payload.get("agent_type").and_then(|v| v.as_str()) else {
            return Verdict::Ack;
        };
        let platform_id = event
            .payload
            .get("platform_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        let interval = event.payload.get("heartbeat_interval_secs").and_then(|v| v.as_u64());
        let now = Utc::now();

        self.service.registry().record_heartbeat(agent_type, platform_id, interval, now);

        // Keep the registry table in sync so a restart reloads the agent.
        let snapshot = self
            .service
            .registry()
            .all()
            .into_iter()
            .find(|a| a.agent_type == agent_type && a.platform_id == platform_id);
        if let Some(record) = snapshot {
            if let Err(e) = self.agents.upsert(&record).await {
                warn!(error = %e, agent_type, "failed to persist agent heartbeat");
            }
        } else {
            let mut record = AgentRecord::global(agent_type);
            record.platform_id = platform_id;
            record.last_heartbeat = Some(now);
            if let Err(e) = self.agents.upsert(&record).await {
                warn!(error = %e, agent_type, "failed to persist agent registration");
            }
        }

        Verdict::Ack
    }
}
