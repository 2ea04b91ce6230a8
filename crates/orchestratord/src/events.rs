//! Lifecycle event publishing.
//!
//! Every event goes to the durable events topic with the pub/sub mirror
//! enabled, and into a local broadcast channel feeding this instance's
//! WebSocket sessions. A mirror bridge can forward events published by
//! other replicas into the same local channel.

use message_bus::{events_topic, BufferedPublisher, MessageBus, MirrorBus, PublishOptions};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use workflow_engine::LifecycleEvent;

const BROADCAST_CAPACITY: usize = 1024;
const RETRY_QUEUE_CAPACITY: usize = 10_000;

pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    /// Bounded retry queue for events that could not be published directly,
    /// e.g. during a bus reconnect. Overflow is dropped with a warning.
    retry_queue: Arc<BufferedPublisher>,
    local: broadcast::Sender<LifecycleEvent>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        let (local, _) = broadcast::channel(BROADCAST_CAPACITY);
        let retry_queue = Arc::new(BufferedPublisher::spawn(bus.clone(), RETRY_QUEUE_CAPACITY));
        Self { bus, retry_queue, local }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.local.subscribe()
    }

    /// Flushed during shutdown phase 4.
    pub fn retry_queue(&self) -> Arc<BufferedPublisher> {
        self.retry_queue.clone()
    }

    /// Publish a lifecycle event. Bus failures fall back to the bounded
    /// retry queue and are never fatal: the event stream is observability,
    /// not state.
    pub async fn publish(&self, event: LifecycleEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize lifecycle event");
                return;
            }
        };

        let options = PublishOptions { mirror: true, ttl: None };
        if let Err(e) = self.bus.publish(&events_topic(), payload.clone(), options.clone()).await {
            warn!(error = %e, event_type = ?event.event_type, "direct event publish failed, queueing");
            if let Err(e) = self.retry_queue.try_publish(&events_topic(), payload, options) {
                warn!(error = %e, "event dropped, retry queue full");
            }
        }

        let _ = self.local.send(event);
    }

    /// Forward mirror traffic from other replicas into the local channel.
    pub fn spawn_mirror_bridge(&self, mirror: Arc<MirrorBus>) -> tokio::task::JoinHandle<()> {
        let local = self.local.clone();
        tokio::spawn(async move {
            let mut rx = match mirror.subscribe(&events_topic()).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "event mirror bridge unavailable");
                    return;
                }
            };
            while let Some(value) = rx.recv().await {
                match serde_json::from_value::<LifecycleEvent>(value) {
                    Ok(event) => {
                        let _ = local.send(event);
                    }
                    Err(e) => debug!(error = %e, "dropping undecodable mirrored event"),
                }
            }
        })
    }
}
