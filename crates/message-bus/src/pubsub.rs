use crate::types::BusConfig;
use crate::BusError;
use futures::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Non-durable pub/sub side of the bus.
///
/// Carries the advisory mirror of stream topics for low-latency observers
/// (dashboard, WebSocket fan-out). Messages here may be lost; anything that
/// matters goes through the stream adapter.
pub struct MirrorBus {
    client: redis::Client,
    config: BusConfig,
    subscriptions: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<serde_json::Value>>>>,
}

impl MirrorBus {
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            BusError::ConnectionError { error: format!("failed to create pub/sub client: {e}") }
        })?;

        Ok(Self {
            client,
            config,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Subscribe to the mirror channel of a topic. Returns a receiver that
    /// yields decoded JSON payloads until the subscription ends.
    pub async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<serde_json::Value>, BusError> {
        let channel = self.config.mirror_channel(topic);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut subs = self.subscriptions.write().await;
            subs.insert(channel.clone(), tx);
        }

        let conn = self.client.get_async_connection().await.map_err(|e| {
            BusError::SubscriptionError {
                topic: topic.to_string(),
                error: format!("failed to get pub/sub connection: {e}"),
            }
        })?;

        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&channel).await.map_err(|e| BusError::SubscriptionError {
            topic: topic.to_string(),
            error: format!("subscribe failed: {e}"),
        })?;

        let subscriptions = self.subscriptions.clone();
        let channel_owned = channel.clone();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let payload: String = msg.get_payload().unwrap_or_default();
                let value = match serde_json::from_str::<serde_json::Value>(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(channel = %channel_owned, error = %e, "dropping undecodable mirror message");
                        continue;
                    }
                };

                let subs = subscriptions.read().await;
                if let Some(tx) = subs.get(&channel_owned) {
                    if tx.send(value).is_err() {
                        break;
                    }
                } else {
                    break;
                }
            }

            let mut subs = subscriptions.write().await;
            subs.remove(&channel_owned);
            info!(channel = %channel_owned, "mirror subscription ended");
        });

        info!(channel = %channel, "mirror subscription started");
        Ok(rx)
    }

    pub async fn unsubscribe(&self, topic: &str) {
        let channel = self.config.mirror_channel(topic);
        let mut subs = self.subscriptions.write().await;
        subs.remove(&channel);
    }

    pub async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<u32, BusError> {
        let channel = self.config.mirror_channel(topic);
        let mut conn =
            self.client.get_async_connection().await.map_err(|e| BusError::ConnectionError {
                error: format!("failed to get connection for publish: {e}"),
            })?;

        let receivers: u32 = conn.publish(&channel, payload.to_string()).await.map_err(|e| {
            BusError::PublishError { topic: topic.to_string(), error: e.to_string() }
        })?;

        if receivers == 0 {
            warn!(channel = %channel, "mirror publish had no subscribers");
        }
        Ok(receivers)
    }

    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }
}
