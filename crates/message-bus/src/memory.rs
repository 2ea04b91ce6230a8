//! In-memory implementations of the bus and KV ports.
//!
//! Used by the integration test suites and as a degraded-mode fallback when
//! no backend is reachable. Delivery is synchronous and deterministic:
//! `publish` drives each subscribed group's handler to a final verdict
//! before returning.

use crate::ports::{KeyValueStore, MessageBus, MessageHandler, SubscriptionHandle};
use crate::types::{dlq_topic, CasOutcome, Delivery, PublishOptions, SubscriptionSpec, Verdict};
use crate::BusError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct StoredEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, StoredEntry>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        if entry.live() {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, BusError> {
        Ok(self.read(key))
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        self.entries.insert(
            key.to_string(),
            StoredEntry { value, expires_at: ttl.map(|t| Instant::now() + t) },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BusError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| StoredEntry {
            value: serde_json::json!(0),
            expires_at: None,
        });
        let current = entry.value.as_i64().unwrap_or(0);
        let next = current + 1;
        entry.value = serde_json::json!(next);
        Ok(next)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, BusError> {
        if self.read(key).is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<CasOutcome, BusError> {
        let current = match self.read(key) {
            Some(value) => value,
            None => return Ok(CasOutcome::Missing),
        };

        let actual = current.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if actual != expected_version {
            return Ok(CasOutcome::Conflict { actual });
        }

        let next = expected_version + 1;
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: serde_json::json!({ "version": next, "value": value }),
                expires_at,
            },
        );
        Ok(CasOutcome::Applied { version: next })
    }

    async fn put_versioned(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<u64, BusError> {
        self.set(key, serde_json::json!({ "version": 1, "value": value }), ttl).await?;
        Ok(1)
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<Option<u64>, BusError> {
        let token = self.incr(&format!("lock-seq:{name}")).await? as u64;
        let acquired =
            self.set_if_absent(&format!("lock:{name}"), serde_json::json!(token), Some(ttl)).await?;
        Ok(acquired.then_some(token))
    }

    async fn release_lock(&self, name: &str, token: u64) -> Result<bool, BusError> {
        let key = format!("lock:{name}");
        match self.read(&key) {
            Some(value) if value.as_u64() == Some(token) => {
                self.entries.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn health(&self) -> Result<Duration, BusError> {
        Ok(Duration::ZERO)
    }
}

struct GroupSubscription {
    group: String,
    handler: Arc<dyn MessageHandler>,
}

/// Deterministic in-process bus. Messages publish synchronously into each
/// subscribed group; redelivery and dead-lettering follow the same rules as
/// the stream adapter (requeue up to the delivery limit, then DLQ).
pub struct InMemoryBus {
    subscriptions: DashMap<String, Vec<GroupSubscription>>,
    published: DashMap<String, Vec<serde_json::Value>>,
    sequence: AtomicU64,
    max_deliveries: u32,
    mirror_tx: broadcast::Sender<(String, serde_json::Value)>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(5)
    }
}

impl InMemoryBus {
    pub fn new(max_deliveries: u32) -> Self {
        let (mirror_tx, _) = broadcast::channel(1024);
        Self {
            subscriptions: DashMap::new(),
            published: DashMap::new(),
            sequence: AtomicU64::new(1),
            max_deliveries,
            mirror_tx,
        }
    }

    /// All payloads ever published to a topic, oldest first.
    pub fn published(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published.get(topic).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn published_count(&self, topic: &str) -> usize {
        self.published.get(topic).map(|v| v.len()).unwrap_or(0)
    }

    /// Dead-lettered payload records for a topic.
    pub fn dead_letters(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published(&dlq_topic(topic))
    }

    /// Receiver for the advisory mirror of `mirror: true` publishes.
    pub fn mirror_receiver(&self) -> broadcast::Receiver<(String, serde_json::Value)> {
        self.mirror_tx.subscribe()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        let id = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.published.entry(topic.to_string()).or_default().push(payload.clone());

        if options.mirror {
            let _ = self.mirror_tx.send((topic.to_string(), payload.clone()));
        }

        // Snapshot handlers before awaiting so no map guard is held across
        // the handler call.
        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = self
            .subscriptions
            .get(topic)
            .map(|subs| subs.iter().map(|s| (s.group.clone(), s.handler.clone())).collect())
            .unwrap_or_default();

        for (_group, handler) in handlers {
            let mut attempt = 1u32;
            loop {
                let delivery = Delivery {
                    id: format!("{id}-0"),
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    delivery_count: attempt,
                };
                match handler.handle(delivery).await {
                    Verdict::Ack => break,
                    Verdict::Nack { requeue: false } => {
                        self.published
                            .entry(dlq_topic(topic))
                            .or_default()
                            .push(payload.clone());
                        break;
                    }
                    Verdict::Nack { requeue: true } => {
                        if attempt >= self.max_deliveries {
                            self.published
                                .entry(dlq_topic(topic))
                                .or_default()
                                .push(payload.clone());
                            break;
                        }
                        attempt += 1;
                    }
                }
            }
        }

        Ok(format!("{id}-0"))
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        let mut subs = self.subscriptions.entry(spec.topic.clone()).or_default();
        // One consumer per group in the in-process bus; a second subscribe
        // for the same group replaces the previous consumer.
        subs.retain(|s| s.group != spec.group);
        subs.push(GroupSubscription { group: spec.group.clone(), handler });
        drop(subs);

        Ok(SubscriptionHandle::new(spec.topic, spec.group, CancellationToken::new(), Vec::new()))
    }

    async fn health(&self) -> Result<Duration, BusError> {
        Ok(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        calls: AtomicU32,
        verdict: Verdict,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _delivery: Delivery) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
    }

    #[tokio::test]
    async fn kv_set_if_absent_is_exclusive() {
        let kv = InMemoryKv::new();
        assert!(kv.set_if_absent("seen:a", serde_json::json!(1), None).await.unwrap());
        assert!(!kv.set_if_absent("seen:a", serde_json::json!(1), None).await.unwrap());
    }

    #[tokio::test]
    async fn kv_ttl_expires_entries() {
        let kv = InMemoryKv::new();
        kv.set("k", serde_json::json!("v"), Some(Duration::from_millis(10))).await.unwrap();
        assert!(kv.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kv_cas_tracks_versions() {
        let kv = InMemoryKv::new();
        assert_eq!(
            kv.compare_and_swap("row", 1, serde_json::json!("x")).await.unwrap(),
            CasOutcome::Missing
        );

        kv.put_versioned("row", serde_json::json!("a"), None).await.unwrap();
        assert_eq!(
            kv.compare_and_swap("row", 1, serde_json::json!("b")).await.unwrap(),
            CasOutcome::Applied { version: 2 }
        );
        assert_eq!(
            kv.compare_and_swap("row", 1, serde_json::json!("c")).await.unwrap(),
            CasOutcome::Conflict { actual: 2 }
        );
    }

    #[tokio::test]
    async fn kv_locks_fence() {
        let kv = InMemoryKv::new();
        let token = kv.acquire_lock("wf", Duration::from_secs(30)).await.unwrap();
        assert!(token.is_some());
        assert!(kv.acquire_lock("wf", Duration::from_secs(30)).await.unwrap().is_none());

        assert!(!kv.release_lock("wf", 999).await.unwrap());
        assert!(kv.release_lock("wf", token.unwrap()).await.unwrap());
        assert!(kv.acquire_lock("wf", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bus_delivers_once_per_group() {
        let bus = InMemoryBus::new(5);
        let handler = Arc::new(CountingHandler { calls: AtomicU32::new(0), verdict: Verdict::Ack });
        bus.subscribe(
            SubscriptionSpec {
                topic: "results".into(),
                group: "orchestrator-group".into(),
                consumer: "c1".into(),
            },
            handler.clone(),
        )
        .await
        .unwrap();

        bus.publish("results", serde_json::json!({"n": 1}), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published_count("results"), 1);
    }

    #[tokio::test]
    async fn bus_dead_letters_after_delivery_limit() {
        let bus = InMemoryBus::new(3);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            verdict: Verdict::Nack { requeue: true },
        });
        bus.subscribe(
            SubscriptionSpec { topic: "results".into(), group: "g".into(), consumer: "c".into() },
            handler.clone(),
        )
        .await
        .unwrap();

        bus.publish("results", serde_json::json!({"poison": true}), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.dead_letters("results").len(), 1);
    }

    #[tokio::test]
    async fn bus_mirrors_when_requested() {
        let bus = InMemoryBus::new(5);
        let mut rx = bus.mirror_receiver();
        bus.publish(
            "events",
            serde_json::json!({"event_type": "workflow.created"}),
            PublishOptions { mirror: true, ttl: None },
        )
        .await
        .unwrap();

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "events");
        assert_eq!(payload["event_type"], "workflow.created");
    }
}
