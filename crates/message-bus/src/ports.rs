//! Technology-neutral ports. The orchestration core depends only on these
//! traits; the Redis adapters and the in-memory fallbacks implement them.

use crate::types::{CasOutcome, Delivery, PublishOptions, SubscriptionSpec, Verdict};
use crate::BusError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Verdict;
}

/// A running subscription. Dropping the handle does not stop the consumer;
/// call [`SubscriptionHandle::shutdown`] to stop reading and release the slot.
pub struct SubscriptionHandle {
    pub topic: String,
    pub group: String,
    token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn new(
        topic: String,
        group: String,
        token: CancellationToken,
        tasks: Vec<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self { topic, group, token, tasks }
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append an envelope to a topic. Returns the server-assigned message id.
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<String, BusError>;

    /// Join a consumer group on a topic. Each entry is delivered to exactly
    /// one member of the group; the entry is acknowledged only after the
    /// handler returns [`Verdict::Ack`].
    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Round-trip latency to the backend.
    async fn health(&self) -> Result<Duration, BusError>;
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, BusError>;

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), BusError>;

    async fn delete(&self, key: &str) -> Result<bool, BusError>;

    async fn incr(&self, key: &str) -> Result<i64, BusError>;

    /// Set only when the key does not exist. Returns true when this call
    /// created the key. This is the cluster-wide dedup primitive.
    async fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, BusError>;

    /// Atomic versioned swap. The stored record carries a version counter;
    /// the swap applies only when the caller's expectation matches.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<CasOutcome, BusError>;

    /// Create a versioned record for later CAS. Fails the swap path with
    /// `Missing` until this has run once.
    async fn put_versioned(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<u64, BusError>;

    /// Acquire a named lock with a TTL. Returns a fencing token on success,
    /// `None` when the lock is held.
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<Option<u64>, BusError>;

    async fn release_lock(&self, name: &str, token: u64) -> Result<bool, BusError>;

    async fn health(&self) -> Result<Duration, BusError>;
}
