use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Canonical topic names. Every physical stream key is prefixed with the
/// configured namespace so multiple deployments can share one Redis.
pub fn tasks_topic(agent_type: &str) -> String {
    format!("tasks:{agent_type}")
}

pub fn results_topic() -> String {
    "results".to_string()
}

pub fn events_topic() -> String {
    "events".to_string()
}

pub fn dlq_topic(topic: &str) -> String {
    format!("dlq:{topic}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub url: String,
    /// Prefix for every stream key and pub/sub channel, e.g. "orchestrator".
    pub namespace: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub command_timeout: Duration,
    /// How long a blocking group read waits before re-checking for shutdown.
    pub block_timeout: Duration,
    /// How many entries a single group read may return.
    pub read_batch: usize,
    /// Idle time after which a pending entry is considered abandoned and
    /// eligible for claiming by another consumer.
    pub visibility_timeout: Duration,
    /// Interval between pending-entry claim sweeps.
    pub claim_interval: Duration,
    /// Deliveries after which an entry is routed to the topic DLQ.
    pub max_deliveries: u32,
    /// Capacity of the buffered publisher queue.
    pub publish_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            namespace: "orchestrator".to_string(),
            max_retries: 5,
            retry_delay: Duration::from_millis(100),
            command_timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(5),
            read_batch: 16,
            visibility_timeout: Duration::from_secs(30),
            claim_interval: Duration::from_secs(10),
            max_deliveries: 5,
            publish_buffer: 10_000,
        }
    }
}

impl BusConfig {
    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.namespace, topic)
    }

    pub fn mirror_channel(&self, topic: &str) -> String {
        format!("{}:mirror:{}", self.namespace, topic)
    }
}

/// Options applied to a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Also fan out over non-durable pub/sub for low-latency observers.
    /// Mirrored copies are advisory; loss is tolerated.
    pub mirror: bool,
    /// Trim hint for the stream; entries older than this may be dropped.
    pub ttl: Option<Duration>,
}

/// Identity of one consumer-group subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub topic: String,
    pub group: String,
    pub consumer: String,
}

/// One message handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    /// How many times this entry has been delivered, this attempt included.
    pub delivery_count: u32,
}

/// Handler outcome. The bus acknowledges only on `Ack`; a nacked entry stays
/// pending and is redelivered after the visibility timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    Nack { requeue: bool },
}

/// Result of a compare-and-swap. Atomic on the backend; no partial writes
/// are observable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { version: u64 },
    Conflict { actual: u64 },
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub url: String,
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u64,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn new(url: String) -> Self {
        Self {
            url,
            connected: false,
            connected_at: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }

    pub fn record_connection(&mut self) {
        self.connected = true;
        self.connected_at = Some(Utc::now());
        self.last_error = None;
    }

    pub fn record_disconnection(&mut self) {
        self.connected = false;
    }

    pub fn record_reconnect_attempt(&mut self) {
        self.reconnect_attempts += 1;
    }

    pub fn record_error(&mut self, error: String) {
        self.connected = false;
        self.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_namespaced() {
        let config = BusConfig::default();
        assert_eq!(config.stream_key(&tasks_topic("scaffold")), "orchestrator:tasks:scaffold");
        assert_eq!(config.stream_key(&results_topic()), "orchestrator:results");
        assert_eq!(
            config.stream_key(&dlq_topic(&results_topic())),
            "orchestrator:dlq:results"
        );
        assert_eq!(config.mirror_channel(&events_topic()), "orchestrator:mirror:events");
    }

    #[test]
    fn connection_status_tracks_errors() {
        let mut status = ConnectionStatus::new("redis://localhost".into());
        status.record_connection();
        assert!(status.connected);
        status.record_error("boom".into());
        assert!(!status.connected);
        assert_eq!(status.last_error.as_deref(), Some("boom"));
    }
}
