use crate::client::RedisClient;
use crate::ports::{MessageBus, MessageHandler, SubscriptionHandle};
use crate::types::{dlq_topic, Delivery, PublishOptions, SubscriptionSpec, Verdict};
use crate::BusError;
use async_trait::async_trait;
use chrono::Utc;
use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ENVELOPE_FIELD: &str = "envelope";
const PENDING_SCAN_BATCH: usize = 100;

/// Durable bus over Redis streams.
///
/// One stream per topic, consumer groups for load-balanced consumption.
/// Entries are acknowledged only after the handler returns [`Verdict::Ack`];
/// abandoned entries are reclaimed after the visibility timeout, and entries
/// that exceed the delivery limit are copied to the topic's dead-letter
/// stream with failure metadata.
pub struct RedisStreamBus {
    client: Arc<RedisClient>,
}

impl RedisStreamBus {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    async fn ensure_group(&self, key: &str, group: &str) -> Result<(), BusError> {
        let key_owned = key.to_string();
        let group_owned = group.to_string();

        // New groups start at the stream tail: historical backlog is not
        // replayed on first boot.
        let result = self
            .client
            .execute_with_retry("xgroup_create", |mut conn| {
                let key = key_owned.clone();
                let group = group_owned.clone();
                async move {
                    conn.xgroup_create_mkstream::<_, _, _, String>(key, group, "$").await
                }
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(BusError::ConnectionError { error }) if error.contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn delivery_from_entry(topic: &str, entry: &StreamId, delivery_count: u32) -> Option<Delivery> {
        let raw = entry.map.get(ENVELOPE_FIELD)?;
        let text: String = redis::from_redis_value(raw).ok()?;
        let payload: serde_json::Value = serde_json::from_str(&text).ok()?;
        Some(Delivery {
            id: entry.id.clone(),
            topic: topic.to_string(),
            payload,
            delivery_count,
        })
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), BusError> {
        let key = key.to_string();
        let group = group.to_string();
        let id = id.to_string();
        self.client
            .execute_with_retry("xack", |mut conn| {
                let key = key.clone();
                let group = group.clone();
                let id = id.clone();
                async move { conn.xack::<_, _, _, u64>(key, group, &[id]).await }
            })
            .await?;
        Ok(())
    }

    async fn send_to_dlq(
        &self,
        topic: &str,
        entry_id: &str,
        payload: &serde_json::Value,
        deliveries: u32,
        reason: &str,
    ) -> Result<(), BusError> {
        let dlq_key = self.client.config().stream_key(&dlq_topic(topic));
        let record = serde_json::json!({
            "envelope": payload,
            "source_topic": topic,
            "source_id": entry_id,
            "deliveries": deliveries,
            "reason": reason,
            "dead_lettered_at": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        let body = record.to_string();

        self.client
            .execute_with_retry("xadd_dlq", |mut conn| {
                let key = dlq_key.clone();
                let body = body.clone();
                async move {
                    conn.xadd::<_, _, _, _, String>(key, "*", &[(ENVELOPE_FIELD, body)]).await
                }
            })
            .await?;
        warn!(topic, entry_id, deliveries, reason, "entry routed to DLQ");
        Ok(())
    }

    /// Invoke the handler and settle the entry according to the verdict.
    async fn settle(
        &self,
        spec: &SubscriptionSpec,
        key: &str,
        handler: &Arc<dyn MessageHandler>,
        delivery: Delivery,
    ) {
        let entry_id = delivery.id.clone();
        let payload = delivery.payload.clone();
        let deliveries = delivery.delivery_count;

        match handler.handle(delivery).await {
            Verdict::Ack => {
                if let Err(e) = self.ack(key, &spec.group, &entry_id).await {
                    error!(topic = %spec.topic, entry_id, error = %e, "ack failed");
                }
            }
            Verdict::Nack { requeue: true } => {
                // Leave pending: the claim sweeper redelivers after the
                // visibility timeout.
                debug!(topic = %spec.topic, entry_id, "nack, awaiting redelivery");
            }
            Verdict::Nack { requeue: false } => {
                if let Err(e) = self
                    .send_to_dlq(&spec.topic, &entry_id, &payload, deliveries, "handler_discard")
                    .await
                {
                    error!(topic = %spec.topic, entry_id, error = %e, "DLQ routing failed");
                }
                if let Err(e) = self.ack(key, &spec.group, &entry_id).await {
                    error!(topic = %spec.topic, entry_id, error = %e, "ack failed");
                }
            }
        }
    }

    async fn read_batch(
        &self,
        key: &str,
        spec: &SubscriptionSpec,
    ) -> Result<Vec<StreamId>, BusError> {
        let config = self.client.config().clone();
        let key_owned = key.to_string();
        let group = spec.group.clone();
        let consumer = spec.consumer.clone();

        let reply: StreamReadReply = self
            .client
            .execute_blocking("xreadgroup", |mut conn| {
                let key = key_owned.clone();
                let group = group.clone();
                let consumer = consumer.clone();
                let options = StreamReadOptions::default()
                    .group(group, consumer)
                    .count(config.read_batch)
                    .block(config.block_timeout.as_millis() as usize);
                async move { conn.xread_options(&[key], &[">"], &options).await }
            })
            .await?;

        Ok(reply.keys.into_iter().flat_map(|k| k.ids).collect())
    }

    /// One pass over pending entries: redeliver abandoned ones, dead-letter
    /// those past the delivery limit.
    async fn sweep_pending(
        &self,
        key: &str,
        spec: &SubscriptionSpec,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let config = self.client.config().clone();
        let key_owned = key.to_string();
        let group = spec.group.clone();

        let pending: redis::streams::StreamPendingCountReply = self
            .client
            .execute_with_retry("xpending", |mut conn| {
                let key = key_owned.clone();
                let group = group.clone();
                async move {
                    conn.xpending_count(key, group, "-", "+", PENDING_SCAN_BATCH).await
                }
            })
            .await?;

        let visibility_ms = config.visibility_timeout.as_millis() as usize;

        for entry in pending.ids {
            if entry.last_delivered_ms < visibility_ms {
                continue;
            }

            let claimed: StreamClaimReply = self
                .client
                .execute_with_retry("xclaim", |mut conn| {
                    let key = key_owned.clone();
                    let group = spec.group.clone();
                    let consumer = spec.consumer.clone();
                    let id = entry.id.clone();
                    async move {
                        conn.xclaim(key, group, consumer, visibility_ms, &[id]).await
                    }
                })
                .await?;

            for stream_id in claimed.ids {
                let deliveries = entry.times_delivered as u32 + 1;

                if entry.times_delivered as u32 >= config.max_deliveries {
                    let payload = Self::delivery_from_entry(&spec.topic, &stream_id, deliveries)
                        .map(|d| d.payload)
                        .unwrap_or(serde_json::Value::Null);
                    self.send_to_dlq(
                        &spec.topic,
                        &stream_id.id,
                        &payload,
                        entry.times_delivered as u32,
                        "delivery_limit_exceeded",
                    )
                    .await?;
                    self.ack(key, &spec.group, &stream_id.id).await?;
                    continue;
                }

                match Self::delivery_from_entry(&spec.topic, &stream_id, deliveries) {
                    Some(delivery) => self.settle(spec, key, handler, delivery).await,
                    None => {
                        // Unparseable entry: dead-letter rather than loop.
                        self.send_to_dlq(
                            &spec.topic,
                            &stream_id.id,
                            &serde_json::Value::Null,
                            deliveries,
                            "unparseable_entry",
                        )
                        .await?;
                        self.ack(key, &spec.group, &stream_id.id).await?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        let key = self.client.config().stream_key(topic);
        let body = payload.to_string();

        let id: String = self
            .client
            .execute_with_retry("xadd", |mut conn| {
                let key = key.clone();
                let body = body.clone();
                async move {
                    conn.xadd::<_, _, _, _, String>(key, "*", &[(ENVELOPE_FIELD, body)]).await
                }
            })
            .await
            .map_err(|e| BusError::PublishError { topic: topic.to_string(), error: e.to_string() })?;

        if let Some(ttl) = options.ttl {
            let min_id = format!("{}-0", Utc::now().timestamp_millis() - ttl.as_millis() as i64);
            let key_trim = key.clone();
            let _ = self
                .client
                .execute_with_retry("xtrim", |mut conn| {
                    let key = key_trim.clone();
                    let min_id = min_id.clone();
                    async move {
                        redis::cmd("XTRIM")
                            .arg(key)
                            .arg("MINID")
                            .arg("~")
                            .arg(min_id)
                            .query_async::<_, u64>(&mut conn)
                            .await
                    }
                })
                .await;
        }

        if options.mirror {
            // Advisory copy for low-latency observers; loss is tolerated.
            let channel = self.client.config().mirror_channel(topic);
            let body = payload.to_string();
            let result = self
                .client
                .execute_with_retry("publish_mirror", |mut conn| {
                    let channel = channel.clone();
                    let body = body.clone();
                    async move { conn.publish::<_, _, u32>(channel, body).await }
                })
                .await;
            if let Err(e) = result {
                debug!(topic, error = %e, "mirror publish dropped");
            }
        }

        Ok(id)
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        let key = self.client.config().stream_key(&spec.topic);
        self.ensure_group(&key, &spec.group).await?;

        let token = CancellationToken::new();

        let reader = {
            let bus = RedisStreamBus { client: self.client.clone() };
            let spec = spec.clone();
            let key = key.clone();
            let handler = handler.clone();
            let token = token.clone();
            tokio::spawn(async move {
                info!(topic = %spec.topic, group = %spec.group, consumer = %spec.consumer, "subscription started");
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        batch = bus.read_batch(&key, &spec) => match batch {
                            Ok(entries) => {
                                for entry in entries {
                                    match RedisStreamBus::delivery_from_entry(&spec.topic, &entry, 1) {
                                        Some(delivery) => bus.settle(&spec, &key, &handler, delivery).await,
                                        None => {
                                            warn!(topic = %spec.topic, id = %entry.id, "unparseable entry");
                                            let _ = bus
                                                .send_to_dlq(&spec.topic, &entry.id, &serde_json::Value::Null, 1, "unparseable_entry")
                                                .await;
                                            let _ = bus.ack(&key, &spec.group, &entry.id).await;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(topic = %spec.topic, error = %e, "group read failed, backing off");
                                tokio::time::sleep(RedisClient::backoff_delay(1)).await;
                            }
                        }
                    }
                }
                info!(topic = %spec.topic, group = %spec.group, "subscription stopped");
            })
        };

        let sweeper = {
            let bus = RedisStreamBus { client: self.client.clone() };
            let spec = spec.clone();
            let key = key.clone();
            let handler = handler.clone();
            let token = token.clone();
            let interval = self.client.config().claim_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = bus.sweep_pending(&key, &spec, &handler).await {
                                warn!(topic = %spec.topic, error = %e, "pending sweep failed");
                            }
                        }
                    }
                }
            })
        };

        Ok(SubscriptionHandle::new(
            spec.topic,
            spec.group,
            token,
            vec![reader, sweeper],
        ))
    }

    async fn health(&self) -> Result<Duration, BusError> {
        self.client.ping().await
    }
}

enum Outbound {
    Message {
        topic: String,
        payload: serde_json::Value,
        options: PublishOptions,
    },
}

/// Bounded publish queue in front of a bus.
///
/// Absorbs short outages; when the queue fills, further publishes fail fast
/// with [`BusError::PublishBufferFull`] instead of blocking callers.
pub struct BufferedPublisher {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Outbound>>>,
    capacity: usize,
    drain: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BufferedPublisher {
    pub fn spawn(bus: Arc<dyn MessageBus>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Outbound>(capacity);
        let drain = tokio::spawn(async move {
            while let Some(Outbound::Message { topic, payload, options }) = rx.recv().await {
                if let Err(e) = bus.publish(&topic, payload, options).await {
                    error!(topic, error = %e, "buffered publish dropped");
                }
            }
        });
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            capacity,
            drain: parking_lot::Mutex::new(Some(drain)),
        }
    }

    pub fn try_publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<(), BusError> {
        let sender = {
            self.tx.lock().clone().ok_or_else(|| BusError::PublishError {
                topic: topic.to_string(),
                error: "publisher closed".to_string(),
            })?
        };
        sender
            .try_send(Outbound::Message { topic: topic.to_string(), payload, options })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    BusError::PublishBufferFull { capacity: self.capacity }
                }
                mpsc::error::TrySendError::Closed(_) => BusError::PublishError {
                    topic: topic.to_string(),
                    error: "publisher closed".to_string(),
                },
            })
    }

    /// Stop accepting new messages and wait for the queue to drain.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handle = { self.drain.lock().take() };
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBus;

    /// A bus whose publishes park until released, to fill the queue.
    struct StalledBus {
        inner: InMemoryBus,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl MessageBus for StalledBus {
        async fn publish(
            &self,
            topic: &str,
            payload: serde_json::Value,
            options: PublishOptions,
        ) -> Result<String, BusError> {
            let _permit = self.gate.acquire().await.map_err(|_| BusError::PublishError {
                topic: topic.to_string(),
                error: "gate closed".to_string(),
            })?;
            self.inner.publish(topic, payload, options).await
        }

        async fn subscribe(
            &self,
            spec: SubscriptionSpec,
            handler: Arc<dyn MessageHandler>,
        ) -> Result<SubscriptionHandle, BusError> {
            self.inner.subscribe(spec, handler).await
        }

        async fn health(&self) -> Result<Duration, BusError> {
            self.inner.health().await
        }
    }

    #[tokio::test]
    async fn buffered_publisher_drains_into_the_bus() {
        let bus = Arc::new(InMemoryBus::new(5));
        let publisher = BufferedPublisher::spawn(bus.clone(), 16);

        publisher
            .try_publish("events", serde_json::json!({"n": 1}), PublishOptions::default())
            .unwrap();
        publisher.shutdown().await;

        assert_eq!(bus.published_count("events"), 1);
    }

    #[tokio::test]
    async fn buffered_publisher_overflows_with_an_error() {
        let bus = Arc::new(StalledBus {
            inner: InMemoryBus::new(5),
            gate: tokio::sync::Semaphore::new(0),
        });
        let publisher = BufferedPublisher::spawn(bus.clone(), 2);

        // The first message is pulled off the queue and parks in publish;
        // two more then fill the queue itself.
        publisher
            .try_publish("events", serde_json::json!({"x": 1}), PublishOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher
            .try_publish("events", serde_json::json!({"x": 2}), PublishOptions::default())
            .unwrap();
        publisher
            .try_publish("events", serde_json::json!({"x": 3}), PublishOptions::default())
            .unwrap();

        let overflow = publisher.try_publish(
            "events",
            serde_json::json!({"x": 4}),
            PublishOptions::default(),
        );
        assert!(matches!(overflow, Err(BusError::PublishBufferFull { capacity: 2 })));

        // Releasing the gate lets the queue drain.
        bus.gate.add_permits(16);
        publisher.shutdown().await;
        assert_eq!(bus.inner.published_count("events"), 3);
    }
}
