//! Message plane for the orchestration core.
//!
//! This crate provides the two transport ports everything else is built on:
//! - A durable, at-least-once message bus with consumer groups, acknowledge-
//!   after-handling semantics, redelivery and per-topic dead-letter routing,
//!   backed by Redis streams with an advisory pub/sub mirror for observers.
//! - A key-value store with TTLs, atomic counters, set-if-absent and a
//!   scripted compare-and-swap, used for idempotency records and fenced locks.
//!
//! In-memory implementations of both ports live in [`memory`] and back the
//! integration test suites without a running Redis.

pub mod client;
pub mod kv;
pub mod memory;
pub mod ports;
pub mod pubsub;
pub mod streams;
pub mod types;

pub use client::RedisClient;
pub use kv::RedisKvStore;
pub use memory::{InMemoryBus, InMemoryKv};
pub use ports::{KeyValueStore, MessageBus, MessageHandler, SubscriptionHandle};
pub use pubsub::MirrorBus;
pub use streams::{BufferedPublisher, RedisStreamBus};
pub use types::{
    dlq_topic, events_topic, results_topic, tasks_topic, BusConfig, CasOutcome, ConnectionStatus,
    Delivery, PublishOptions, SubscriptionSpec, Verdict,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus connection error: {error}")]
    ConnectionError { error: String },

    #[error("Publish to {topic} failed: {error}")]
    PublishError { topic: String, error: String },

    #[error("Publish buffer full ({capacity} messages pending)")]
    PublishBufferFull { capacity: usize },

    #[error("Subscription on {topic} failed: {error}")]
    SubscriptionError { topic: String, error: String },

    #[error("Serialization error: {error}")]
    SerializationError { error: String },

    #[error("KV operation failed: {error}")]
    KvError { error: String },

    #[error("Lock {name} is held by another owner")]
    LockHeld { name: String },

    #[error("Operation timeout: {operation}")]
    OperationTimeout { operation: String },
}
