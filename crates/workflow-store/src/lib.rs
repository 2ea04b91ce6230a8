//! Persistence layer for the orchestration core.
//!
//! Repository ports per aggregate, a Postgres adapter built on sqlx, and an
//! in-memory fallback store with identical CAS semantics for the test
//! suites. Workflow rows are only ever mutated through a version-checked
//! compare-and-swap.

pub mod memory;
pub mod pg;
pub mod repo;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use repo::{
    AgentRepository, AgentTypeStats, CasResult, DefinitionRepository, PlatformRepository,
    SpanRecord, SpanRepository, StageAudit, StatsOverview, StatsPeriod, StatsRepository,
    TaskRepository, TimeBucket, TraceSummary, WorkflowFilter, WorkflowRepository, WorkflowRollup,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {error}")]
    Database { error: String },

    #[error("Serialization error: {error}")]
    Serialization { error: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => {
                StoreError::NotFound { entity: "row", id: String::new() }
            }
            other => StoreError::Database { error: other.to_string() },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization { error: e.to_string() }
    }
}
