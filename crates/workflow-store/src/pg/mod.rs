//! Postgres adapters for the repository ports.

mod catalog;
mod stats;
mod tasks;
mod workflows;

use crate::StoreError;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database { error: e.to_string() })?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Decode a lower_snake enum column stored as TEXT.
pub(crate) fn parse_enum<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|e| {
        StoreError::Serialization { error: format!("bad {column} value {raw:?}: {e}") }
    })
}

/// Encode an enum as its lower_snake TEXT representation.
pub(crate) fn enum_text<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization {
            error: format!("expected string-encoded enum, got {other}"),
        }),
    }
}
