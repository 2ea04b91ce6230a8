//! Daemon configuration, loaded from the environment. Connection strings
//! are required and have no implicit defaults; everything else falls back
//! to documented values.

use anyhow::{Context, Result};
use serde::Serialize;
use std::{env, time::Duration};

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorConfig {
    /// Postgres connection string (`DATABASE_URL`). Required.
    pub database_url: String,
    /// Message bus connection string (`BUS_URL`). Required.
    pub bus_url: String,
    /// Key-value store connection string (`KV_URL`). Required.
    pub kv_url: String,
    /// Prefix for every stream key, channel and KV key (`NAMESPACE`).
    pub namespace: String,
    /// HTTP listen port (`PORT`).
    pub port: u16,
    /// Log filter (`LOG_LEVEL`), e.g. "info" or "orchestratord=debug".
    pub log_level: String,
    /// Default per-task deadline (`DEFAULT_TASK_TIMEOUT_MS`).
    pub default_task_timeout_ms: u64,
    /// Default stage retry budget (`MAX_TASK_RETRIES`).
    pub max_task_retries: u32,
    /// Shared secret for webhook signature checks (`WEBHOOK_SECRET`).
    pub webhook_secret: Option<String>,
    /// Postgres pool size (`DB_POOL_SIZE`).
    pub db_pool_size: u32,
    /// Connection attempts per dependency at boot (`BOOT_RETRIES`).
    pub boot_retries: u32,
    /// Deadline for each graceful-shutdown phase (`SHUTDOWN_PHASE_TIMEOUT_SECS`).
    pub shutdown_phase_timeout: Duration,
}

fn optional<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| anyhow::anyhow!("invalid {name} value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl OrchestratorConfig {
    pub fn load() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL environment variable is required")?;
        let bus_url = env::var("BUS_URL").context("BUS_URL environment variable is required")?;
        let kv_url = env::var("KV_URL").context("KV_URL environment variable is required")?;

        let config = Self {
            database_url,
            bus_url,
            kv_url,
            namespace: env::var("NAMESPACE").unwrap_or_else(|_| "orchestrator".to_string()),
            port: optional("PORT", 8085)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            default_task_timeout_ms: optional("DEFAULT_TASK_TIMEOUT_MS", 300_000)?,
            max_task_retries: optional("MAX_TASK_RETRIES", 2)?,
            webhook_secret: env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            db_pool_size: optional("DB_POOL_SIZE", 10)?,
            boot_retries: optional("BOOT_RETRIES", 5)?,
            shutdown_phase_timeout: Duration::from_secs(optional(
                "SHUTDOWN_PHASE_TIMEOUT_SECS",
                10u64,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be greater than 0");
        }
        if self.database_url.is_empty() || self.bus_url.is_empty() || self.kv_url.is_empty() {
            anyhow::bail!("connection strings must be non-empty");
        }
        if self.namespace.is_empty() || self.namespace.contains(':') {
            anyhow::bail!("NAMESPACE must be non-empty and must not contain ':'");
        }
        if self.default_task_timeout_ms == 0 {
            anyhow::bail!("DEFAULT_TASK_TIMEOUT_MS must be greater than 0");
        }
        if self.db_pool_size == 0 {
            anyhow::bail!("DB_POOL_SIZE must be greater than 0");
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "Orchestrator config: port={}, namespace={}, db_pool={}, task_timeout_ms={}, max_retries={}",
            self.port,
            self.namespace,
            self.db_pool_size,
            self.default_task_timeout_ms,
            self.max_task_retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> OrchestratorConfig {
        OrchestratorConfig {
            database_url: "postgresql://localhost:5432/orchestrator".to_string(),
            bus_url: "redis://localhost:6379".to_string(),
            kv_url: "redis://localhost:6379".to_string(),
            namespace: "orchestrator".to_string(),
            port: 8085,
            log_level: "info".to_string(),
            default_task_timeout_ms: 300_000,
            max_task_retries: 2,
            webhook_secret: None,
            db_pool_size: 10,
            boot_retries: 5,
            shutdown_phase_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(base().validate().is_ok());

        let mut config = base();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = base();
        config.namespace = "a:b".to_string();
        assert!(config.validate().is_err());

        let mut config = base();
        config.default_task_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_carries_the_port() {
        assert!(base().summary().contains("port=8085"));
    }
}
