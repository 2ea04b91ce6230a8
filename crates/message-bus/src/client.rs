use crate::types::{BusConfig, ConnectionStatus};
use crate::BusError;
use rand::Rng;
use redis::{aio::ConnectionManager, RedisResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const BACKOFF_FLOOR_MS: u64 = 100;
const BACKOFF_CEILING_MS: u64 = 30_000;
const BACKOFF_JITTER: f64 = 0.10;

/// Shared Redis connection with automatic reconnect and bounded retries.
///
/// Both the stream adapter and the KV adapter run their commands through
/// [`RedisClient::execute_with_retry`]; a lost connection is re-established
/// with exponential backoff between attempts.
pub struct RedisClient {
    manager: Arc<RwLock<Option<ConnectionManager>>>,
    config: BusConfig,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl RedisClient {
    pub async fn connect(config: BusConfig) -> Result<Self, BusError> {
        let status = Arc::new(RwLock::new(ConnectionStatus::new(config.url.clone())));
        let client = Self {
            manager: Arc::new(RwLock::new(None)),
            config,
            status,
        };
        client.establish().await?;
        Ok(client)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    async fn establish(&self) -> Result<(), BusError> {
        let start = Instant::now();

        let client = redis::Client::open(self.config.url.as_str()).map_err(|e| {
            BusError::ConnectionError { error: format!("invalid redis URL: {e}") }
        })?;

        match ConnectionManager::new(client).await {
            Ok(manager) => {
                *self.manager.write().await = Some(manager);
                self.status.write().await.record_connection();
                info!(elapsed = ?start.elapsed(), "bus connection established");
                Ok(())
            }
            Err(e) => {
                let error = format!("failed to create connection manager: {e}");
                self.status.write().await.record_error(error.clone());
                error!(%error, "bus connection failed");
                Err(BusError::ConnectionError { error })
            }
        }
    }

    /// Exponential backoff from 100 ms to 30 s with 10% jitter.
    pub fn backoff_delay(attempt: u32) -> Duration {
        let base = BACKOFF_FLOOR_MS.saturating_mul(1u64 << attempt.min(16));
        let capped = base.min(BACKOFF_CEILING_MS) as f64;
        let jitter = capped * BACKOFF_JITTER;
        let delta = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_millis((capped + delta).max(1.0) as u64)
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, BusError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0u32;

        loop {
            let conn = { self.manager.read().await.clone() };

            let conn = match conn {
                Some(conn) => conn,
                None => {
                    if let Err(e) = self.establish().await {
                        if attempt >= self.config.max_retries {
                            return Err(e);
                        }
                        attempt += 1;
                        self.status.write().await.record_reconnect_attempt();
                        tokio::time::sleep(Self::backoff_delay(attempt)).await;
                        continue;
                    }
                    match self.manager.read().await.clone() {
                        Some(conn) => conn,
                        None => continue,
                    }
                }
            };

            match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    warn!(operation, error = %e, "redis command failed");
                    if attempt >= self.config.max_retries {
                        return Err(BusError::ConnectionError {
                            error: format!("{operation} failed after {attempt} retries: {e}"),
                        });
                    }
                    if e.is_connection_dropped() || e.is_io_error() {
                        *self.manager.write().await = None;
                        self.status.write().await.record_disconnection();
                    }
                }
                Err(_) => {
                    warn!(operation, "redis command timed out");
                    if attempt >= self.config.max_retries {
                        return Err(BusError::OperationTimeout { operation: operation.to_string() });
                    }
                }
            }

            attempt += 1;
            self.status.write().await.record_reconnect_attempt();
            tokio::time::sleep(Self::backoff_delay(attempt)).await;
        }
    }

    /// Blocking command path: same connection, no command timeout, used for
    /// XREADGROUP BLOCK where the call is expected to park.
    pub async fn execute_blocking<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, BusError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = { self.manager.read().await.clone() };
        let conn = match conn {
            Some(conn) => conn,
            None => {
                self.establish().await?;
                self.manager.read().await.clone().ok_or_else(|| BusError::ConnectionError {
                    error: "connection unavailable".to_string(),
                })?
            }
        };

        match f(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    *self.manager.write().await = None;
                    self.status.write().await.record_disconnection();
                }
                Err(BusError::ConnectionError { error: format!("{operation} failed: {e}") })
            }
        }
    }

    pub async fn ping(&self) -> Result<Duration, BusError> {
        let start = Instant::now();
        let pong: String = self
            .execute_with_retry("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        if pong == "PONG" {
            Ok(start.elapsed())
        } else {
            Err(BusError::ConnectionError { error: format!("unexpected PING reply: {pong}") })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = RedisClient::backoff_delay(0);
        assert!(first >= Duration::from_millis(89) && first <= Duration::from_millis(111));

        let capped = RedisClient::backoff_delay(20);
        assert!(capped <= Duration::from_millis(33_000));
        assert!(capped >= Duration::from_millis(26_900));
    }
}
