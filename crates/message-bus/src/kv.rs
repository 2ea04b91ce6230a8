use crate::client::RedisClient;
use crate::ports::KeyValueStore;
use crate::types::CasOutcome;
use crate::BusError;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

/// Lua script backing the versioned compare-and-swap. Runs atomically on the
/// server; preserves any TTL already on the key.
const CAS_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return {'missing', 0}
end
local record = cjson.decode(raw)
local current = tonumber(record.version)
if current == tonumber(ARGV[1]) then
  local next_version = current + 1
  local updated = cjson.encode({version = next_version, value = cjson.decode(ARGV[2])})
  local ttl = redis.call('PTTL', KEYS[1])
  if ttl > 0 then
    redis.call('SET', KEYS[1], updated, 'PX', ttl)
  else
    redis.call('SET', KEYS[1], updated)
  end
  return {'applied', next_version}
else
  return {'conflict', current}
end
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

pub struct RedisKvStore {
    client: Arc<RedisClient>,
}

impl RedisKvStore {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.client.config().namespace, key)
    }
}

#[async_trait]
impl KeyValueStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, BusError> {
        let key = self.key(key);
        let raw: Option<String> = self
            .client
            .execute_with_retry("get", |mut conn| {
                let key = key.clone();
                async move { conn.get(key).await }
            })
            .await?;

        match raw {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| BusError::SerializationError { error: e.to_string() }),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let key = self.key(key);
        let body = value.to_string();

        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                self.client
                    .execute_with_retry("set_ex", |mut conn| {
                        let key = key.clone();
                        let body = body.clone();
                        async move { conn.set_ex::<_, _, ()>(key, body, secs).await }
                    })
                    .await
            }
            None => {
                self.client
                    .execute_with_retry("set", |mut conn| {
                        let key = key.clone();
                        let body = body.clone();
                        async move { conn.set::<_, _, ()>(key, body).await }
                    })
                    .await
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BusError> {
        let key = self.key(key);
        let removed: u32 = self
            .client
            .execute_with_retry("del", |mut conn| {
                let key = key.clone();
                async move { conn.del(key).await }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        let key = self.key(key);
        self.client
            .execute_with_retry("incr", |mut conn| {
                let key = key.clone();
                async move { conn.incr(key, 1i64).await }
            })
            .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, BusError> {
        let key = self.key(key);
        let body = value.to_string();

        let created: bool = match ttl {
            Some(ttl) => {
                let millis = ttl.as_millis().max(1) as u64;
                self.client
                    .execute_with_retry("set_nx_px", |mut conn| {
                        let key = key.clone();
                        let body = body.clone();
                        async move {
                            redis::cmd("SET")
                                .arg(key)
                                .arg(body)
                                .arg("NX")
                                .arg("PX")
                                .arg(millis)
                                .query_async::<_, Option<String>>(&mut conn)
                                .await
                                .map(|reply| reply.is_some())
                        }
                    })
                    .await?
            }
            None => {
                self.client
                    .execute_with_retry("set_nx", |mut conn| {
                        let key = key.clone();
                        let body = body.clone();
                        async move { conn.set_nx(key, body).await }
                    })
                    .await?
            }
        };

        Ok(created)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<CasOutcome, BusError> {
        let key = self.key(key);
        let body = value.to_string();

        let (state, version): (String, u64) = self
            .client
            .execute_with_retry("cas", |mut conn| {
                let key = key.clone();
                let body = body.clone();
                async move {
                    redis::Script::new(CAS_SCRIPT)
                        .key(key)
                        .arg(expected_version)
                        .arg(body)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        match state.as_str() {
            "applied" => Ok(CasOutcome::Applied { version }),
            "conflict" => Ok(CasOutcome::Conflict { actual: version }),
            "missing" => Ok(CasOutcome::Missing),
            other => Err(BusError::KvError { error: format!("unexpected CAS reply: {other}") }),
        }
    }

    async fn put_versioned(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<u64, BusError> {
        let record = serde_json::json!({ "version": 1, "value": value });
        self.set(key, record, ttl).await?;
        Ok(1)
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<Option<u64>, BusError> {
        // The fencing token is a cluster-wide monotonic counter; a stale
        // holder can never produce a newer token than the current one.
        let token = self.incr(&format!("lock-seq:{name}")).await? as u64;
        let acquired = self
            .set_if_absent(&format!("lock:{name}"), serde_json::json!(token), Some(ttl))
            .await?;
        Ok(acquired.then_some(token))
    }

    async fn release_lock(&self, name: &str, token: u64) -> Result<bool, BusError> {
        let key = self.key(&format!("lock:{name}"));
        let removed: u32 = self
            .client
            .execute_with_retry("unlock", |mut conn| {
                let key = key.clone();
                let token = token.to_string();
                async move {
                    redis::Script::new(UNLOCK_SCRIPT)
                        .key(key)
                        .arg(token)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn health(&self) -> Result<Duration, BusError> {
        self.client.ping().await
    }
}
