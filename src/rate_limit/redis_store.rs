use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, RedisResult, aio::ConnectionManager};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{AdmissionPolicy, AdmissionStore, Decision, Quota, decide_counter, needs_expiry};
use crate::error::RelayError;

/// Fixed-window counter in Redis: `INCR key` and `TTL key` in one `MULTI`,
/// then `EXPIRE key window` whenever the key has no expiry. Every attempt is
/// counted, including rejected ones.
///
/// The connection is opened on first use, so an unreachable server at boot
/// surfaces as [`Decision::Unknown`] instead of a startup failure.
pub struct RedisWindowStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    connect_timeout: Duration,
    quota: Quota,
    policy: AdmissionPolicy,
    key_prefix: String,
}

impl RedisWindowStore {
    pub fn new(
        redis_url: &str,
        quota: Quota,
        policy: AdmissionPolicy,
        key_prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let client = Client::open(redis_url)
            .map_err(|e| RelayError::ConfigError(format!("Invalid redis_url: {}", e)))?;

        info!("Rate limiting through Redis");
        Ok(Self {
            client,
            connection: OnceCell::new(),
            connect_timeout,
            quota,
            policy,
            key_prefix: key_prefix.into(),
        })
    }

    async fn connection(&self) -> RedisResult<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                match tokio::time::timeout(self.connect_timeout, self.client.get_connection_manager())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RedisError::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timed out connecting to Redis",
                    ))),
                }
            })
            .await?;
        // ConnectionManager is a cheap handle over one multiplexed connection
        Ok(connection.clone())
    }

    async fn increment(&self, key: &str) -> RedisResult<i64> {
        let mut connection = self.connection().await?;
        let (count, ttl): (i64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .ttl(key)
            .query_async(&mut connection)
            .await?;

        if needs_expiry(ttl) {
            let _: bool = connection.expire(key, self.quota.window_secs()).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl AdmissionStore for RedisWindowStore {
    async fn admit(&self, key: &str, _now: Instant) -> Decision {
        let key = format!("{}{}", self.key_prefix, key);
        match self.increment(&key).await {
            Ok(count) => decide_counter(count, &self.quota, self.policy),
            Err(e) => {
                warn!("Redis rate limit check failed for '{}': {}", key, e);
                Decision::Unknown
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
