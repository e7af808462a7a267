use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{AdmissionPolicy, AdmissionStore, Decision, Quota, decide_counter, needs_expiry};
use crate::error::RelayError;

#[derive(Debug, thiserror::Error)]
enum RestStoreError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("command rejected: {0}")]
    Command(String),

    #[error("unexpected reply: {0}")]
    Unexpected(String),
}

/// Reply envelope of an Upstash-style REST endpoint.
#[derive(Debug, Deserialize)]
struct CommandReply {
    result: Option<Value>,
    error: Option<String>,
}

/// The same `INCR` + `TTL` + `EXPIRE` composition as
/// [`super::RedisWindowStore`], issued as `POST {url}/{command}/{args..}`
/// to a key-value store's REST endpoint.
pub struct RestWindowStore {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    quota: Quota,
    policy: AdmissionPolicy,
    key_prefix: String,
}

impl RestWindowStore {
    pub fn new(
        base_url: &str,
        token: &str,
        quota: Quota,
        policy: AdmissionPolicy,
        key_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RelayError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RelayError::ConfigError(format!("Invalid rest_url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RelayError::ConfigError(format!(
                "Invalid rest_url: {} cannot take a path",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        info!("Rate limiting through REST store at {}", base_url);
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            quota,
            policy,
            key_prefix: key_prefix.into(),
        })
    }

    /// `{base}/{parts..}` with each part percent-encoded as one path segment.
    fn command_url(&self, parts: &[&str]) -> Result<Url, RestStoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RestStoreError::Unexpected("base URL cannot take a path".into()))?
            .pop_if_empty()
            .extend(parts);
        Ok(url)
    }

    async fn command(&self, parts: &[&str]) -> Result<i64, RestStoreError> {
        let reply: CommandReply = self
            .client
            .post(self.command_url(parts)?)
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = reply.error {
            return Err(RestStoreError::Command(error));
        }
        reply
            .result
            .as_ref()
            .and_then(Value::as_i64)
            .ok_or_else(|| RestStoreError::Unexpected(format!("{} did not return an integer", parts[0])))
    }

    async fn increment(&self, key: &str) -> Result<i64, RestStoreError> {
        let count = self.command(&["incr", key]).await?;
        let ttl = self.command(&["ttl", key]).await?;
        if needs_expiry(ttl) {
            let secs = self.quota.window_secs().to_string();
            self.command(&["expire", key, &secs]).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl AdmissionStore for RestWindowStore {
    async fn admit(&self, key: &str, _now: Instant) -> Decision {
        let key = format!("{}{}", self.key_prefix, key);
        match self.increment(&key).await {
            Ok(count) => decide_counter(count, &self.quota, self.policy),
            Err(e) => {
                warn!("REST rate limit check failed for '{}': {}", key, e);
                Decision::Unknown
            }
        }
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}
