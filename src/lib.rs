pub mod api;
pub mod error;
pub mod intake;
pub mod logging;
pub mod message;
pub mod rate_limit;
pub mod relay;
pub mod utils;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{RelayError, Result};
use crate::intake::IntakeConfig;
use crate::rate_limit::{
    AdmissionPolicy, AdmissionStore, BackendFailurePolicy, Quota, RateLimiter, RedisWindowStore,
    RejectionStyle, RestWindowStore, SlidingWindowStore,
};
use crate::relay::{Relay, RelaySettings, TelegramRelay};

const DEFAULT_MAX_REQUESTS: usize = 10;
const DEFAULT_WINDOW_SECS: u64 = 15 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_KEY_PREFIX: &str = "ratelimit:";
const REMOTE_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub intake: IntakeConfig,
    pub relay: RelaySettings,
    pub errors: ErrorConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Exact `Origin` values accepted. Empty disables the check.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
    Rest,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: BackendKind,
    pub max_requests: usize,
    pub window_secs: u64,
    pub policy: AdmissionPolicy,
    pub rejection: RejectionStyle,
    pub on_backend_error: BackendFailurePolicy,
    pub sweep_interval_secs: u64,
    pub key_prefix: String,
    pub redis_url: Option<String>,
    pub rest_url: Option<String>,
    pub rest_token: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Memory,
            max_requests: DEFAULT_MAX_REQUESTS,
            window_secs: DEFAULT_WINDOW_SECS,
            policy: AdmissionPolicy::Strict,
            rejection: RejectionStyle::Hard,
            on_backend_error: BackendFailurePolicy::FailClosed,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            redis_url: None,
            rest_url: None,
            rest_token: None,
        }
    }
}

impl RateLimitConfig {
    pub fn quota(&self) -> Quota {
        Quota::new(self.max_requests, Duration::from_secs(self.window_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Only the in-process backend keeps idle keys around.
    pub fn needs_sweeper(&self) -> bool {
        self.enabled && self.backend == BackendKind::Memory
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ErrorConfig {
    /// Pass validation and relay error details through to the client.
    pub expose_details: bool,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            expose_details: true,
        }
    }
}

impl RelayConfig {
    /// Returns the bot token, or an error if none was configured.
    pub fn bot_token(&self) -> Result<&str> {
        self.relay
            .bot_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                RelayError::ConfigError("bot token missing (set BOT_TOKEN or relay.bot_token)".into())
            })
    }

    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limit;
        if limits.enabled {
            if limits.max_requests == 0 {
                return Err(RelayError::ConfigError("rate_limit.max_requests must be > 0".into()));
            }
            if limits.window_secs == 0 {
                return Err(RelayError::ConfigError("rate_limit.window_secs must be > 0".into()));
            }
            match limits.backend {
                BackendKind::Redis if limits.redis_url.is_none() => {
                    return Err(RelayError::ConfigError(
                        "rate_limit.redis_url is required for the redis backend".into(),
                    ));
                }
                BackendKind::Rest if limits.rest_url.is_none() || limits.rest_token.is_none() => {
                    return Err(RelayError::ConfigError(
                        "rate_limit.rest_url and rate_limit.rest_token are required for the rest backend"
                            .into(),
                    ));
                }
                _ => {}
            }
        }
        self.bot_token()?;
        Ok(())
    }
}

/// Load and parse the configuration file, then apply environment overrides.
///
/// A missing file falls back to defaults so env-only deployments work.
pub fn load_config(path: impl AsRef<Path>) -> Result<RelayConfig> {
    let path = path.as_ref();
    let mut config: RelayConfig = if path.exists() {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        toml::from_str(&config_str)?
    } else {
        warn!("Config file {:?} not found, using defaults", path);
        RelayConfig::default()
    };

    if let Ok(token) = std::env::var("BOT_TOKEN") {
        config.relay.bot_token = Some(token);
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.rate_limit.redis_url = Some(url);
    }

    config.validate()?;
    Ok(config)
}

pub struct AppState {
    pub config: RelayConfig,
    /// `None` when rate limiting is disabled.
    pub limiter: Option<Arc<RateLimiter>>,
    pub relay: Arc<dyn Relay>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: RelayConfig, limiter: Option<Arc<RateLimiter>>, relay: Arc<dyn Relay>) -> Self {
        Self {
            config,
            limiter,
            relay,
            started_at: Utc::now(),
        }
    }
}

/// Builds the configured rate-limit backend.
pub async fn build_limiter(config: &RateLimitConfig) -> Result<Option<Arc<RateLimiter>>> {
    if !config.enabled {
        info!("Rate limiting disabled");
        return Ok(None);
    }

    let quota = config.quota();
    let store: Arc<dyn AdmissionStore> = match config.backend {
        BackendKind::Memory => Arc::new(SlidingWindowStore::new(quota, config.policy)),
        BackendKind::Redis => {
            let url = config.redis_url.as_deref().unwrap_or_default();
            Arc::new(RedisWindowStore::new(
                url,
                quota,
                config.policy,
                config.key_prefix.clone(),
                REMOTE_STORE_TIMEOUT,
            )?)
        }
        BackendKind::Rest => Arc::new(RestWindowStore::new(
            config.rest_url.as_deref().unwrap_or_default(),
            config.rest_token.as_deref().unwrap_or_default(),
            quota,
            config.policy,
            config.key_prefix.clone(),
            REMOTE_STORE_TIMEOUT,
        )?),
    };

    info!(
        "Rate limit: {} requests per {} seconds ({:?}, {} backend)",
        config.max_requests,
        config.window_secs,
        config.policy,
        store.name()
    );
    Ok(Some(Arc::new(RateLimiter::with_system_clock(store))))
}

/// Wires the limiter and the Telegram relay from a validated config.
pub async fn build_state(config: RelayConfig) -> Result<SharedState> {
    let limiter = build_limiter(&config.rate_limit).await?;
    let relay = TelegramRelay::new(&config.relay, config.bot_token()?)?;
    Ok(Arc::new(AppState::new(config, limiter, Arc::new(relay))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> RelayConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("");
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_secs, 900);
        assert_eq!(config.rate_limit.policy, AdmissionPolicy::Strict);
        assert_eq!(config.rate_limit.rejection, RejectionStyle::Hard);
        assert_eq!(
            config.rate_limit.on_backend_error,
            BackendFailurePolicy::FailClosed
        );
        assert!(config.intake.validate_coordinates);
        assert!(config.errors.expose_details);
        assert_eq!(config.relay.api_base, "https://api.telegram.org");
    }

    #[test]
    fn parses_full_config() {
        let config = parse(
            r#"
            [server]
            allowed_origins = ["https://maps.example.com"]

            [rate_limit]
            backend = "redis"
            redis_url = "redis://127.0.0.1/"
            max_requests = 5
            window_secs = 900
            policy = "count_then_check"
            rejection = "soft"
            on_backend_error = "fail_open"

            [intake]
            sanitize = "lenient"
            max_field_len = 64

            [relay]
            bot_token = "123:abc"
            template = "compact"
            timeout_secs = 3

            [errors]
            expose_details = false
            "#,
        );

        assert_eq!(config.server.allowed_origins.len(), 1);
        assert_eq!(config.rate_limit.backend, BackendKind::Redis);
        assert_eq!(config.rate_limit.policy, AdmissionPolicy::CountThenCheck);
        assert_eq!(config.rate_limit.rejection, RejectionStyle::Soft);
        assert_eq!(
            config.rate_limit.on_backend_error,
            BackendFailurePolicy::FailOpen
        );
        assert_eq!(config.rate_limit.quota().max_requests, 5);
        assert_eq!(config.intake.max_field_len, 64);
        assert_eq!(config.relay.timeout_secs, 3);
        assert!(!config.errors.expose_details);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_catches_bad_settings() {
        let mut config = parse("[relay]\nbot_token = \"t\"");
        assert!(config.validate().is_ok());

        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());
        config.rate_limit.max_requests = 10;

        config.rate_limit.backend = BackendKind::Rest;
        assert!(config.validate().is_err());
        config.rate_limit.enabled = false;
        assert!(config.validate().is_ok());

        config.relay.bot_token = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let result: std::result::Result<RelayConfig, _> =
            toml::from_str("[rate_limit]\npolicy = \"lenient\"");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disabled_limiter_is_none() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        assert!(build_limiter(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_limiter_by_default() {
        let limiter = build_limiter(&RateLimitConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(limiter.backend_name(), "memory");
    }

    #[tokio::test]
    async fn unreachable_redis_does_not_block_startup() {
        let config = RateLimitConfig {
            backend: BackendKind::Redis,
            redis_url: Some("redis://127.0.0.1:1/".to_string()),
            on_backend_error: BackendFailurePolicy::FailOpen,
            ..RateLimitConfig::default()
        };
        let limiter = build_limiter(&config).await.unwrap().unwrap();
        assert_eq!(limiter.backend_name(), "redis");
    }

    #[test]
    fn sweeper_only_for_enabled_memory_backend() {
        let mut config = RateLimitConfig::default();
        assert!(config.needs_sweeper());

        config.backend = BackendKind::Rest;
        assert!(!config.needs_sweeper());

        config.backend = BackendKind::Memory;
        config.enabled = false;
        assert!(!config.needs_sweeper());
    }

    #[test]
    fn unreadable_config_file_is_a_config_error() {
        // a directory exists but cannot be read as a file
        let result = load_config(std::env::temp_dir());
        assert!(matches!(result, Err(RelayError::ConfigError(_))));
    }
}
