//! Sliding-window admission control keyed by client.
//!
//! A [`RateLimiter`] pairs an [`AdmissionStore`] backend with a [`Clock`].
//! The in-process backend keeps a timestamp log per key and implements a true
//! sliding window. The remote backends compose `INCR` + `EXPIRE`, which is a
//! fixed-window counter restarted every window: close to the sliding window,
//! but a client can get up to twice the quota across a window boundary.
//! Remote counters read their `TTL` on every increment and set the expiry
//! whenever it is missing, so a lost `EXPIRE` cannot pin a key forever.

mod memory;
mod redis_store;
mod rest_store;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub use memory::SlidingWindowStore;
pub use redis_store::RedisWindowStore;
pub use rest_store::RestWindowStore;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected,
    /// The backend could not be consulted.
    Unknown,
}

/// Where the comparison against `max_requests` happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Compare before recording. The `max+1`-th request in a window is
    /// rejected and rejected requests are not recorded.
    #[default]
    Strict,
    /// Record the attempt first, then reject once more than `max` requests
    /// preceded it. Admits one request more than `Strict` per window.
    CountThenCheck,
}

impl AdmissionPolicy {
    /// `prior` is the number of requests already counted in the window.
    pub fn admits(self, prior: usize, max: usize) -> bool {
        match self {
            AdmissionPolicy::Strict => prior < max,
            AdmissionPolicy::CountThenCheck => prior <= max,
        }
    }

    pub fn records_rejections(self) -> bool {
        matches!(self, AdmissionPolicy::CountThenCheck)
    }
}

/// What the handler does when the backend answers [`Decision::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFailurePolicy {
    FailOpen,
    #[default]
    FailClosed,
}

/// How a rejected request is reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStyle {
    /// `429 Too Many Requests`
    #[default]
    Hard,
    /// `200` with `"limited": true`
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub max_requests: usize,
    pub window: Duration,
}

impl Quota {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Window length in whole seconds, at least one. Used as a key TTL.
    pub fn window_secs(&self) -> i64 {
        self.window.as_secs().max(1) as i64
    }
}

/// Source of the current instant, injected so tests can move time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        self.origin + offset
    }
}

/// A rate-limit backend. `admit` must be an atomic check-and-record per key.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    async fn admit(&self, key: &str, now: Instant) -> Decision;

    /// Drop idle keys. Backends whose keys expire on their own keep the default.
    fn sweep(&self, _now: Instant) -> usize {
        0
    }

    fn name(&self) -> &'static str;
}

/// A counter key that came back from `TTL` with no expiry (`-1`) must get one,
/// whether it is new or an earlier `EXPIRE` was lost.
pub(crate) fn needs_expiry(ttl: i64) -> bool {
    ttl < 0
}

/// Turns a post-increment counter value into a decision.
pub(crate) fn decide_counter(count: i64, quota: &Quota, policy: AdmissionPolicy) -> Decision {
    let prior = count.saturating_sub(1).max(0) as usize;
    if policy.admits(prior, quota.max_requests) {
        Decision::Admitted
    } else {
        Decision::Rejected
    }
}

pub struct RateLimiter {
    store: Arc<dyn AdmissionStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AdmissionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn with_system_clock(store: Arc<dyn AdmissionStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub async fn admit(&self, key: &str) -> Decision {
        let decision = self.store.admit(key, self.clock.now()).await;
        debug!(key = %key, backend = self.store.name(), ?decision, "Rate limit check");
        decision
    }

    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now())
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }
}

/// Periodically drops idle keys from the in-process backend.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        info!("Rate limit sweeper started (interval: {:?})", every);
        loop {
            ticker.tick().await;
            let dropped = limiter.sweep();
            if dropped > 0 {
                debug!("Swept {} idle rate limit keys", dropped);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_rejects_at_max() {
        assert!(AdmissionPolicy::Strict.admits(9, 10));
        assert!(!AdmissionPolicy::Strict.admits(10, 10));
    }

    #[test]
    fn count_then_check_rejects_one_later() {
        assert!(AdmissionPolicy::CountThenCheck.admits(10, 10));
        assert!(!AdmissionPolicy::CountThenCheck.admits(11, 10));
    }

    #[test]
    fn counter_decisions() {
        let quota = Quota::new(3, Duration::from_secs(60));
        assert_eq!(decide_counter(1, &quota, AdmissionPolicy::Strict), Decision::Admitted);
        assert_eq!(decide_counter(3, &quota, AdmissionPolicy::Strict), Decision::Admitted);
        assert_eq!(decide_counter(4, &quota, AdmissionPolicy::Strict), Decision::Rejected);
        assert_eq!(
            decide_counter(4, &quota, AdmissionPolicy::CountThenCheck),
            Decision::Admitted
        );
        assert_eq!(
            decide_counter(5, &quota, AdmissionPolicy::CountThenCheck),
            Decision::Rejected
        );
    }

    #[test]
    fn keys_without_ttl_get_one() {
        assert!(needs_expiry(-1));
        assert!(needs_expiry(-2));
        assert!(!needs_expiry(0));
        assert!(!needs_expiry(899));
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[test]
    fn window_secs_never_zero() {
        assert_eq!(Quota::new(1, Duration::from_millis(10)).window_secs(), 1);
        assert_eq!(Quota::new(1, Duration::from_secs(900)).window_secs(), 900);
    }

    #[tokio::test]
    async fn limiter_reads_time_from_its_clock() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(SlidingWindowStore::new(
            Quota::new(1, Duration::from_secs(60)),
            AdmissionPolicy::Strict,
        ));
        let limiter = RateLimiter::new(store, clock.clone());

        assert_eq!(limiter.admit("a").await, Decision::Admitted);
        assert_eq!(limiter.admit("a").await, Decision::Rejected);
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.admit("a").await, Decision::Admitted);
    }
}
