use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{AdmissionPolicy, AdmissionStore, Decision, Quota};

/// In-process sliding-window log. State is lost on restart.
pub struct SlidingWindowStore {
    quota: Quota,
    policy: AdmissionPolicy,
    /// tracks request timestamps per client key, oldest first
    requests: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowStore {
    pub fn new(quota: Quota, policy: AdmissionPolicy) -> Self {
        Self {
            quota,
            policy,
            requests: DashMap::new(),
        }
    }

    /// Checks `key` against the quota at `now`, recording the request if admitted.
    ///
    /// The map entry guard holds the shard's write lock for the whole
    /// read-prune-compare-append sequence, so two calls for the same key can
    /// never both see `max - 1`.
    pub fn check(&self, key: &str, now: Instant) -> Decision {
        let mut timestamps = match self.requests.get_mut(key) {
            Some(entry) => entry,
            None => self.requests.entry(key.to_string()).or_default(),
        };

        prune(&mut timestamps, now, self.quota.window);

        let admitted = self.policy.admits(timestamps.len(), self.quota.max_requests);
        if admitted || self.policy.records_rejections() {
            timestamps.push_back(now);
        }

        // Only the newest max+1 entries can still affect a future decision.
        while timestamps.len() > self.quota.max_requests + 1 {
            timestamps.pop_front();
        }

        if admitted {
            Decision::Admitted
        } else {
            Decision::Rejected
        }
    }

    /// Drops every key whose log is empty once pruned at `now`.
    /// Returns the number of keys dropped.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, timestamps| {
            prune(timestamps, now, self.quota.window);
            !timestamps.is_empty()
        });
        before.saturating_sub(self.requests.len())
    }

    /// Requests currently counted for `key`, without recording anything.
    pub fn count(&self, key: &str, now: Instant) -> usize {
        self.requests
            .get(key)
            .map(|timestamps| {
                timestamps
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < self.quota.window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn tracked_keys(&self) -> usize {
        self.requests.len()
    }
}

/// Removes timestamps older than the window from the front of the log.
fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = timestamps.front() {
        if now.saturating_duration_since(oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[async_trait]
impl AdmissionStore for SlidingWindowStore {
    async fn admit(&self, key: &str, now: Instant) -> Decision {
        self.check(key, now)
    }

    fn sweep(&self, now: Instant) -> usize {
        self.sweep_idle(now)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
