//! Fixed-window rate limiting.
//!
//! Counts live in a shared store (Redis) when one is configured, so limits
//! hold across every server instance. If the shared store errors or times out
//! the limiter counts in process memory instead. That degrades protection to
//! per-instance limits; it never fails the request.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

mod guard;
mod local;
mod shared;

pub use guard::{
    AdminLogin, CastVote, ClientIdentity, RateLimitHeaders, RateLimited, RatePolicy, TokenLogin,
};
pub use local::LocalStore;
pub use shared::{RedisCounter, SharedCounter, SharedStoreError};

/// The outcome of a rate-limit check. Returned whether or not the request is
/// allowed, so the metadata can always be surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the current window ends.
    pub reset_at: i64,
    #[serde(skip)]
    retry_after: u64,
}

impl Decision {
    fn new(count: u64, max: u64, reset_at: i64, now: i64) -> Self {
        Self {
            allowed: count <= max,
            limit: max,
            remaining: max.saturating_sub(count),
            reset_at,
            retry_after: u64::try_from(reset_at - now).unwrap_or(0),
        }
    }

    /// Seconds until the window resets.
    pub fn retry_after(&self) -> u64 {
        self.retry_after
    }
}

/// A fixed-window rate limiter keyed by `(prefix, identity)`.
pub struct RateLimiter {
    shared: Option<Box<dyn SharedCounter>>,
    local: LocalStore,
    degraded: AtomicBool,
}

impl RateLimiter {
    pub fn new(shared: Option<Box<dyn SharedCounter>>, local: LocalStore) -> Self {
        Self {
            shared,
            local,
            degraded: AtomicBool::new(false),
        }
    }

    /// Count one request by `identity` against the `prefix` policy.
    pub async fn allow(
        &self,
        prefix: &str,
        identity: &str,
        window_seconds: u64,
        max: u64,
    ) -> Decision {
        self.allow_at(prefix, identity, window_seconds, max, Utc::now())
            .await
    }

    /// As [`RateLimiter::allow`], at an explicit instant.
    pub async fn allow_at(
        &self,
        prefix: &str,
        identity: &str,
        window_seconds: u64,
        max: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        let window_seconds = window_seconds.max(1);
        let max = max.max(1);
        let now = now.timestamp();
        let key = format!("ratelimit:{prefix}:{identity}");

        let (count, reset_at) = match self.shared_increment(&key, window_seconds).await {
            Some((count, ttl)) => (count, now.saturating_add(ttl as i64)),
            None => self.local.increment(&key, window_seconds, now),
        };
        Decision::new(count, max, reset_at, now)
    }

    /// Try the shared store, logging transitions in and out of degraded mode.
    async fn shared_increment(&self, key: &str, window_seconds: u64) -> Option<(u64, u64)> {
        let shared = self.shared.as_ref()?;
        match shared.increment(key, window_seconds).await {
            Ok(result) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Shared rate-limit store recovered");
                }
                Some(result)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!("Shared rate-limit store failed ({e}); falling back to in-process limits");
                }
                None
            }
        }
    }
}
