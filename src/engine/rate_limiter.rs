use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Every this many checks, expired client buckets are pruned.
const PRUNE_EVERY: u64 = 256;

/// Sliding-window rate limiter keyed by client address.
///
/// Each client gets a list of request timestamps within the window; a
/// request is refused once the list holds `max_requests` entries.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    /// Per-client buckets: key → timestamps within the window.
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            buckets: Mutex::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    /// Record one request for `key`.
    ///
    /// Fails with `AppError::RateLimited` carrying the seconds until the
    /// oldest entry in the window expires.
    pub fn check(&self, key: &str) -> Result<(), AppError> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let timestamps = buckets.entry(key.to_string()).or_default();

        // Evict expired entries
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests {
            let oldest = timestamps[0];
            let retry_after = self
                .window
                .checked_sub(now.duration_since(oldest))
                .unwrap_or(Duration::from_secs(1));
            tracing::debug!(client = %key, "Rate limit exceeded");
            return Err(AppError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        timestamps.push(now);
        Ok(())
    }

    /// Drop buckets whose entries have all expired.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < self.window);
            !timestamps.is_empty()
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
