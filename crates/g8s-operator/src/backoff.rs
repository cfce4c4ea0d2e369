//! Retry delays for failed reconciliations.
//!
//! A key that keeps failing waits exponentially longer between attempts. All
//! keys of a kind also draw from one token bucket, so a burst of failures
//! cannot exceed an overall retry rate.
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
const DEFAULT_QPS: f64 = 50.0;
const DEFAULT_BURST: f64 = 300.0;

/// Per-item exponential backoff, bounded by a token bucket shared by all
/// items. The delay for an item is the larger of the two.
pub struct RateLimiter<T> {
    failures: HashMap<T, u32>,
    base_delay: Duration,
    max_delay: Duration,
    bucket: TokenBucket,
}

impl<T: Eq + Hash + Clone> RateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration, qps: f64, burst: f64) -> Self {
        Self {
            failures: HashMap::new(),
            base_delay,
            max_delay,
            bucket: TokenBucket::new(qps, burst),
        }
    }

    /// Records a failure of `item` and returns how long to wait before
    /// retrying it.
    pub fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_default();
        let exponent = *failures;
        *failures = failures.saturating_add(1);

        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let backoff = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let backoff = if backoff.is_finite() && backoff < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(backoff)
        } else {
            self.max_delay
        };

        backoff.max(self.bucket.reserve(Instant::now()))
    }

    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or_default()
    }
}

impl<T: Eq + Hash + Clone> Default for RateLimiter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
    }
}

/// A [`RateLimiter`] shared by every reconciliation of one kind.
pub struct SharedRateLimiter<T>(Mutex<RateLimiter<T>>);

impl<T: Eq + Hash + Clone> SharedRateLimiter<T> {
    pub fn when(&self, item: &T) -> Duration {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).when(item)
    }

    pub fn forget(&self, item: &T) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .num_requeues(item)
    }
}

impl<T> From<RateLimiter<T>> for SharedRateLimiter<T> {
    fn from(limiter: RateLimiter<T>) -> Self {
        Self(Mutex::new(limiter))
    }
}

impl<T: Eq + Hash + Clone> Default for SharedRateLimiter<T> {
    fn default() -> Self {
        RateLimiter::default().into()
    }
}

/// Token bucket where reservations may overdraw, returning the time until
/// the reserved token becomes available.
struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Option<Instant>,
}

impl TokenBucket {
    fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            tokens: burst,
            last: None,
        }
    }

    fn reserve(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        }
        self.last = Some(now);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}
