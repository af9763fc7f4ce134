//! Adaptive limiter driven by observed error rates.
//!
//! The limiter owns a [`TokenBucket`] sized from its current rate and
//! periodically resizes it: a high error rate backs the rate off, a very low
//! one ramps it up. Adjustment happens lazily on the admission path, never on
//! a background task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

use super::backend::Limiter;
use super::token_bucket::TokenBucket;

/// Default time between adjustments.
pub const DEFAULT_ADJUST_INTERVAL: Duration = Duration::from_secs(10);

/// Error rate above which the rate is decreased.
const BACKOFF_THRESHOLD: f64 = 0.10;
/// Error rate below which the rate is increased.
const RAMP_UP_THRESHOLD: f64 = 0.01;
const BACKOFF_FACTOR: f64 = 0.8;
const RAMP_UP_FACTOR: f64 = 1.2;

/// Snapshot of the adaptive limiter's control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveStats {
    /// Rate currently enforced, in requests per second
    pub current_rate: u64,
    /// Successes recorded since the last adjustment
    pub successes: u64,
    /// Errors recorded since the last adjustment
    pub errors: u64,
}

/// A token bucket whose rate follows the observed error rate.
pub struct AdaptiveLimiter {
    min_rate: u64,
    max_rate: u64,
    adjust_interval: Duration,
    clock: Arc<dyn Clock>,
    current_rate: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    /// Guards the adjustment critical section
    last_adjust: Mutex<Instant>,
    bucket: RwLock<Arc<TokenBucket>>,
}

impl AdaptiveLimiter {
    /// Create a limiter on the system clock.
    ///
    /// `initial_rate` is clamped into `[min_rate, max_rate]`.
    pub fn new(initial_rate: u64, min_rate: u64, max_rate: u64) -> Self {
        Self::with_clock(
            initial_rate,
            min_rate,
            max_rate,
            DEFAULT_ADJUST_INTERVAL,
            SystemClock::shared(),
        )
    }

    /// Create a limiter with an explicit adjustment interval and clock.
    pub fn with_clock(
        initial_rate: u64,
        min_rate: u64,
        max_rate: u64,
        adjust_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rate = clamp_rate(initial_rate, min_rate, max_rate);
        let now = clock.now();
        let bucket = Arc::new(Self::bucket_for(rate, clock.clone()));

        Self {
            min_rate,
            max_rate,
            adjust_interval,
            clock,
            current_rate: AtomicU64::new(rate),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_adjust: Mutex::new(now),
            bucket: RwLock::new(bucket),
        }
    }

    /// Run a pending adjustment, then take a token from the owned bucket.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Run a pending adjustment, then take `n` tokens from the owned bucket.
    pub fn allow_n(&self, n: u64) -> bool {
        self.adjust();
        self.bucket().allow_n(n)
    }

    /// Report a successful downstream outcome.
    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Report a failed downstream outcome.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    /// The rate currently enforced.
    pub fn current_rate(&self) -> u64 {
        self.current_rate.load(Ordering::SeqCst)
    }

    /// Counters pending the next adjustment and the current rate.
    pub fn stats(&self) -> AdaptiveStats {
        AdaptiveStats {
            current_rate: self.current_rate(),
            successes: self.success_count.load(Ordering::SeqCst),
            errors: self.error_count.load(Ordering::SeqCst),
        }
    }

    /// Tokens left in the owned bucket.
    pub fn tokens(&self) -> u64 {
        self.bucket().tokens()
    }

    /// Get the lower rate bound.
    pub fn min_rate(&self) -> u64 {
        self.min_rate
    }

    /// Get the upper rate bound.
    pub fn max_rate(&self) -> u64 {
        self.max_rate
    }

    fn bucket(&self) -> Arc<TokenBucket> {
        self.bucket.read().clone()
    }

    /// Recompute the rate if the adjustment interval has elapsed.
    ///
    /// Counters are swapped to zero inside the critical section so that a
    /// concurrent `record_*` lands either in this cycle or the next one.
    fn adjust(&self) {
        let now = self.clock.now();
        let mut last_adjust = self.last_adjust.lock();
        if now.saturating_duration_since(*last_adjust) < self.adjust_interval {
            return;
        }
        *last_adjust = now;

        let successes = self.success_count.swap(0, Ordering::SeqCst);
        let errors = self.error_count.swap(0, Ordering::SeqCst);
        let total = successes + errors;
        if total == 0 {
            return;
        }

        let error_rate = errors as f64 / total as f64;
        let current = self.current_rate();
        let proposed = if error_rate > BACKOFF_THRESHOLD {
            (current as f64 * BACKOFF_FACTOR) as u64
        } else if error_rate < RAMP_UP_THRESHOLD {
            (current as f64 * RAMP_UP_FACTOR) as u64
        } else {
            current
        };
        let new_rate = clamp_rate(proposed, self.min_rate, self.max_rate);

        debug!(
            successes = successes,
            errors = errors,
            error_rate = error_rate,
            current_rate = current,
            "Adaptive adjustment"
        );

        if new_rate != current {
            // Swap the bucket before publishing the rate so a reader of the
            // new rate never sees the old bucket.
            *self.bucket.write() = Arc::new(Self::bucket_for(new_rate, self.clock.clone()));
            self.current_rate.store(new_rate, Ordering::SeqCst);
            info!(
                old_rate = current,
                new_rate = new_rate,
                error_rate = error_rate,
                "Adaptive rate changed"
            );
        }
    }

    fn bucket_for(rate: u64, clock: Arc<dyn Clock>) -> TokenBucket {
        TokenBucket::with_clock(rate.saturating_mul(2), rate, clock)
    }
}

/// Clamp without panicking when the bounds are inverted; `max_rate` wins.
fn clamp_rate(rate: u64, min_rate: u64, max_rate: u64) -> u64 {
    rate.max(min_rate).min(max_rate)
}

impl Limiter for AdaptiveLimiter {
    fn allow_n(&self, n: u64) -> bool {
        AdaptiveLimiter::allow_n(self, n)
    }
}

impl std::fmt::Debug for AdaptiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLimiter")
            .field("min_rate", &self.min_rate)
            .field("max_rate", &self.max_rate)
            .field("current_rate", &self.current_rate())
            .field("adjust_interval", &self.adjust_interval)
            .finish()
    }
}
