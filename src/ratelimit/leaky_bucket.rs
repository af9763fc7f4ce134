//! Leaky bucket limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};

use super::backend::Limiter;

/// A capacity-limited bucket that fills per admitted request and drains at a
/// fixed leak rate, smoothing bursts.
///
/// The bucket starts empty. Leaking is computed lazily and, like token
/// refill, only whole elapsed seconds drain it.
pub struct LeakyBucket {
    /// Maximum level the bucket can reach
    capacity: u64,
    /// Units drained per elapsed second
    leak_rate: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<LeakState>,
}

struct LeakState {
    level: u64,
    last_leak: Instant,
}

impl LeakyBucket {
    /// Create an empty bucket on the system clock.
    pub fn new(capacity: u64, leak_rate: u64) -> Self {
        Self::with_clock(capacity, leak_rate, SystemClock::shared())
    }

    /// Create an empty bucket reading time from `clock`.
    pub fn with_clock(capacity: u64, leak_rate: u64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            capacity,
            leak_rate,
            clock,
            state: Mutex::new(LeakState {
                level: 0,
                last_leak: now,
            }),
        }
    }

    /// Add `n` units if the bucket has room for all of them.
    pub fn allow_n(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        self.leak(&mut state);

        match state.level.checked_add(n) {
            Some(level) if level <= self.capacity => {
                state.level = level;
                trace!(requested = n, level = level, "Leaky bucket admitted");
                true
            }
            _ => {
                debug!(
                    requested = n,
                    level = state.level,
                    capacity = self.capacity,
                    "Leaky bucket overflow"
                );
                false
            }
        }
    }

    /// Add a single unit if there is room.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Current level after leaking.
    pub fn level(&self) -> u64 {
        let mut state = self.state.lock();
        self.leak(&mut state);
        state.level
    }

    /// Get the capacity of this bucket.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the leak rate in units per second.
    pub fn leak_rate(&self) -> u64 {
        self.leak_rate
    }

    fn leak(&self, state: &mut LeakState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_leak).as_secs();
        if elapsed == 0 {
            return;
        }

        let leaked = elapsed.saturating_mul(self.leak_rate);
        state.level = state.level.saturating_sub(leaked);
        state.last_leak += Duration::from_secs(elapsed);
    }
}

impl Limiter for LeakyBucket {
    fn allow_n(&self, n: u64) -> bool {
        LeakyBucket::allow_n(self, n)
    }
}

impl std::fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("capacity", &self.capacity)
            .field("leak_rate", &self.leak_rate)
            .field("level", &self.state.lock().level)
            .finish()
    }
}
