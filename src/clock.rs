//! Time sources for the limiters.
//!
//! Every limiter reads "now" through a [`Clock`] so that refill, leak and
//! window pruning can be driven deterministically in tests with
//! [`MockClock`] instead of sleeping in wall-clock time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Source of the current instant and a way to wait until a later one.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Suspend the caller until `deadline` has been reached.
    async fn sleep_until(&self, deadline: Instant);

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

/// Wall clock backed by `Instant::now()` and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }

    /// A shared system clock, the default for every limiter.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// Manually driven clock for tests.
///
/// All clones share the same time value. Sleeping on a mock clock advances
/// it to the deadline and yields, so reservation loops make progress
/// without any real waiting.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<Instant>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific instant.
    pub fn new(start: Instant) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.current_time.lock() += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        *self.current_time.lock() = instant;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current_time.lock()
    }

    async fn sleep_until(&self, deadline: Instant) {
        {
            let mut time = self.current_time.lock();
            if *time < deadline {
                *time = deadline;
            }
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2 > t1);
    }

    #[test]
    fn test_mock_clock() {
        let start = Instant::now();
        let clock = MockClock::new(start);

        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now(), start + Duration::from_secs(10));

        let new_time = start + Duration::from_secs(100);
        clock.set(new_time);
        assert_eq!(clock.now(), new_time);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let start = Instant::now();
        let clock = MockClock::new(start);
        let other = clock.clone();

        other.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), start + Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_mock_sleep_advances_time() {
        let start = Instant::now();
        let clock = MockClock::new(start);

        clock.sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.now(), start + Duration::from_millis(500));

        // Sleeping until a past instant leaves the clock alone.
        clock.sleep_until(start).await;
        assert_eq!(clock.now(), start + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_system_sleep() {
        let clock = SystemClock::new();
        let before = clock.now();
        clock.sleep(Duration::from_millis(20)).await;
        assert!(clock.now().duration_since(before) >= Duration::from_millis(20));
    }
}
