//! Sliding window log limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};

use super::backend::Limiter;

/// Exact request log over a trailing window.
///
/// A request admitted at `t` counts against the limit for all `now` with
/// `now - window < t`, i.e. the window is `(now - window, now]`. An entry
/// sitting exactly on `now - window` has expired.
pub struct SlidingWindow {
    window: Duration,
    limit: u64,
    clock: Arc<dyn Clock>,
    log: Mutex<WindowLog>,
}

/// Admissions grouped by instant, oldest first.
///
/// Time is read while the log is locked, so runs are appended in clock
/// order and pruning from the head never skips an expired run.
#[derive(Debug, Default)]
struct WindowLog {
    runs: VecDeque<(Instant, u64)>,
    /// Sum of all run counts
    total: u64,
}

impl WindowLog {
    fn prune(&mut self, cutoff: Instant) {
        while let Some(&(at, count)) = self.runs.front() {
            if at > cutoff {
                break;
            }
            self.total -= count;
            self.runs.pop_front();
        }
    }

    fn record(&mut self, now: Instant, n: u64) {
        match self.runs.back_mut() {
            Some((at, count)) if *at == now => *count += n,
            _ => self.runs.push_back((now, n)),
        }
        self.total += n;
    }
}

impl SlidingWindow {
    /// Create a window on the system clock.
    pub fn new(window: Duration, limit: u64) -> Self {
        Self::with_clock(window, limit, SystemClock::shared())
    }

    /// Create a window reading time from `clock`.
    pub fn with_clock(window: Duration, limit: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            limit,
            clock,
            log: Mutex::new(WindowLog::default()),
        }
    }

    /// Record a request if fewer than `limit` are inside the window.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Record `n` requests at once, all or nothing.
    pub fn allow_n(&self, n: u64) -> bool {
        let mut log = self.log.lock();
        let now = self.clock.now();
        self.prune(&mut log, now);

        let count = log.total;
        if count.checked_add(n).map_or(true, |total| total > self.limit) {
            debug!(
                requested = n,
                count = count,
                limit = self.limit,
                "Sliding window full"
            );
            return false;
        }

        if n > 0 {
            log.record(now, n);
        }
        trace!(requested = n, count = log.total, "Sliding window admitted");
        true
    }

    /// Number of requests currently inside the window.
    pub fn request_count(&self) -> u64 {
        let mut log = self.log.lock();
        let now = self.clock.now();
        self.prune(&mut log, now);
        log.total
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the limit per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn prune(&self, log: &mut WindowLog, now: Instant) {
        // Before the clock has run for a full window nothing can be expired.
        if let Some(cutoff) = now.checked_sub(self.window) {
            log.prune(cutoff);
        }
    }
}

impl Limiter for SlidingWindow {
    fn allow_n(&self, n: u64) -> bool {
        SlidingWindow::allow_n(self, n)
    }
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.lock();
        f.debug_struct("SlidingWindow")
            .field("window", &self.window)
            .field("limit", &self.limit)
            .field("entries", &log.total)
            .field("runs", &log.runs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock_window(window: Duration, limit: u64) -> (SlidingWindow, MockClock) {
        let clock = MockClock::default();
        let limiter = SlidingWindow::with_clock(window, limit, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_admits_exactly_limit() {
        let (window, clock) = mock_window(Duration::from_secs(1), 5);

        for i in 1..=5 {
            assert!(window.allow(), "Request {} should be admitted", i);
        }
        assert!(!window.allow());
        assert_eq!(window.request_count(), 5);

        clock.advance(Duration::from_millis(1001));
        assert_eq!(window.request_count(), 0);
        assert!(window.allow());
    }

    #[test]
    fn test_entry_on_boundary_is_expired() {
        let (window, clock) = mock_window(Duration::from_secs(1), 1);
        assert!(window.allow());

        clock.advance(Duration::from_millis(999));
        assert!(!window.allow());

        clock.advance(Duration::from_millis(1));
        assert_eq!(window.request_count(), 0);
        assert!(window.allow());
    }

    #[test]
    fn test_partial_expiry_slides() {
        let (window, clock) = mock_window(Duration::from_secs(10), 3);
        assert!(window.allow());
        clock.advance(Duration::from_secs(4));
        assert!(window.allow());
        assert!(window.allow());
        assert!(!window.allow());

        // Only the first entry has left the window.
        clock.advance(Duration::from_secs(6));
        assert_eq!(window.request_count(), 2);
        assert!(window.allow());
        assert!(!window.allow());
    }

    #[test]
    fn test_allow_n_all_or_nothing() {
        let (window, _clock) = mock_window(Duration::from_secs(1), 5);
        assert!(window.allow_n(3));
        assert!(!window.allow_n(3));
        assert_eq!(window.request_count(), 3);
        assert!(window.allow_n(2));
    }

    #[test]
    fn test_zero_limit_rejects() {
        let (window, _clock) = mock_window(Duration::from_secs(1), 0);
        assert!(!window.allow());
        assert_eq!(window.request_count(), 0);
    }

    /// Replays fixed offsets from a base instant, then holds the last one.
    /// The first read stalls its caller.
    #[derive(Debug)]
    struct ScriptedClock {
        base: Instant,
        offsets: Vec<Duration>,
        calls: AtomicUsize,
        first_read_stall: Duration,
    }

    #[async_trait]
    impl Clock for ScriptedClock {
        fn now(&self) -> Instant {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let offset = self.offsets[call.min(self.offsets.len() - 1)];
            if call == 0 {
                std::thread::sleep(self.first_read_stall);
            }
            self.base + offset
        }

        async fn sleep_until(&self, _deadline: Instant) {}
    }

    #[test]
    fn test_stalled_caller_does_not_reorder_log() {
        let clock = Arc::new(ScriptedClock {
            base: Instant::now(),
            offsets: vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(1200),
            ],
            calls: AtomicUsize::new(0),
            first_read_stall: Duration::from_millis(300),
        });
        let window = Arc::new(SlidingWindow::with_clock(
            Duration::from_secs(1),
            2,
            clock,
        ));

        let slow = {
            let window = window.clone();
            std::thread::spawn(move || window.allow())
        };
        std::thread::sleep(Duration::from_millis(50));
        let fast = {
            let window = window.clone();
            std::thread::spawn(move || window.allow())
        };
        assert!(slow.join().unwrap());
        assert!(fast.join().unwrap());

        // At 1200ms only the 500ms admission is still inside the window.
        assert_eq!(window.request_count(), 1);
        assert!(window.allow());
        assert!(!window.allow());
    }

    #[test]
    fn test_concurrent_admissions_stay_ordered() {
        let (window, clock) = mock_window(Duration::from_millis(100), u64::MAX);
        let window = Arc::new(window);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let window = window.clone();
                let clock = clock.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        clock.advance(Duration::from_millis(1));
                        assert!(window.allow());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        {
            let log = window.log.lock();
            assert!(log.runs.iter().zip(log.runs.iter().skip(1)).all(|(a, b)| a.0 < b.0));
            assert_eq!(log.total, log.runs.iter().map(|&(_, count)| count).sum::<u64>());
        }

        clock.advance(Duration::from_millis(100));
        assert_eq!(window.request_count(), 0);
        assert!(window.log.lock().runs.is_empty());
    }

    #[test]
    fn test_large_batch_is_one_run() {
        let (window, clock) = mock_window(Duration::from_secs(60), u64::MAX);

        assert!(window.allow_n(20_000_000));
        assert!(window.allow_n(5));
        assert_eq!(window.request_count(), 20_000_005);
        assert_eq!(window.log.lock().runs.len(), 1);

        clock.advance(Duration::from_secs(1));
        assert!(window.allow_n(u64::MAX - 20_000_005));
        assert!(!window.allow());
        assert_eq!(window.log.lock().runs.len(), 2);

        // The merged batch expires as a unit.
        clock.advance(Duration::from_secs(59));
        assert_eq!(window.request_count(), u64::MAX - 20_000_005);
        assert!(window.allow_n(20_000_005));
    }
}
