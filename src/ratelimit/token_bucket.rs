//! Token bucket limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::{AdmissionError, Result};

use super::backend::Limiter;

/// Longest single wait inside a reservation loop.
const MAX_RESERVE_WAIT: Duration = Duration::from_secs(1);

/// A capacity-limited bucket that refills at a fixed rate and is spent per
/// admitted request, allowing bursts up to its capacity.
///
/// The bucket starts full. Refill is computed lazily on every access and
/// only whole elapsed seconds count: `floor(elapsed_secs) * refill_rate`
/// tokens are added, capped at capacity. The fractional remainder is carried
/// over to the next access.
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: u64,
    /// Tokens added per elapsed second
    refill_rate: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: u64,
    last_update: Instant,
}

impl TokenBucket {
    /// Create a full bucket on the system clock.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self::with_clock(capacity, refill_rate, SystemClock::shared())
    }

    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(capacity: u64, refill_rate: u64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            capacity,
            refill_rate,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: now,
            }),
        }
    }

    /// Take `n` tokens if that many are available.
    ///
    /// Returns `false` and leaves the bucket untouched otherwise. A request
    /// larger than the capacity can never succeed.
    pub fn allow_n(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= n {
            state.tokens -= n;
            trace!(requested = n, remaining = state.tokens, "Token bucket admitted");
            true
        } else {
            debug!(
                requested = n,
                available = state.tokens,
                capacity = self.capacity,
                "Token bucket rejected"
            );
            false
        }
    }

    /// Take a single token if available.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Current token count after refill.
    pub fn tokens(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Get the capacity of this bucket.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Wait for a single token. See [`TokenBucket::reserve_n`].
    pub async fn reserve(&self, ctx: &Context) -> Result<()> {
        self.reserve_n(ctx, 1).await
    }

    /// Wait until `n` tokens can be taken, or until `ctx` is done.
    ///
    /// Between attempts the caller sleeps for `n / refill_rate` seconds,
    /// capped at one second and at the context's remaining time. A cancelled
    /// or expired context returns `Canceled` or `DeadlineExceeded` without
    /// consuming anything. There is no bound on the total wait other than the
    /// one the context imposes.
    pub async fn reserve_n(&self, ctx: &Context, n: u64) -> Result<()> {
        loop {
            if let Some(err) = ctx.err(self.clock.now()) {
                return Err(err);
            }
            if self.allow_n(n) {
                return Ok(());
            }

            let mut wait = self.wait_hint(n);
            if let Some(remaining) = ctx.remaining(self.clock.now()) {
                wait = wait.min(remaining);
            }
            trace!(requested = n, wait_ms = wait.as_millis() as u64, "Waiting for tokens");

            tokio::select! {
                _ = self.clock.sleep(wait) => {}
                _ = ctx.cancelled() => {
                    return Err(AdmissionError::Canceled);
                }
            }
        }
    }

    /// Time a reservation of `n` tokens waits before retrying.
    fn wait_hint(&self, n: u64) -> Duration {
        if self.refill_rate == 0 {
            return MAX_RESERVE_WAIT;
        }
        let secs = n as f64 / self.refill_rate as f64;
        if secs >= MAX_RESERVE_WAIT.as_secs_f64() {
            MAX_RESERVE_WAIT
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_update).as_secs();
        if elapsed == 0 {
            return;
        }

        let added = elapsed.saturating_mul(self.refill_rate);
        state.tokens = state.tokens.saturating_add(added).min(self.capacity);
        state.last_update += Duration::from_secs(elapsed);
    }
}

impl Limiter for TokenBucket {
    fn allow_n(&self, n: u64) -> bool {
        TokenBucket::allow_n(self, n)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn mock_bucket(capacity: u64, rate: u64) -> (TokenBucket, MockClock) {
        let clock = MockClock::default();
        let bucket = TokenBucket::with_clock(capacity, rate, Arc::new(clock.clone()));
        (bucket, clock)
    }

    #[test]
    fn test_starts_full() {
        let (bucket, _clock) = mock_bucket(10, 2);
        assert_eq!(bucket.tokens(), 10);
    }

    #[test]
    fn test_burst_then_reject_in_order() {
        let (bucket, _clock) = mock_bucket(10, 2);

        let results: Vec<bool> = (0..15).map(|_| bucket.allow()).collect();
        assert_eq!(&results[..10], &[true; 10]);
        assert_eq!(&results[10..], &[false; 5]);
    }

    #[test]
    fn test_zero_capacity_always_rejects() {
        let (bucket, clock) = mock_bucket(0, 5);
        assert!(!bucket.allow());
        clock.advance(Duration::from_secs(10));
        assert!(!bucket.allow());
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_failed_allow_n_consumes_nothing() {
        let (bucket, _clock) = mock_bucket(10, 1);
        assert!(bucket.allow_n(7));
        assert_eq!(bucket.tokens(), 3);

        assert!(!bucket.allow_n(4));
        assert_eq!(bucket.tokens(), 3);
    }

    #[test]
    fn test_request_above_capacity_never_succeeds() {
        let (bucket, clock) = mock_bucket(5, 100);
        assert!(!bucket.allow_n(6));
        clock.advance(Duration::from_secs(60));
        assert!(!bucket.allow_n(6));
        assert_eq!(bucket.tokens(), 5);
    }

    #[test]
    fn test_refill_whole_seconds_only() {
        let (bucket, clock) = mock_bucket(10, 5);
        assert!(bucket.allow_n(10));

        clock.advance(Duration::from_millis(900));
        assert_eq!(bucket.tokens(), 0);

        // 900ms + 200ms crosses the first whole second.
        clock.advance(Duration::from_millis(200));
        assert_eq!(bucket.tokens(), 5);

        // Carried 100ms remainder plus 900ms completes the next second.
        clock.advance(Duration::from_millis(900));
        assert_eq!(bucket.tokens(), 10);
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let (bucket, clock) = mock_bucket(10, 5);
        assert!(bucket.allow_n(3));
        clock.advance(Duration::from_secs(100));
        assert_eq!(bucket.tokens(), 10);
    }

    #[test]
    fn test_zero_rate_never_refills() {
        let (bucket, clock) = mock_bucket(3, 0);
        assert!(bucket.allow_n(3));
        clock.advance(Duration::from_secs(100));
        assert!(!bucket.allow());
    }

    #[test]
    fn test_wait_hint_capped() {
        let (bucket, _clock) = mock_bucket(10, 4);
        assert_eq!(bucket.wait_hint(1), Duration::from_millis(250));
        assert_eq!(bucket.wait_hint(8), MAX_RESERVE_WAIT);

        let (stalled, _clock) = mock_bucket(10, 0);
        assert_eq!(stalled.wait_hint(1), MAX_RESERVE_WAIT);
    }

    #[tokio::test]
    async fn test_reserve_waits_for_refill() {
        let (bucket, clock) = mock_bucket(2, 1);
        let start = clock.now();
        assert!(bucket.allow_n(2));

        tokio_test::assert_ok!(bucket.reserve(&Context::background()).await);
        assert!(clock.now().duration_since(start) >= Duration::from_secs(1));
        assert_eq!(bucket.tokens(), 0);
    }

    #[tokio::test]
    async fn test_reserve_deadline_exceeded() {
        let (bucket, clock) = mock_bucket(10, 0);
        assert!(bucket.allow_n(10));

        let ctx = Context::with_timeout(&clock, Duration::from_secs(3));
        let err = tokio_test::assert_err!(bucket.reserve_n(&ctx, 5).await);
        assert!(matches!(err, AdmissionError::DeadlineExceeded));
        assert_eq!(bucket.tokens(), 0);
    }

    #[tokio::test]
    async fn test_reserve_already_cancelled() {
        let (bucket, _clock) = mock_bucket(10, 1);
        let ctx = Context::background();
        ctx.cancel();

        let err = tokio_test::assert_err!(bucket.reserve(&ctx).await);
        assert!(matches!(err, AdmissionError::Canceled));
        assert_eq!(bucket.tokens(), 10);
    }

    #[tokio::test]
    async fn test_reserve_cancelled_while_waiting() {
        let bucket = Arc::new(TokenBucket::new(1, 0));
        assert!(bucket.allow());

        let ctx = Context::background();
        let waiter = {
            let bucket = bucket.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { bucket.reserve(&ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("reservation should return promptly after cancel")
            .unwrap();
        assert!(matches!(result, Err(AdmissionError::Canceled)));
    }

    #[test]
    fn test_concurrent_allow_respects_capacity() {
        let (bucket, _clock) = mock_bucket(50, 10);
        let bucket = Arc::new(bucket);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || (0..20).filter(|_| bucket.allow()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
