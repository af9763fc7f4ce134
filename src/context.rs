//! Cancellation context for blocking reservations.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::AdmissionError;

/// A cancellation signal with an optional deadline.
///
/// Cloning a context shares its cancellation token, so cancelling any clone
/// cancels all of them.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context that expires `timeout` after the clock's current instant.
    pub fn with_timeout(clock: &dyn Clock, timeout: Duration) -> Self {
        Self::with_deadline(clock.now() + timeout)
    }

    /// A child context: cancelled when this one is, with the earlier of the
    /// two deadlines.
    pub fn child(&self, deadline: Option<Instant>) -> Self {
        let deadline = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Cancel this context and every clone and child of it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline at `now`, or `None` without a deadline.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// The error this context reports at `now`, if it is done.
    ///
    /// Explicit cancellation takes precedence over an expired deadline.
    pub fn err(&self, now: Instant) -> Option<AdmissionError> {
        if self.token.is_cancelled() {
            return Some(AdmissionError::Canceled);
        }
        match self.deadline {
            Some(deadline) if now >= deadline => Some(AdmissionError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once `cancel` is called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl From<CancellationToken> for Context {
    fn from(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }
}
