//! Limiter trait shared by every admission algorithm.

/// Non-blocking admission decision.
///
/// This trait abstracts over the token bucket, leaky bucket, sliding window,
/// adaptive and distributed limiters so that embedding applications can hold
/// any of them behind an `Arc<dyn Limiter>`.
pub trait Limiter: Send + Sync {
    /// Admit `n` units of work, or reject without side effects.
    fn allow_n(&self, n: u64) -> bool;

    /// Admit a single unit of work.
    fn allow(&self) -> bool {
        self.allow_n(1)
    }
}
