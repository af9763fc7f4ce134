//! Admission algorithms and their shared trait.

mod adaptive;
mod backend;
mod distributed;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use adaptive::{AdaptiveLimiter, AdaptiveStats, DEFAULT_ADJUST_INTERVAL};
pub use backend::Limiter;
pub use distributed::{CoordinatorHandle, DistributedCoordinator};
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;
