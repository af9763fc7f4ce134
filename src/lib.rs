//! Admitter - Admission Control Engine
//!
//! This crate implements a family of rate limiters that decide whether a
//! caller-supplied amount of work may proceed: a token bucket, a leaky
//! bucket, a sliding window log, an adaptive limiter that tunes its rate from
//! observed error rates, and a distributed coordinator that splits a global
//! rate across nodes via periodically exchanged status messages.
//!
//! All limiters read time through an injectable [`clock::Clock`] and
//! recompute their state lazily; none of them runs a timer of its own.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod mesh;
pub mod ratelimit;

pub use clock::{Clock, MockClock, SystemClock};
pub use context::Context;
pub use error::{AdmissionError, Result};
pub use ratelimit::{
    AdaptiveLimiter, DistributedCoordinator, LeakyBucket, Limiter, SlidingWindow, TokenBucket,
};
