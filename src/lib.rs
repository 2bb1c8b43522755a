//! Gatekeep - Rate Limiting Algorithms
//!
//! This crate provides six interchangeable rate limiting algorithms (fixed
//! window, sliding window, sliding log, token bucket, leaky bucket and
//! throttling) that decide, per caller-supplied key, whether a request may
//! proceed. State lives either in process memory or in a shared Redis
//! server; every decision is one atomic transaction on one key.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use error::{RateLimitError, Result};
pub use ratelimit::{Decision, RateLimiter};
pub use store::{LocalStore, RedisStore, StateStore};
