//! Rate limiting algorithms.
//!
//! Each algorithm module holds a state struct, a policy whose methods are
//! the pure transition functions, and a limiter that runs those transitions
//! against a [`StateStore`](crate::store::StateStore).

mod fixed_window;
mod key;
mod leaky_bucket;
mod noop;
mod sliding_log;
mod sliding_window;
mod throttling;
mod token_bucket;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::{duration_millis, Millis};
use crate::error::{RateLimitError, Result};

pub use fixed_window::{FixedWindowLimiter, FixedWindowPolicy, FixedWindowState};
pub use key::{Algorithm, StateKey};
pub use leaky_bucket::{LeakyBucketLimiter, LeakyBucketPolicy, LeakyBucketState, QueueStatus};
pub use noop::Unlimited;
pub use sliding_log::{LogEntry, SlidingLogLimiter, SlidingLogPolicy, SlidingLogState};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowPolicy, SlidingWindowState};
pub use throttling::{ThrottleDecision, ThrottleState, ThrottlingLimiter, ThrottlingPolicy};
pub use token_bucket::{TokenBucketLimiter, TokenBucketPolicy, TokenBucketState, TokenDecision};

/// The admission decision for one request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub success: bool,
    /// Requests still admissible after this one, never negative
    pub remaining: u64,
}

impl Decision {
    pub(crate) fn allowed(remaining: u64) -> Self {
        Self {
            success: true,
            remaining,
        }
    }

    pub(crate) fn rejected() -> Self {
        Self {
            success: false,
            remaining: 0,
        }
    }

    /// Decode a `{success, remaining}` script reply.
    pub(crate) fn from_reply((success, remaining): (i64, i64)) -> Self {
        Self {
            success: success == 1,
            remaining: non_negative(remaining),
        }
    }
}

/// Common admission contract shared by every limiter.
///
/// Lets callers hold limiters of different algorithms (or the no-op
/// [`Unlimited`]) behind one type.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Name of this limiter instance.
    fn name(&self) -> &str;

    /// Attempt one admission for `key`, mutating its state.
    async fn check(&self, key: &str) -> Result<Decision>;

    /// Remaining admissions for `key` without consuming any.
    async fn remaining(&self, key: &str) -> Result<u64>;

    /// Forget all state for `key`.
    async fn reset(&self, key: &str) -> Result<()>;
}

pub(crate) fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

/// Id for one logged admission. Always carries a random suffix, so a
/// repeated `request_id` still occupies its own slot.
pub(crate) fn admission_id(request_id: Option<&str>) -> String {
    let unique = Uuid::new_v4();
    match request_id {
        Some(id) => format!("{}:{}", id, unique),
        None => unique.to_string(),
    }
}

pub(crate) fn require_positive(what: &str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(RateLimitError::Configuration(format!(
            "{} must be greater than zero",
            what
        )));
    }
    Ok(value)
}

pub(crate) fn require_positive_interval(what: &str, interval: Duration) -> Result<Millis> {
    let millis = duration_millis(interval);
    if millis == 0 {
        return Err(RateLimitError::Configuration(format!(
            "{} must be at least one millisecond, got {:?}",
            what, interval
        )));
    }
    Ok(millis)
}

pub(crate) fn require_name(name: String) -> Result<String> {
    if name.is_empty() {
        return Err(RateLimitError::Configuration(
            "limiter name must not be empty".to_string(),
        ));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_positive() {
        assert_eq!(require_positive("limit", 3).unwrap(), 3);
        assert!(matches!(
            require_positive("limit", 0),
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[test]
    fn test_require_positive_interval_rejects_sub_millisecond() {
        assert_eq!(
            require_positive_interval("interval", Duration::from_secs(2)).unwrap(),
            2_000
        );
        assert!(require_positive_interval("interval", Duration::ZERO).is_err());
        assert!(require_positive_interval("interval", Duration::from_micros(500)).is_err());
    }

    #[test]
    fn test_admission_ids_are_unique_per_call() {
        let first = admission_id(Some("retry"));
        let second = admission_id(Some("retry"));
        assert_ne!(first, second);
        assert!(first.starts_with("retry:"));
        assert_ne!(admission_id(None), admission_id(None));
    }

    #[test]
    fn test_decision_from_reply_clamps_negative() {
        assert_eq!(Decision::from_reply((1, 4)), Decision::allowed(4));
        assert_eq!(Decision::from_reply((0, -3)), Decision::rejected());
    }
}
