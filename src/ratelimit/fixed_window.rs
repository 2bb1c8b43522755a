//! Fixed window counter.
//!
//! Time is cut into aligned windows of `interval`; each key may be admitted
//! `limit` times per window. The counter resets abruptly at window edges.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tracing::{debug, trace};

use super::key::{Algorithm, StateKey};
use super::{require_name, require_positive, require_positive_interval, Decision, RateLimiter};
use crate::clock::Millis;
use crate::error::Result;
use crate::store::{scripts, StateStore, Transition};

/// Stored state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowState {
    /// Admissions attempted in the current window
    pub count: u64,
    /// Start of the window `count` belongs to
    pub window_start: Millis,
}

/// Limit and window length, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowPolicy {
    pub limit: u64,
    pub interval: Millis,
}

impl FixedWindowPolicy {
    /// Start of the window containing `now`.
    pub fn window_start(&self, now: Millis) -> Millis {
        (now / self.interval) * self.interval
    }

    fn count_in_window(&self, state: Option<&FixedWindowState>, window_start: Millis) -> u64 {
        match state {
            Some(state) if state.window_start == window_start => state.count,
            _ => 0,
        }
    }

    /// Count one attempt. Every attempt is counted, admitted or not.
    pub fn consume(
        &self,
        state: Option<&FixedWindowState>,
        now: Millis,
    ) -> (FixedWindowState, Decision) {
        let window_start = self.window_start(now);
        let count = self.count_in_window(state, window_start).saturating_add(1);

        let decision = Decision {
            success: count <= self.limit,
            remaining: self.limit.saturating_sub(count),
        };
        (FixedWindowState { count, window_start }, decision)
    }

    /// Remaining admissions in the window containing `now`.
    pub fn remaining(&self, state: Option<&FixedWindowState>, now: Millis) -> u64 {
        let count = self.count_in_window(state, self.window_start(now));
        self.limit.saturating_sub(count)
    }

    /// Time left in the window containing `now`.
    pub fn ttl(&self, now: Millis) -> Millis {
        self.window_start(now) + self.interval - now
    }
}

/// A fixed window rate limiter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    name: String,
    policy: FixedWindowPolicy,
    store: StateStore,
    script: Script,
}

impl FixedWindowLimiter {
    /// Create a limiter admitting `limit` requests per `interval`.
    pub fn new(
        name: impl Into<String>,
        limit: u64,
        interval: Duration,
        store: StateStore,
    ) -> Result<Self> {
        let policy = FixedWindowPolicy {
            limit: require_positive("limit", limit)?,
            interval: require_positive_interval("interval", interval)?,
        };

        Ok(Self {
            name: require_name(name.into())?,
            policy,
            store,
            script: Script::new(scripts::FIXED_WINDOW_CONSUME),
        })
    }

    fn state_key(&self, key: &str) -> String {
        StateKey::new(Algorithm::FixedWindow, &self.name, key).to_string_key()
    }

    /// Count one request for `key`.
    pub async fn consume(&self, key: &str) -> Result<Decision> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        let decision = match &self.store {
            StateStore::Local(local) => {
                let policy = self.policy;
                local.transact(&state_key, policy.ttl(now), now, |state| {
                    let (next, decision) = policy.consume(state, now);
                    Transition::Write(next, decision)
                })
            }
            StateStore::Redis(remote) => {
                let mut invocation = self.script.prepare_invoke();
                invocation
                    .key(&state_key)
                    .arg(self.policy.limit)
                    .arg(self.policy.interval)
                    .arg(now);
                Decision::from_reply(remote.invoke(&invocation).await?)
            }
        };

        trace!(
            key = %state_key,
            success = decision.success,
            remaining = decision.remaining,
            "Fixed window decision"
        );
        if !decision.success {
            debug!(key = %state_key, limit = self.policy.limit, "Fixed window limit exceeded");
        }
        Ok(decision)
    }

    /// Remaining admissions for `key` in the current window.
    pub async fn get_remaining(&self, key: &str) -> Result<u64> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        match &self.store {
            StateStore::Local(local) => {
                Ok(local.read(&state_key, now, |state| self.policy.remaining(state, now)))
            }
            StateStore::Redis(remote) => {
                let mut cmd = redis::cmd("HMGET");
                cmd.arg(&state_key).arg("count").arg("window_start");
                let (count, window_start): (Option<u64>, Option<u64>) = remote.query(&cmd).await?;
                let state = count
                    .zip(window_start)
                    .map(|(count, window_start)| FixedWindowState {
                        count,
                        window_start,
                    });
                Ok(self.policy.remaining(state.as_ref(), now))
            }
        }
    }

    /// Forget all state for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(&self.state_key(key)).await
    }

    /// Name of this limiter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admissions allowed per window.
    pub fn limit(&self) -> u64 {
        self.policy.limit
    }

    /// Window length.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.policy.interval)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, key: &str) -> Result<Decision> {
        self.consume(key).await
    }

    async fn remaining(&self, key: &str) -> Result<u64> {
        self.get_remaining(key).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        FixedWindowLimiter::reset(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RateLimitError;
    use crate::store::LocalStore;
    use std::sync::Arc;

    fn limiter(limit: u64, interval: Duration) -> (FixedWindowLimiter, ManualClock) {
        let clock = ManualClock::new(0);
        let store = StateStore::from(LocalStore::with_clock(Arc::new(clock.clone())));
        let limiter = FixedWindowLimiter::new("test", limit, interval, store).unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_policy_counts_rejected_attempts() {
        let policy = FixedWindowPolicy {
            limit: 2,
            interval: 1_000,
        };
        let state = FixedWindowState {
            count: 2,
            window_start: 0,
        };

        let (next, decision) = policy.consume(Some(&state), 500);
        assert_eq!(next.count, 3);
        assert_eq!(decision, Decision::rejected());
    }

    #[test]
    fn test_policy_new_window_overwrites_old() {
        let policy = FixedWindowPolicy {
            limit: 2,
            interval: 1_000,
        };
        let stale = FixedWindowState {
            count: 7,
            window_start: 0,
        };

        let (next, decision) = policy.consume(Some(&stale), 1_200);
        assert_eq!(
            next,
            FixedWindowState {
                count: 1,
                window_start: 1_000
            }
        );
        assert_eq!(decision, Decision::allowed(1));
        assert_eq!(policy.remaining(Some(&stale), 1_200), 2);
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let store = StateStore::local();
        assert!(matches!(
            FixedWindowLimiter::new("x", 0, Duration::from_secs(1), store.clone()),
            Err(RateLimitError::Configuration(_))
        ));
        assert!(matches!(
            FixedWindowLimiter::new("x", 1, Duration::ZERO, store.clone()),
            Err(RateLimitError::Configuration(_))
        ));
        assert!(matches!(
            FixedWindowLimiter::new("", 1, Duration::from_secs(1), store),
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_window_scenario() {
        let (limiter, clock) = limiter(10, Duration::from_secs(60));

        for expected in (0..10).rev() {
            let decision = limiter.consume("user").await.unwrap();
            assert!(decision.success);
            assert_eq!(decision.remaining, expected);
        }

        let decision = limiter.consume("user").await.unwrap();
        assert!(!decision.success);
        assert_eq!(decision.remaining, 0);

        clock.set(60_000);
        let decision = limiter.consume("user").await.unwrap();
        assert!(decision.success);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_get_remaining_does_not_consume() {
        let (limiter, _clock) = limiter(3, Duration::from_secs(1));

        assert_eq!(limiter.get_remaining("k").await.unwrap(), 3);
        limiter.consume("k").await.unwrap();
        assert_eq!(limiter.get_remaining("k").await.unwrap(), 2);
        assert_eq!(limiter.get_remaining("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(1));

        assert!(limiter.consume("a").await.unwrap().success);
        assert!(!limiter.consume("a").await.unwrap().success);
        assert!(limiter.consume("b").await.unwrap().success);
    }

    #[tokio::test]
    async fn test_reset_clears_key() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(1));

        limiter.consume("a").await.unwrap();
        assert_eq!(limiter.get_remaining("a").await.unwrap(), 0);
        limiter.reset("a").await.unwrap();
        assert_eq!(limiter.get_remaining("a").await.unwrap(), 1);
    }

    #[test]
    fn test_accessors() {
        let (limiter, _clock) = limiter(10, Duration::from_secs(60));
        assert_eq!(limiter.limit(), 10);
        assert_eq!(limiter.interval(), Duration::from_secs(60));
        assert_eq!(limiter.name(), "test");
    }
}
