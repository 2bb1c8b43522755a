//! Approximate sliding window.
//!
//! Keeps counts for the current and the immediately preceding aligned
//! window and weights the previous count by how much of it still overlaps
//! the trailing `interval`. Smooths out the edge bursts a fixed window
//! allows, at the cost of being an estimate.

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
pub struct SlidingWindowState {
    /// Admissions in the current window
    pub current: u64,
    /// Admissions in the window before it
    pub previous: u64,
    /// Start of the current window; only ever moves forward
    pub window_start: Millis,
}

/// Limit and window length, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowPolicy {
    pub limit: u64,
    pub interval: Millis,
}

impl SlidingWindowPolicy {
    /// State as seen at `now`, rolled into the window containing it.
    ///
    /// When more than one window has passed the previous count is zero.
    pub fn roll(&self, state: Option<&SlidingWindowState>, now: Millis) -> SlidingWindowState {
        let bucket = (now / self.interval) * self.interval;

        match state {
            None => SlidingWindowState {
                current: 0,
                previous: 0,
                window_start: bucket,
            },
            Some(state) if bucket > state.window_start => {
                let previous = if bucket - state.window_start == self.interval {
                    state.current
                } else {
                    0
                };
                SlidingWindowState {
                    current: 0,
                    previous,
                    window_start: bucket,
                }
            }
            Some(state) => *state,
        }
    }

    /// `current + floor(previous * overlap)` where overlap is the share of
    /// the previous window still inside the trailing interval.
    pub fn weighted_count(&self, state: &SlidingWindowState, now: Millis) -> u64 {
        let left = (state.window_start + self.interval)
            .saturating_sub(now)
            .min(self.interval);
        let carried = u128::from(state.previous) * u128::from(left) / u128::from(self.interval);
        state.current.saturating_add(carried as u64)
    }

    /// Attempt one admission. The rolled state is returned even on rejection.
    pub fn consume(
        &self,
        state: Option<&SlidingWindowState>,
        now: Millis,
    ) -> (SlidingWindowState, Decision) {
        let mut next = self.roll(state, now);
        let weighted = self.weighted_count(&next, now);

        if weighted < self.limit {
            next.current += 1;
            let remaining = self.limit.saturating_sub(weighted + 1);
            (next, Decision::allowed(remaining))
        } else {
            (next, Decision::rejected())
        }
    }

    /// Remaining admissions at `now`. Pure; nothing is persisted.
    pub fn remaining(&self, state: Option<&SlidingWindowState>, now: Millis) -> u64 {
        let rolled = self.roll(state, now);
        self.limit.saturating_sub(self.weighted_count(&rolled, now))
    }

    /// How long state stays relevant after a write.
    pub fn ttl(&self) -> Millis {
        self.interval.saturating_mul(2)
    }
}

/// A sliding window rate limiter.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    name: String,
    policy: SlidingWindowPolicy,
    store: StateStore,
    script: Script,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting about `limit` requests per trailing `interval`.
    pub fn new(
        name: impl Into<String>,
        limit: u64,
        interval: Duration,
        store: StateStore,
    ) -> Result<Self> {
        let policy = SlidingWindowPolicy {
            limit: require_positive("limit", limit)?,
            interval: require_positive_interval("interval", interval)?,
        };

        Ok(Self {
            name: require_name(name.into())?,
            policy,
            store,
            script: Script::new(scripts::SLIDING_WINDOW_CONSUME),
        })
    }

    fn state_key(&self, key: &str) -> String {
        StateKey::new(Algorithm::SlidingWindow, &self.name, key).to_string_key()
    }

    /// Attempt one admission for `key`.
    pub async fn consume(&self, key: &str) -> Result<Decision> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        let decision = match &self.store {
            StateStore::Local(local) => {
                let policy = self.policy;
                local.transact(&state_key, policy.ttl(), now, |state| {
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
            "Sliding window decision"
        );
        if !decision.success {
            debug!(key = %state_key, limit = self.policy.limit, "Sliding window limit exceeded");
        }
        Ok(decision)
    }

    /// Remaining admissions for `key`.
    ///
    /// Computes the same rollover `consume` would but never writes it back.
    pub async fn get_remaining(&self, key: &str) -> Result<u64> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        match &self.store {
            StateStore::Local(local) => {
                Ok(local.read(&state_key, now, |state| self.policy.remaining(state, now)))
            }
            StateStore::Redis(remote) => {
                let mut cmd = redis::cmd("HMGET");
                cmd.arg(&state_key)
                    .arg("current")
                    .arg("previous")
                    .arg("window_start");
                let (current, previous, window_start): (Option<u64>, Option<u64>, Option<u64>) =
                    remote.query(&cmd).await?;
                let state = window_start.map(|window_start| SlidingWindowState {
                    current: current.unwrap_or(0),
                    previous: previous.unwrap_or(0),
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

    /// Admissions allowed per trailing interval.
    pub fn limit(&self) -> u64 {
        self.policy.limit
    }

    /// Window length.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.policy.interval)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
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
        SlidingWindowLimiter::reset(self, key).await
    }
}
