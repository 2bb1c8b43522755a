//! Token bucket.
//!
//! A bucket holds up to `capacity` tokens and gains `refill_amount` tokens
//! at every whole `refill_interval` since the last refill. Requests spend
//! tokens; a request that finds too few is rejected without spending any.
//!
//! Refill advances `last_refill` by whole intervals only, so partial
//! progress towards the next refill survives every call. Spending tokens
//! never moves the refill anchor.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use serde::Serialize;
use tracing::{debug, trace};

use super::key::{Algorithm, StateKey};
use super::{
    non_negative, require_name, require_positive, require_positive_interval, Decision,
    RateLimiter,
};
use crate::clock::Millis;
use crate::error::{RateLimitError, Result};
use crate::store::{scripts, StateStore, Transition};

/// Stored state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketState {
    /// Tokens currently available, within `[0, capacity]`
    pub tokens: u64,
    /// Time of the last applied refill
    pub last_refill: Millis,
}

/// Result of a token consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenDecision {
    pub success: bool,
    /// Tokens left after this call
    pub remaining_tokens: u64,
    /// When the next refill is due, epoch milliseconds
    pub next_refill_at: Millis,
}

/// Bucket size and refill schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketPolicy {
    pub capacity: u64,
    pub refill_amount: u64,
    pub refill_interval: Millis,
}

impl TokenBucketPolicy {
    /// State at `now` after applying every refill that has come due.
    ///
    /// An unseen key starts with a full bucket anchored at `now`.
    pub fn refill(&self, state: Option<&TokenBucketState>, now: Millis) -> TokenBucketState {
        let mut state = state.copied().unwrap_or(TokenBucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        if now > state.last_refill {
            let cycles = (now - state.last_refill) / self.refill_interval;
            if cycles > 0 {
                let added = cycles.saturating_mul(self.refill_amount);
                state.tokens = state.tokens.saturating_add(added).min(self.capacity);
                state.last_refill += cycles * self.refill_interval;
            }
        }
        state
    }

    /// When the refill after `state.last_refill` is due.
    pub fn next_refill_at(&self, state: &TokenBucketState) -> Millis {
        state.last_refill + self.refill_interval
    }

    /// Refill, then spend `requested` tokens if that many are available.
    pub fn consume(
        &self,
        state: Option<&TokenBucketState>,
        requested: u64,
        now: Millis,
    ) -> (TokenBucketState, TokenDecision) {
        let mut next = self.refill(state, now);
        let success = next.tokens >= requested;
        if success {
            next.tokens -= requested;
        }

        let decision = TokenDecision {
            success,
            remaining_tokens: next.tokens,
            next_refill_at: self.next_refill_at(&next),
        };
        (next, decision)
    }

    /// Refill, then add a signed `delta` clamped into `[0, capacity]`.
    pub fn adjust(
        &self,
        state: Option<&TokenBucketState>,
        delta: i64,
        now: Millis,
    ) -> TokenBucketState {
        let mut next = self.refill(state, now);
        let tokens = i128::from(next.tokens) + i128::from(delta);
        next.tokens = tokens.clamp(0, i128::from(self.capacity)) as u64;
        next
    }

    /// Time for an empty bucket to fill completely. Past this an unseen
    /// key and a stored one are indistinguishable.
    pub fn ttl(&self) -> Millis {
        let cycles = self.capacity.div_ceil(self.refill_amount).max(1);
        cycles.saturating_mul(self.refill_interval)
    }
}

/// A token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    name: String,
    policy: TokenBucketPolicy,
    store: StateStore,
    consume_script: Script,
    adjust_script: Script,
}

impl TokenBucketLimiter {
    /// Create a bucket of `capacity` tokens gaining `refill_amount` every
    /// `refill_interval`.
    pub fn new(
        name: impl Into<String>,
        capacity: u64,
        refill_amount: u64,
        refill_interval: Duration,
        store: StateStore,
    ) -> Result<Self> {
        let policy = TokenBucketPolicy {
            capacity: require_positive("capacity", capacity)?,
            refill_amount: require_positive("refill amount", refill_amount)?,
            refill_interval: require_positive_interval("refill interval", refill_interval)?,
        };

        Ok(Self {
            name: require_name(name.into())?,
            policy,
            store,
            consume_script: Script::new(scripts::TOKEN_BUCKET_CONSUME),
            adjust_script: Script::new(scripts::TOKEN_BUCKET_ADJUST),
        })
    }

    fn state_key(&self, key: &str) -> String {
        StateKey::new(Algorithm::TokenBucket, &self.name, key).to_string_key()
    }

    /// Spend `tokens` from `key`'s bucket.
    ///
    /// Negative amounts are rejected with [`RateLimitError::InvalidArgument`]
    /// before any state is touched. Requests larger than the capacity can
    /// never succeed.
    pub async fn consume(&self, key: &str, tokens: i64) -> Result<TokenDecision> {
        let requested = u64::try_from(tokens).map_err(|_| {
            RateLimitError::InvalidArgument(format!(
                "token count must not be negative, got {}",
                tokens
            ))
        })?;

        let state_key = self.state_key(key);
        let now = self.store.now();

        let decision = match &self.store {
            StateStore::Local(local) => {
                let policy = self.policy;
                local.transact(&state_key, policy.ttl(), now, |state| {
                    let (next, decision) = policy.consume(state, requested, now);
                    Transition::Write(next, decision)
                })
            }
            StateStore::Redis(remote) => {
                let mut invocation = self.consume_script.prepare_invoke();
                invocation
                    .key(&state_key)
                    .arg(self.policy.capacity)
                    .arg(self.policy.refill_amount)
                    .arg(self.policy.refill_interval)
                    .arg(now)
                    .arg(requested)
                    .arg(self.policy.ttl());
                let (success, tokens, next_refill_at): (i64, i64, i64) =
                    remote.invoke(&invocation).await?;
                TokenDecision {
                    success: success == 1,
                    remaining_tokens: non_negative(tokens),
                    next_refill_at: non_negative(next_refill_at),
                }
            }
        };

        trace!(
            key = %state_key,
            requested = requested,
            success = decision.success,
            remaining_tokens = decision.remaining_tokens,
            "Token bucket decision"
        );
        if !decision.success {
            debug!(
                key = %state_key,
                requested = requested,
                available = decision.remaining_tokens,
                "Token bucket has too few tokens"
            );
        }
        Ok(decision)
    }

    /// Tokens available to `key` right now, refill included.
    pub async fn get_remaining_tokens(&self, key: &str) -> Result<u64> {
        Ok(self.snapshot(key).await?.tokens)
    }

    /// Refilled state for `key` without persisting anything.
    async fn snapshot(&self, key: &str) -> Result<TokenBucketState> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        match &self.store {
            StateStore::Local(local) => {
                Ok(local.read(&state_key, now, |state| self.policy.refill(state, now)))
            }
            StateStore::Redis(remote) => {
                let mut cmd = redis::cmd("HMGET");
                cmd.arg(&state_key).arg("tokens").arg("last_refill");
                let (tokens, last_refill): (Option<u64>, Option<u64>) =
                    remote.query(&cmd).await?;
                let state = tokens
                    .zip(last_refill)
                    .map(|(tokens, last_refill)| TokenBucketState {
                        tokens,
                        last_refill,
                    });
                Ok(self.policy.refill(state.as_ref(), now))
            }
        }
    }

    /// Put up to `amount` tokens back into `key`'s bucket, never beyond
    /// capacity. Non-positive amounts change nothing. Returns the tokens
    /// now available.
    pub async fn add_tokens(&self, key: &str, amount: i64) -> Result<u64> {
        if amount <= 0 {
            return self.get_remaining_tokens(key).await;
        }
        self.adjust(key, amount).await
    }

    /// Take up to `amount` tokens out of `key`'s bucket, never below zero.
    /// Non-positive amounts change nothing. Returns the tokens now available.
    pub async fn remove_tokens(&self, key: &str, amount: i64) -> Result<u64> {
        if amount <= 0 {
            return self.get_remaining_tokens(key).await;
        }
        self.adjust(key, -amount).await
    }

    async fn adjust(&self, key: &str, delta: i64) -> Result<u64> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        let tokens = match &self.store {
            StateStore::Local(local) => {
                let policy = self.policy;
                local.transact(&state_key, policy.ttl(), now, |state| {
                    let next = policy.adjust(state, delta, now);
                    Transition::Write(next, next.tokens)
                })
            }
            StateStore::Redis(remote) => {
                let mut invocation = self.adjust_script.prepare_invoke();
                invocation
                    .key(&state_key)
                    .arg(self.policy.capacity)
                    .arg(self.policy.refill_amount)
                    .arg(self.policy.refill_interval)
                    .arg(now)
                    .arg(delta)
                    .arg(self.policy.ttl());
                let (_, tokens, _): (i64, i64, i64) = remote.invoke(&invocation).await?;
                non_negative(tokens)
            }
        };

        debug!(key = %state_key, delta = delta, tokens = tokens, "Adjusted token bucket");
        Ok(tokens)
    }

    /// Forget all state for `key`; its next access sees a full bucket.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(&self.state_key(key)).await
    }

    /// Name of this limiter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum tokens a bucket holds.
    pub fn capacity(&self) -> u64 {
        self.policy.capacity
    }

    /// Tokens added per refill.
    pub fn refill_amount(&self) -> u64 {
        self.policy.refill_amount
    }

    /// Time between refills.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.policy.refill_interval)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, key: &str) -> Result<Decision> {
        let decision = self.consume(key, 1).await?;
        Ok(Decision {
            success: decision.success,
            remaining: decision.remaining_tokens,
        })
    }

    async fn remaining(&self, key: &str) -> Result<u64> {
        self.get_remaining_tokens(key).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        TokenBucketLimiter::reset(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LocalStore;
    use std::sync::Arc;

    fn setup(
        capacity: u64,
        refill_amount: u64,
        refill_interval: Duration,
    ) -> (TokenBucketLimiter, ManualClock) {
        let clock = ManualClock::new(0);
        let store = StateStore::from(LocalStore::with_clock(Arc::new(clock.clone())));
        let limiter =
            TokenBucketLimiter::new("test", capacity, refill_amount, refill_interval, store)
                .unwrap();
        (limiter, clock)
    }

    fn policy() -> TokenBucketPolicy {
        TokenBucketPolicy {
            capacity: 10,
            refill_amount: 2,
            refill_interval: 1_000,
        }
    }

    #[test]
    fn test_refill_keeps_fractional_progress() {
        let empty = TokenBucketState {
            tokens: 0,
            last_refill: 0,
        };
        let state = policy().refill(Some(&empty), 1_100);
        assert_eq!(
            state,
            TokenBucketState {
                tokens: 2,
                last_refill: 1_000
            }
        );
        assert_eq!(policy().next_refill_at(&state), 2_000);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let state = TokenBucketState {
            tokens: 9,
            last_refill: 0,
        };
        let refilled = policy().refill(Some(&state), 60_500);
        assert_eq!(refilled.tokens, 10);
        assert_eq!(refilled.last_refill, 60_000);
    }

    #[test]
    fn test_unseen_bucket_is_full() {
        let state = policy().refill(None, 5_000);
        assert_eq!(state.tokens, 10);
        assert_eq!(state.last_refill, 5_000);
    }

    #[test]
    fn test_consume_does_not_move_anchor() {
        let state = TokenBucketState {
            tokens: 5,
            last_refill: 1_000,
        };
        let (next, decision) = policy().consume(Some(&state), 3, 1_700);
        assert!(decision.success);
        assert_eq!(next.last_refill, 1_000);
        assert_eq!(decision.next_refill_at, 2_000);
    }

    #[test]
    fn test_adjust_clamps() {
        let state = TokenBucketState {
            tokens: 5,
            last_refill: 0,
        };
        assert_eq!(policy().adjust(Some(&state), 100, 0).tokens, 10);
        assert_eq!(policy().adjust(Some(&state), -100, 0).tokens, 0);
        assert_eq!(policy().adjust(Some(&state), i64::MIN, 0).tokens, 0);
    }

    #[test]
    fn test_ttl_covers_full_refill() {
        assert_eq!(policy().ttl(), 5_000);
        let uneven = TokenBucketPolicy {
            capacity: 5,
            refill_amount: 2,
            refill_interval: 100,
        };
        assert_eq!(uneven.ttl(), 300);
    }

    #[tokio::test]
    async fn test_refill_scenario() {
        let (limiter, clock) = setup(10, 2, Duration::from_secs(1));

        let decision = limiter.consume("user", 10).await.unwrap();
        assert!(decision.success);
        assert_eq!(decision.remaining_tokens, 0);
        assert_eq!(decision.next_refill_at, 1_000);

        clock.set(1_100);
        assert_eq!(limiter.get_remaining_tokens("user").await.unwrap(), 2);

        // The 100ms remainder was carried, so the next cycle lands at 2s.
        clock.set(2_000);
        assert_eq!(limiter.get_remaining_tokens("user").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_insufficient_tokens_spends_nothing() {
        let (limiter, _clock) = setup(5, 1, Duration::from_secs(1));

        assert!(limiter.consume("k", 4).await.unwrap().success);
        let decision = limiter.consume("k", 2).await.unwrap();
        assert!(!decision.success);
        assert_eq!(decision.remaining_tokens, 1);
        assert!(limiter.consume("k", 1).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_negative_consume_is_invalid() {
        let (limiter, _clock) = setup(5, 1, Duration::from_secs(1));

        let err = limiter.consume("k", -1).await.unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidArgument(_)));
        assert_eq!(limiter.get_remaining_tokens("k").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_add_and_remove_tokens() {
        let (limiter, _clock) = setup(10, 1, Duration::from_secs(1));

        assert_eq!(limiter.remove_tokens("k", 4).await.unwrap(), 6);
        assert_eq!(limiter.add_tokens("k", 2).await.unwrap(), 8);
        assert_eq!(limiter.add_tokens("k", 50).await.unwrap(), 10);
        assert_eq!(limiter.remove_tokens("k", 50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_positive_adjustments_are_noops() {
        let (limiter, _clock) = setup(10, 1, Duration::from_secs(1));

        limiter.consume("k", 3).await.unwrap();
        assert_eq!(limiter.add_tokens("k", 0).await.unwrap(), 7);
        assert_eq!(limiter.add_tokens("k", -5).await.unwrap(), 7);
        assert_eq!(limiter.remove_tokens("k", -5).await.unwrap(), 7);
        assert_eq!(limiter.get_remaining_tokens("k").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_read_path_matches_write_path_refill() {
        let (limiter, clock) = setup(10, 3, Duration::from_millis(500));

        limiter.consume("k", 10).await.unwrap();
        clock.set(1_250);
        let read = limiter.get_remaining_tokens("k").await.unwrap();
        let written = limiter.consume("k", 0).await.unwrap();
        assert_eq!(read, 6);
        assert_eq!(written.remaining_tokens, 6);
        assert_eq!(written.next_refill_at, 1_500);
    }

    #[test]
    fn test_accessors_and_validation() {
        let (limiter, _clock) = setup(10, 2, Duration::from_secs(1));
        assert_eq!(limiter.capacity(), 10);
        assert_eq!(limiter.refill_amount(), 2);
        assert_eq!(limiter.refill_interval(), Duration::from_secs(1));

        let store = StateStore::local();
        assert!(TokenBucketLimiter::new("x", 0, 1, Duration::from_secs(1), store.clone()).is_err());
        assert!(TokenBucketLimiter::new("x", 1, 0, Duration::from_secs(1), store.clone()).is_err());
        assert!(TokenBucketLimiter::new("x", 1, 1, Duration::ZERO, store).is_err());
    }
}
