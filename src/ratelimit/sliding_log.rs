//! Sliding log.
//!
//! Remembers the timestamp of every admission inside the trailing interval
//! and admits while fewer than `limit` remain. Exact, but each call costs
//! time and memory proportional to the number of logged admissions.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tracing::{debug, trace};

use super::key::{Algorithm, StateKey};
use super::{
    admission_id, require_name, require_positive, require_positive_interval, Decision,
    RateLimiter,
};
use crate::clock::Millis;
use crate::error::Result;
use crate::store::{scripts, StateStore, Transition};

/// One logged admission.
///
/// Ordered by time first; `id` separates admissions logged in the same
/// millisecond.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogEntry {
    pub at: Millis,
    pub id: String,
}

impl LogEntry {
    /// The sorted-set member used by the Redis backend.
    pub fn member(&self) -> String {
        format!("{}:{}", self.at, self.id)
    }
}

/// Stored state for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlidingLogState {
    pub entries: BTreeSet<LogEntry>,
}

/// Limit and trailing interval, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingLogPolicy {
    pub limit: u64,
    pub interval: Millis,
}

impl SlidingLogPolicy {
    /// Entries still inside the trailing interval, i.e. newer than
    /// `now - interval`.
    pub fn prune(&self, state: Option<&SlidingLogState>, now: Millis) -> SlidingLogState {
        let mut entries = state.map(|s| s.entries.clone()).unwrap_or_default();
        if let Some(cutoff) = now.checked_sub(self.interval) {
            entries = entries.split_off(&LogEntry {
                at: cutoff + 1,
                id: String::new(),
            });
        }
        SlidingLogState { entries }
    }

    /// Attempt one admission, logging `entry` on success.
    pub fn consume(
        &self,
        state: Option<&SlidingLogState>,
        entry: LogEntry,
        now: Millis,
    ) -> (SlidingLogState, Decision) {
        let mut next = self.prune(state, now);
        let count = next.entries.len() as u64;

        if count < self.limit {
            next.entries.insert(entry);
            (next, Decision::allowed(self.limit.saturating_sub(count + 1)))
        } else {
            (next, Decision::rejected())
        }
    }

    /// Remaining admissions at `now`.
    pub fn remaining(&self, state: Option<&SlidingLogState>, now: Millis) -> u64 {
        let live = match state {
            Some(state) => state
                .entries
                .iter()
                .filter(|e| e.at.saturating_add(self.interval) > now)
                .count() as u64,
            None => 0,
        };
        self.limit.saturating_sub(live)
    }
}

/// A sliding log rate limiter.
#[derive(Debug)]
pub struct SlidingLogLimiter {
    name: String,
    policy: SlidingLogPolicy,
    store: StateStore,
    script: Script,
}

impl SlidingLogLimiter {
    /// Create a limiter admitting `limit` requests per trailing `interval`.
    pub fn new(
        name: impl Into<String>,
        limit: u64,
        interval: Duration,
        store: StateStore,
    ) -> Result<Self> {
        let policy = SlidingLogPolicy {
            limit: require_positive("limit", limit)?,
            interval: require_positive_interval("interval", interval)?,
        };

        Ok(Self {
            name: require_name(name.into())?,
            policy,
            store,
            script: Script::new(scripts::SLIDING_LOG_CONSUME),
        })
    }

    fn state_key(&self, key: &str) -> String {
        StateKey::new(Algorithm::SlidingLog, &self.name, key).to_string_key()
    }

    /// Attempt one admission for `key`.
    ///
    /// `request_id` tags the logged entry. Each call logs its own entry,
    /// so repeating an id never admits past the limit.
    pub async fn consume(&self, key: &str, request_id: Option<&str>) -> Result<Decision> {
        let state_key = self.state_key(key);
        let now = self.store.now();
        let entry = LogEntry {
            at: now,
            id: admission_id(request_id),
        };

        let decision = match &self.store {
            StateStore::Local(local) => {
                let policy = self.policy;
                local.transact(&state_key, policy.interval, now, |state| {
                    let (next, decision) = policy.consume(state, entry, now);
                    Transition::Write(next, decision)
                })
            }
            StateStore::Redis(remote) => {
                let mut invocation = self.script.prepare_invoke();
                invocation
                    .key(&state_key)
                    .arg(self.policy.limit)
                    .arg(self.policy.interval)
                    .arg(now)
                    .arg(entry.member());
                Decision::from_reply(remote.invoke(&invocation).await?)
            }
        };

        trace!(
            key = %state_key,
            success = decision.success,
            remaining = decision.remaining,
            "Sliding log decision"
        );
        if !decision.success {
            debug!(key = %state_key, limit = self.policy.limit, "Sliding log limit exceeded");
        }
        Ok(decision)
    }

    /// Remaining admissions for `key` without logging one.
    pub async fn get_remaining(&self, key: &str) -> Result<u64> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        match &self.store {
            StateStore::Local(local) => {
                Ok(local.read(&state_key, now, |state| self.policy.remaining(state, now)))
            }
            StateStore::Redis(remote) => {
                let min = match now.checked_sub(self.policy.interval) {
                    Some(cutoff) => format!("({}", cutoff),
                    None => "-inf".to_string(),
                };
                let mut cmd = redis::cmd("ZCOUNT");
                cmd.arg(&state_key).arg(min).arg("+inf");
                let live: u64 = remote.query(&cmd).await?;
                Ok(self.policy.limit.saturating_sub(live))
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

    /// Trailing interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.policy.interval)
    }
}

#[async_trait]
impl RateLimiter for SlidingLogLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, key: &str) -> Result<Decision> {
        self.consume(key, None).await
    }

    async fn remaining(&self, key: &str) -> Result<u64> {
        self.get_remaining(key).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        SlidingLogLimiter::reset(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LocalStore;
    use std::sync::Arc;

    fn setup(limit: u64, interval: Duration) -> (SlidingLogLimiter, ManualClock) {
        let clock = ManualClock::new(0);
        let store = StateStore::from(LocalStore::with_clock(Arc::new(clock.clone())));
        let limiter = SlidingLogLimiter::new("test", limit, interval, store).unwrap();
        (limiter, clock)
    }

    fn entry(at: Millis, id: &str) -> LogEntry {
        LogEntry {
            at,
            id: id.to_string(),
        }
    }

    #[test]
    fn test_prune_drops_entries_at_or_before_cutoff() {
        let policy = SlidingLogPolicy {
            limit: 5,
            interval: 10_000,
        };
        let state = SlidingLogState {
            entries: [entry(0, "a"), entry(1_000, "b"), entry(2_000, "c")]
                .into_iter()
                .collect(),
        };

        let pruned = policy.prune(Some(&state), 11_000);
        let times: Vec<_> = pruned.entries.iter().map(|e| e.at).collect();
        assert_eq!(times, vec![2_000]);
        assert_eq!(policy.remaining(Some(&state), 11_000), 4);
    }

    #[test]
    fn test_same_millisecond_entries_are_distinct() {
        let policy = SlidingLogPolicy {
            limit: 5,
            interval: 1_000,
        };
        let (state, _) = policy.consume(None, entry(10, "a"), 10);
        let (state, decision) = policy.consume(Some(&state), entry(10, "b"), 10);

        assert_eq!(state.entries.len(), 2);
        assert_eq!(decision, Decision::allowed(3));
    }

    #[tokio::test]
    async fn test_log_scenario() {
        let (limiter, clock) = setup(5, Duration::from_secs(10));

        for second in 0..5u64 {
            clock.set(second * 1_000);
            let decision = limiter.consume("user", None).await.unwrap();
            assert!(decision.success);
            assert_eq!(decision.remaining, 4 - second);
        }

        clock.set(9_000);
        let decision = limiter.consume("user", None).await.unwrap();
        assert!(!decision.success);
        assert_eq!(decision.remaining, 0);

        clock.set(10_100);
        let decision = limiter.consume("user", None).await.unwrap();
        assert!(decision.success);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_request_ids_allow_bursts_in_one_millisecond() {
        let (limiter, _clock) = setup(3, Duration::from_secs(1));

        assert!(limiter.consume("k", Some("r1")).await.unwrap().success);
        assert!(limiter.consume("k", Some("r2")).await.unwrap().success);
        assert!(limiter.consume("k", Some("r3")).await.unwrap().success);
        assert!(!limiter.consume("k", Some("r4")).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_repeated_request_id_still_counts() {
        let (limiter, _clock) = setup(3, Duration::from_secs(10));

        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.consume("k", Some("same")).await.unwrap().success {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(limiter.get_remaining("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_remaining_does_not_append() {
        let (limiter, clock) = setup(2, Duration::from_secs(1));

        limiter.consume("k", None).await.unwrap();
        assert_eq!(limiter.get_remaining("k").await.unwrap(), 1);
        assert_eq!(limiter.get_remaining("k").await.unwrap(), 1);

        clock.set(1_000);
        assert_eq!(limiter.get_remaining("k").await.unwrap(), 2);
    }
}
