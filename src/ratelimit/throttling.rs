//! Minimum spacing between admissions.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use serde::{Serialize, Serializer};
use tracing::{debug, trace};

use super::key::{Algorithm, StateKey};
use super::{non_negative, require_name, require_positive_interval, Decision, RateLimiter};
use crate::clock::Millis;
use crate::error::Result;
use crate::store::{scripts, StateStore, Transition};

/// Stored state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleState {
    /// Time of the last admitted call; never moves backwards
    pub last_allowed_at: Millis,
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleDecision {
    pub success: bool,
    /// How long the caller must wait before the next call can succeed
    #[serde(rename = "wait_time_ms", serialize_with = "serialize_millis")]
    pub wait_time: Duration,
    /// Earliest time the next call can succeed, epoch milliseconds
    pub next_allowed_at: Millis,
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlingPolicy {
    pub min_interval: Millis,
}

impl ThrottlingPolicy {
    /// Decide whether a call at `now` would be admitted.
    pub fn evaluate(&self, state: Option<&ThrottleState>, now: Millis) -> ThrottleDecision {
        let Some(state) = state else {
            return self.admitted(now);
        };

        let elapsed = now.saturating_sub(state.last_allowed_at);
        if elapsed >= self.min_interval {
            self.admitted(now)
        } else {
            ThrottleDecision {
                success: false,
                wait_time: Duration::from_millis(self.min_interval - elapsed),
                next_allowed_at: state.last_allowed_at + self.min_interval,
            }
        }
    }

    /// Evaluate and, on success only, record `now` as the last admission.
    pub fn throttle(
        &self,
        state: Option<&ThrottleState>,
        now: Millis,
    ) -> Transition<ThrottleState, ThrottleDecision> {
        let decision = self.evaluate(state, now);
        if decision.success {
            Transition::Write(
                ThrottleState {
                    last_allowed_at: now,
                },
                decision,
            )
        } else {
            Transition::Skip(decision)
        }
    }

    fn admitted(&self, now: Millis) -> ThrottleDecision {
        ThrottleDecision {
            success: true,
            wait_time: Duration::ZERO,
            next_allowed_at: now,
        }
    }
}

/// Enforces a minimum interval between admitted calls per key.
#[derive(Debug)]
pub struct ThrottlingLimiter {
    name: String,
    policy: ThrottlingPolicy,
    store: StateStore,
    script: Script,
}

impl ThrottlingLimiter {
    /// Create a limiter admitting at most one call per `min_interval`.
    pub fn new(name: impl Into<String>, min_interval: Duration, store: StateStore) -> Result<Self> {
        let policy = ThrottlingPolicy {
            min_interval: require_positive_interval("minimum interval", min_interval)?,
        };

        Ok(Self {
            name: require_name(name.into())?,
            policy,
            store,
            script: Script::new(scripts::THROTTLE),
        })
    }

    fn state_key(&self, key: &str) -> String {
        StateKey::new(Algorithm::Throttling, &self.name, key).to_string_key()
    }

    /// Admit a call for `key` if at least the minimum interval has passed
    /// since the last admitted one. Rejections write nothing.
    pub async fn throttle(&self, key: &str) -> Result<ThrottleDecision> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        let decision = match &self.store {
            StateStore::Local(local) => {
                let policy = self.policy;
                local.transact(&state_key, policy.min_interval, now, |state| {
                    policy.throttle(state, now)
                })
            }
            StateStore::Redis(remote) => {
                let mut invocation = self.script.prepare_invoke();
                invocation
                    .key(&state_key)
                    .arg(self.policy.min_interval)
                    .arg(now);
                let (success, wait_time, next_allowed_at): (i64, i64, i64) =
                    remote.invoke(&invocation).await?;
                ThrottleDecision {
                    success: success == 1,
                    wait_time: Duration::from_millis(non_negative(wait_time)),
                    next_allowed_at: non_negative(next_allowed_at),
                }
            }
        };

        trace!(
            key = %state_key,
            success = decision.success,
            wait_ms = decision.wait_time.as_millis() as u64,
            "Throttle decision"
        );
        if !decision.success {
            debug!(
                key = %state_key,
                next_allowed_at = decision.next_allowed_at,
                "Throttled"
            );
        }
        Ok(decision)
    }

    /// What `throttle` would decide for `key` right now. Never writes.
    pub async fn get_status(&self, key: &str) -> Result<ThrottleDecision> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        match &self.store {
            StateStore::Local(local) => {
                Ok(local.read(&state_key, now, |state| self.policy.evaluate(state, now)))
            }
            StateStore::Redis(remote) => {
                let mut cmd = redis::cmd("GET");
                cmd.arg(&state_key);
                let last_allowed_at: Option<u64> = remote.query(&cmd).await?;
                let state = last_allowed_at.map(|last_allowed_at| ThrottleState { last_allowed_at });
                Ok(self.policy.evaluate(state.as_ref(), now))
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

    /// Minimum spacing between admitted calls.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.policy.min_interval)
    }

    /// Minimum spacing in (fractional) seconds.
    pub fn min_interval_seconds(&self) -> f64 {
        self.min_interval().as_secs_f64()
    }
}

#[async_trait]
impl RateLimiter for ThrottlingLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, key: &str) -> Result<Decision> {
        let decision = self.throttle(key).await?;
        Ok(if decision.success {
            Decision::allowed(0)
        } else {
            Decision::rejected()
        })
    }

    async fn remaining(&self, key: &str) -> Result<u64> {
        Ok(u64::from(self.get_status(key).await?.success))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        ThrottlingLimiter::reset(self, key).await
    }
}
