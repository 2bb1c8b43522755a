//! Leaky bucket as a capped admission queue.
//!
//! Each admitted request occupies a slot until `now + interval`. A request
//! is admitted while fewer than `capacity` slots are occupied. Slots free
//! up by expiring; nothing drains the queue on a schedule.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use serde::Serialize;
use tracing::{debug, trace};

use super::key::{Algorithm, StateKey};
use super::{
    admission_id, require_name, require_positive, require_positive_interval, Decision,
    RateLimiter,
};
use crate::clock::Millis;
use crate::error::Result;
use crate::store::{scripts, StateStore, Transition};

/// Stored state for one key: the expiry of every occupied slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakyBucketState {
    pub queue: VecDeque<Millis>,
}

/// Queue occupancy for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Occupied slots
    pub size: u64,
    /// Free slots
    pub remaining: u64,
}

/// Queue capacity and how long each admission occupies a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakyBucketPolicy {
    pub capacity: u64,
    pub interval: Millis,
}

impl LeakyBucketPolicy {
    /// Queue at `now` with expired slots removed.
    pub fn drain(&self, state: Option<&LeakyBucketState>, now: Millis) -> LeakyBucketState {
        let mut queue = state.map(|s| s.queue.clone()).unwrap_or_default();
        queue.retain(|&expiry| expiry > now);
        LeakyBucketState { queue }
    }

    /// Attempt to occupy one slot.
    pub fn consume(
        &self,
        state: Option<&LeakyBucketState>,
        now: Millis,
    ) -> (LeakyBucketState, Decision) {
        let mut next = self.drain(state, now);
        let size = next.queue.len() as u64;

        if size < self.capacity {
            next.queue.push_back(now.saturating_add(self.interval));
            (next, Decision::allowed(self.capacity - (size + 1)))
        } else {
            (next, Decision::rejected())
        }
    }

    /// Occupancy at `now`.
    pub fn status(&self, state: Option<&LeakyBucketState>, now: Millis) -> QueueStatus {
        let size = match state {
            Some(state) => state.queue.iter().filter(|&&expiry| expiry > now).count() as u64,
            None => 0,
        };
        self.status_for(size)
    }

    fn status_for(&self, size: u64) -> QueueStatus {
        QueueStatus {
            size,
            remaining: self.capacity.saturating_sub(size),
        }
    }
}

/// A leaky bucket rate limiter.
#[derive(Debug)]
pub struct LeakyBucketLimiter {
    name: String,
    policy: LeakyBucketPolicy,
    store: StateStore,
    script: Script,
}

impl LeakyBucketLimiter {
    /// Create a queue of `capacity` slots, each held for `interval`.
    pub fn new(
        name: impl Into<String>,
        capacity: u64,
        interval: Duration,
        store: StateStore,
    ) -> Result<Self> {
        let policy = LeakyBucketPolicy {
            capacity: require_positive("capacity", capacity)?,
            interval: require_positive_interval("interval", interval)?,
        };

        Ok(Self {
            name: require_name(name.into())?,
            policy,
            store,
            script: Script::new(scripts::LEAKY_BUCKET_CONSUME),
        })
    }

    fn state_key(&self, key: &str) -> String {
        StateKey::new(Algorithm::LeakyBucket, &self.name, key).to_string_key()
    }

    /// Attempt to enqueue one request for `key`.
    ///
    /// `request_id` tags the queued slot in the shared store. Every
    /// admission occupies its own slot whatever the id.
    pub async fn consume(&self, key: &str, request_id: Option<&str>) -> Result<Decision> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        let decision = match &self.store {
            StateStore::Local(local) => {
                let policy = self.policy;
                local.transact(&state_key, policy.interval, now, |state| {
                    let (next, decision) = policy.consume(state, now);
                    Transition::Write(next, decision)
                })
            }
            StateStore::Redis(remote) => {
                let mut invocation = self.script.prepare_invoke();
                invocation
                    .key(&state_key)
                    .arg(self.policy.capacity)
                    .arg(self.policy.interval)
                    .arg(now)
                    .arg(format!("{}:{}", now, admission_id(request_id)));
                Decision::from_reply(remote.invoke(&invocation).await?)
            }
        };

        trace!(
            key = %state_key,
            success = decision.success,
            remaining = decision.remaining,
            "Leaky bucket decision"
        );
        if !decision.success {
            debug!(key = %state_key, capacity = self.policy.capacity, "Leaky bucket full");
        }
        Ok(decision)
    }

    /// Current occupancy of `key`'s queue.
    pub async fn get_state(&self, key: &str) -> Result<QueueStatus> {
        let state_key = self.state_key(key);
        let now = self.store.now();

        match &self.store {
            StateStore::Local(local) => {
                Ok(local.read(&state_key, now, |state| self.policy.status(state, now)))
            }
            StateStore::Redis(remote) => {
                let mut cmd = redis::cmd("ZCOUNT");
                cmd.arg(&state_key).arg(format!("({}", now)).arg("+inf");
                let size: u64 = remote.query(&cmd).await?;
                Ok(self.policy.status_for(size))
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

    /// Slots in each queue.
    pub fn capacity(&self) -> u64 {
        self.policy.capacity
    }

    /// How long an admission occupies its slot.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.policy.interval)
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, key: &str) -> Result<Decision> {
        self.consume(key, None).await
    }

    async fn remaining(&self, key: &str) -> Result<u64> {
        Ok(self.get_state(key).await?.remaining)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        LeakyBucketLimiter::reset(self, key).await
    }
}
