//! Atomic per-key state storage.
//!
//! Every limiter call is a single read-modify-write transaction on one key.
//! [`LocalStore`] runs it in-process under the key's mutual-exclusion
//! section; [`RedisStore`] runs it as one server-side Lua procedure.

mod local;
mod redis_store;
pub(crate) mod scripts;

use std::sync::Arc;

use crate::clock::{Clock, Millis};
use crate::error::Result;

pub use self::local::{LocalStore, Sweeper};
pub use self::redis_store::RedisStore;

/// Outcome of a local transition function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<S, R> {
    /// Commit `S` as the key's new state and return `R`.
    Write(S, R),
    /// Leave the key's state untouched and return `R`.
    Skip(R),
}

/// Handle to the substrate that limiter state lives in.
///
/// Cloning is cheap; clones share the same underlying store and clock.
#[derive(Clone, Debug)]
pub enum StateStore {
    /// In-process memory, lost on restart.
    Local(LocalStore),
    /// A shared Redis server.
    Redis(RedisStore),
}

impl StateStore {
    /// A fresh in-process store on the system clock.
    pub fn local() -> Self {
        StateStore::Local(LocalStore::new())
    }

    /// Connect to a Redis server.
    pub async fn redis(url: &str) -> Result<Self> {
        Ok(StateStore::Redis(RedisStore::connect(url).await?))
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> Millis {
        self.clock().now_millis()
    }

    /// The clock limiters on this store read "now" from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        match self {
            StateStore::Local(local) => local.clock(),
            StateStore::Redis(redis) => redis.clock(),
        }
    }

    /// Drop all state held for `key`.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            StateStore::Local(local) => {
                local.delete(key);
                Ok(())
            }
            StateStore::Redis(redis) => redis.delete(key).await,
        }
    }

    /// Short backend name for logging.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StateStore::Local(_) => "local",
            StateStore::Redis(_) => "redis",
        }
    }
}

impl From<LocalStore> for StateStore {
    fn from(store: LocalStore) -> Self {
        StateStore::Local(store)
    }
}

impl From<RedisStore> for StateStore {
    fn from(store: RedisStore) -> Self {
        StateStore::Redis(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_state_store_uses_local_clock() {
        let clock = ManualClock::new(42);
        let store: StateStore = LocalStore::with_clock(Arc::new(clock.clone())).into();

        assert_eq!(store.now(), 42);
        clock.set(100);
        assert_eq!(store.now(), 100);
        assert_eq!(store.backend_name(), "local");
    }

    #[tokio::test]
    async fn test_state_store_delete() {
        let local = LocalStore::with_clock(Arc::new(ManualClock::new(0)));
        let store = StateStore::from(local.clone());

        local.transact("k", 1_000, 0, |_: Option<&u64>| Transition::Write(1u64, ()));
        assert_eq!(local.len(), 1);

        store.delete("k").await.unwrap();
        assert!(local.is_empty());
    }

    #[test]
    fn test_skip_transition_leaves_state_untouched() {
        let local = LocalStore::with_clock(Arc::new(ManualClock::new(0)));

        let created = local.transact("k", 1_000, 0, |_: Option<&u64>| Transition::Skip(false));
        assert!(!created);
        assert!(local.is_empty());

        local.transact("k", 1_000, 0, |_: Option<&u64>| Transition::Write(7u64, ()));
        let seen = local.transact("k", 1_000, 0, |state: Option<&u64>| {
            Transition::<u64, _>::Skip(state.copied())
        });
        assert_eq!(seen, Some(7));
    }
}
