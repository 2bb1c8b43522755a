//! In-process state store.

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Transition;
use crate::clock::{Clock, Millis, SystemClock};

/// One key's state plus the instant it stops being meaningful.
struct Slot {
    state: Box<dyn Any + Send + Sync>,
    expires_at: Millis,
}

impl Slot {
    fn live<S: 'static>(&self, now: Millis) -> Option<&S> {
        if self.expires_at > now {
            self.state.downcast_ref::<S>()
        } else {
            None
        }
    }
}

struct Inner {
    /// Slots indexed by namespaced key. The map's shard lock is the
    /// mutual-exclusion section for every transaction on a key.
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            let keep = slot.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

/// Limiter state held in this process.
///
/// Transactions on the same key are serialized; keys in different shards
/// proceed in parallel. Transition functions run synchronously while the
/// key is held, so no other caller can observe a half-applied update.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                clock,
            }),
        }
    }

    /// The store's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Run one atomic read-modify-write on `key`.
    ///
    /// `f` sees the key's live state (`None` if unseen or expired). A
    /// [`Transition::Write`] replaces it and sets its expiry to `now + ttl`.
    pub fn transact<S, R, F>(&self, key: &str, ttl: Millis, now: Millis, f: F) -> R
    where
        S: Send + Sync + 'static,
        F: FnOnce(Option<&S>) -> Transition<S, R>,
    {
        let expires_at = now.saturating_add(ttl);

        match self.inner.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let transition = f(occupied.get().live::<S>(now));
                match transition {
                    Transition::Write(state, result) => {
                        occupied.insert(Slot {
                            state: Box::new(state),
                            expires_at,
                        });
                        result
                    }
                    Transition::Skip(result) => result,
                }
            }
            Entry::Vacant(vacant) => match f(None) {
                Transition::Write(state, result) => {
                    debug!(key = %vacant.key(), "Creating local rate limit state");
                    vacant.insert(Slot {
                        state: Box::new(state),
                        expires_at,
                    });
                    result
                }
                Transition::Skip(result) => result,
            },
        }
    }

    /// Evaluate `f` against the key's live state without writing.
    ///
    /// Never creates an entry for an unseen key.
    pub fn read<S, R, F>(&self, key: &str, now: Millis, f: F) -> R
    where
        S: Send + Sync + 'static,
        F: FnOnce(Option<&S>) -> R,
    {
        match self.inner.entries.get(key) {
            Some(slot) => f(slot.live::<S>(now)),
            None => f(None),
        }
    }

    /// Remove `key`. Returns whether anything was stored.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    /// Number of stored keys, expired or not.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop every key whose expiry has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Start a background task that purges expired keys every `period`.
    ///
    /// The task stops when the returned [`Sweeper`] is dropped or when the
    /// last handle to this store goes away. Must be called from within a
    /// Tokio runtime.
    pub fn spawn_sweeper(&self, period: Duration) -> Sweeper {
        let store: Weak<Inner> = Arc::downgrade(&self.inner);
        info!(period_ms = period.as_millis() as u64, "Starting local state sweeper");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = store.upgrade() else {
                    debug!("Local store dropped, stopping sweeper");
                    break;
                };
                let removed = inner.purge_expired();
                if removed > 0 {
                    debug!(removed = removed, "Purged expired rate limit state");
                }
            }
        });

        Sweeper { handle }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("keys", &self.inner.entries.len())
            .field("clock", &self.inner.clock)
            .finish()
    }
}

/// Handle to a running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Stop the sweeper now.
    pub fn stop(self) {
        drop(self);
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
