//! Redis-backed state store.
//!
//! Mutating operations run as Lua scripts so the read, the derivation and
//! the write happen as one server-side step. Redis serializes scripts, so
//! clients need no locking of their own.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, ScriptInvocation};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// A connection to a shared Redis server.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) on the system clock.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_clock(url, Arc::new(SystemClock)).await
    }

    /// Connect to `url`, reading "now" from `clock`.
    pub async fn connect_with_clock(url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Invalid Redis connection URL");
            e
        })?;
        let manager = client.get_connection_manager().await.map_err(|e| {
            warn!(error = %e, "Failed to connect to Redis");
            e
        })?;

        info!("Connected to Redis state store");
        Ok(Self { manager, clock })
    }

    /// The store's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run a prepared script invocation and decode its reply.
    ///
    /// The call is awaited to completion. If the caller drops the future
    /// the script may still have committed.
    pub(crate) async fn invoke<T: FromRedisValue>(
        &self,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T> {
        let mut conn = self.manager.clone();
        let reply: T = invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!(error = %e, "Rate limit script failed");
            e
        })?;
        Ok(reply)
    }

    /// Run a single read command and decode its reply.
    pub(crate) async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.manager.clone();
        let reply: T = cmd.query_async(&mut conn).await.map_err(|e| {
            warn!(error = %e, "Rate limit state read failed");
            e
        })?;
        Ok(reply)
    }

    /// Delete `key`.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _removed: i64 = self.query(&cmd).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
