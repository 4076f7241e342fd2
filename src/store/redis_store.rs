//! Redis adapter for [`AtomicStore`].
//!
//! Shares counters, event lists and alert markers between every instance
//! pointed at the same Redis.
//!
//! ## Command mapping
//!
//! | operation               | commands                                  |
//! |-------------------------|-------------------------------------------|
//! | `increment_with_expiry` | `MULTI INCR; PEXPIRE key ttl NX; PTTL EXEC` |
//! | `push_front_bounded`    | `MULTI LPUSH; LTRIM 0 n-1; PEXPIRE EXEC`  |
//! | `set_if_absent`         | `SET key 1 NX PX ttl`                     |
//!
//! `PEXPIRE ... NX` requires Redis 7.0 or newer. It attaches the expiry only
//! when the key has none, which is the case exactly when `INCR` just created
//! it, so a busy window can never push its own reset further out.
//!
//! Connections go through `redis::aio::ConnectionManager`, which reconnects
//! transparently. Failures surface as [`StoreError`] and are resolved by the
//! caller; this adapter never retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};

use crate::store::{AtomicStore, CounterState, StoreError, StoreResult};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Upper bound on establishing the initial connection.
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Redis-backed [`AtomicStore`].
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    config: RedisStoreConfig,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.config.url)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Open a managed connection.
    ///
    /// # Errors
    /// Returns [`StoreError::Connection`] if the URL is invalid or the server
    /// cannot be reached within `connect_timeout`.
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(format!("invalid redis url: {}", e)))?;

        let manager = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout))??;

        tracing::info!(url = %config.url, "Connected to Redis");

        Ok(Self {
            manager,
            config,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn conn(&self) -> StoreResult<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.manager.clone())
    }
}

fn millis(ttl: Duration) -> i64 {
    (ttl.as_millis() as i64).max(1)
}

/// Interpret a `PTTL` reply: -2 missing key, -1 no expiry.
fn ttl_from_reply(ms: i64) -> Option<Duration> {
    (ms >= 0).then(|| Duration::from_millis(ms as u64))
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let count: i64 = conn.incr(key, 1).await?;
        Ok(count)
    }

    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.conn()?;
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn()?;
        let ms: i64 = conn.pttl(key).await?;
        Ok(ttl_from_reply(ms))
    }

    async fn push_front(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn range_list(&self, key: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        let items: Vec<String> = conn.lrange(key, start, end).await?;
        Ok(items)
    }

    async fn trim_list(&self, key: &str, start: isize, end: isize) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let _: () = conn.ltrim(key, start, end).await?;
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<CounterState> {
        let mut conn = self.conn()?;
        let (count, ttl_ms): (i64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .arg("NX")
            .ignore()
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(CounterState {
            count,
            ttl: ttl_from_reply(ttl_ms),
        })
    }

    async fn push_front_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let _: () = redis::pipe()
            .atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, max_len as isize - 1)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        // The underlying connection is dropped with the last clone.
        self.closed.store(true, Ordering::Release);
        tracing::info!(url = %self.config.url, "Redis store closed");
        Ok(())
    }
}
