//! Shared atomic counter/list store.
//!
//! # Data Flow
//! ```text
//! RateLimiter        → increment_with_expiry (INCR + PEXPIRE NX + PTTL)
//! SecurityEventStore → push_front_bounded   (LPUSH + LTRIM + PEXPIRE)
//!                    → range_list           (LRANGE)
//! AnomalyDetector    → set_if_absent        (SET NX PX)
//! ```
//!
//! # Design Decisions
//! - The store is the only synchronization primitive between instances;
//!   nothing on the request path takes a local lock
//! - Every batch touches a single key, so no multi-key transactions are needed
//! - Handles are constructor-injected (`Arc<dyn AtomicStore>`) with explicit
//!   connect/close, never process-global

pub mod memory;
pub mod redis_store;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::resilience::Deadline;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Errors surfaced by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store did not answer within the allotted budget.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with an error or an unexpected reply.
    #[error("store command failed: {0}")]
    Command(String),

    /// The handle was closed.
    #[error("store handle is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Counter value and remaining lifetime after an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: i64,
    /// `None` when the store reports no expiry on the key.
    pub ttl: Option<Duration>,
}

/// Atomic primitives the abuse-prevention core relies on.
///
/// Single-key operations must be atomic. The batch operations
/// (`increment_with_expiry`, `push_front_bounded`, `set_if_absent`) must run
/// as one logical operation in a single round trip.
#[async_trait]
pub trait AtomicStore: Send + Sync + std::fmt::Debug {
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Attach an expiry only if the key currently has none.
    /// Returns whether the expiry was set.
    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Remaining lifetime, `None` if the key is missing or has no expiry.
    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn push_front(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Inclusive range with Redis index semantics (negative counts from the end).
    async fn range_list(&self, key: &str, start: isize, end: isize) -> StoreResult<Vec<String>>;

    async fn trim_list(&self, key: &str, start: isize, end: isize) -> StoreResult<()>;

    /// Increment, attach `ttl` if the key has no expiry yet, and read the
    /// remaining lifetime, all atomically.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<CounterState>;

    /// Push to the head of a list, trim it to `max_len` entries and set the
    /// list's expiry, atomically.
    async fn push_front_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Create a marker key with `ttl` unless it already exists.
    /// Returns `true` if this call created it.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()>;

    /// Release the handle. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> StoreResult<()>;
}

/// Run a store future under `deadline`, mapping expiry to [`StoreError::Timeout`].
pub async fn bounded<F, T>(deadline: &Deadline, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match deadline.run(fut).await {
        Ok(result) => result,
        Err(exceeded) => Err(StoreError::Timeout(exceeded.budget)),
    }
}

/// Convert inclusive Redis-style `start..=end` indices into a slice range.
pub(crate) fn resolve_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize))
}
