//! In-process store for tests and single-node development.
//!
//! Implements the same atomic contract as the Redis adapter: every operation
//! runs under the key's `DashMap` shard lock, and expiry is evaluated lazily
//! against the injected clock on each access. Every [`SWEEP_EVERY_OPS`]
//! accesses also drop all expired keys, so keys that are never touched
//! again (old window buckets, idle markers) do not accumulate.
//!
//! Instances do not share state with anything outside the process, so this
//! adapter is only correct for a single instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::store::{resolve_range, AtomicStore, CounterState, StoreError, StoreResult};

/// Accesses between full sweeps of expired keys.
pub const SWEEP_EVERY_OPS: u64 = 256;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    List(VecDeque<String>),
    Marker,
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Slot {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn ttl(&self, now_ms: i64) -> Option<Duration> {
        self.expires_at_ms
            .map(|at| Duration::from_millis((at - now_ms).max(0) as u64))
    }
}

/// `DashMap`-backed [`AtomicStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    slots: Arc<DashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    closed: Arc<AtomicBool>,
    ops: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
            closed: Arc::new(AtomicBool::new(false)),
            ops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.slots.iter().filter(|s| !s.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            tracing::trace!(removed, "Swept expired keys");
        }
        removed
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Entry for `key` with expired contents already dropped.
    ///
    /// Must not be called while holding a guard into `slots`: the periodic
    /// sweep locks every shard.
    fn live_entry(&self, key: &str) -> MapEntry<'_, String, Slot> {
        if (self.ops.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY_OPS == 0 {
            self.sweep_expired();
        }
        let now = self.clock.now_ms();
        match self.slots.entry(key.to_string()) {
            MapEntry::Occupied(occupied) if occupied.get().is_expired(now) => {
                let (key, _) = occupied.remove_entry();
                self.slots.entry(key)
            }
            other => other,
        }
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Command(format!("key '{}' holds the wrong kind of value", key))
    }

    fn incr_slot(slot: &mut Slot, key: &str) -> StoreResult<i64> {
        match &mut slot.value {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    fn push_slot(slot: &mut Slot, key: &str, value: &str) -> StoreResult<()> {
        match &mut slot.value {
            Value::List(items) => {
                items.push_front(value.to_string());
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    fn trim_slot(slot: &mut Slot, key: &str, start: isize, end: isize) -> StoreResult<()> {
        match &mut slot.value {
            Value::List(items) => {
                match resolve_range(items.len(), start, end) {
                    Some((from, to)) => *items = items.drain(from..=to).collect(),
                    None => items.clear(),
                }
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.ensure_open()?;
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => Self::incr_slot(occupied.get_mut(), key),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Counter(1),
                    expires_at_ms: None,
                });
                Ok(1)
            }
        }
    }

    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.expires_at_ms.is_some() {
                    return Ok(false);
                }
                slot.expires_at_ms = Some(now + ttl.as_millis() as i64);
                Ok(true)
            }
            MapEntry::Vacant(_) => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        self.ensure_open()?;
        match self.live_entry(key) {
            MapEntry::Occupied(occupied) => match occupied.get().value {
                Value::Counter(n) => Ok(Some(n)),
                _ => Err(Self::wrong_type(key)),
            },
            MapEntry::Vacant(_) => Ok(None),
        }
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        match self.live_entry(key) {
            MapEntry::Occupied(occupied) => Ok(occupied.get().ttl(now)),
            MapEntry::Vacant(_) => Ok(None),
        }
    }

    async fn push_front(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_open()?;
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => Self::push_slot(occupied.get_mut(), key, value),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::List(VecDeque::from([value.to_string()])),
                    expires_at_ms: None,
                });
                Ok(())
            }
        }
    }

    async fn range_list(&self, key: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        match self.live_entry(key) {
            MapEntry::Occupied(occupied) => match &occupied.get().value {
                Value::List(items) => Ok(match resolve_range(items.len(), start, end) {
                    Some((from, to)) => items.range(from..=to).cloned().collect(),
                    None => Vec::new(),
                }),
                _ => Err(Self::wrong_type(key)),
            },
            MapEntry::Vacant(_) => Ok(Vec::new()),
        }
    }

    async fn trim_list(&self, key: &str, start: isize, end: isize) -> StoreResult<()> {
        self.ensure_open()?;
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => {
                Self::trim_slot(occupied.get_mut(), key, start, end)?;
                if matches!(&occupied.get().value, Value::List(items) if items.is_empty()) {
                    occupied.remove();
                }
                Ok(())
            }
            MapEntry::Vacant(_) => Ok(()),
        }
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<CounterState> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let expires_at = now + ttl.as_millis() as i64;
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let count = Self::incr_slot(slot, key)?;
                if slot.expires_at_ms.is_none() {
                    slot.expires_at_ms = Some(expires_at);
                }
                Ok(CounterState {
                    count,
                    ttl: slot.ttl(now),
                })
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Counter(1),
                    expires_at_ms: Some(expires_at),
                });
                Ok(CounterState {
                    count: 1,
                    ttl: Some(ttl),
                })
            }
        }
    }

    async fn push_front_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        let expires_at = Some(self.clock.now_ms() + ttl.as_millis() as i64);
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                Self::push_slot(slot, key, value)?;
                Self::trim_slot(slot, key, 0, max_len as isize - 1)?;
                slot.expires_at_ms = expires_at;
            }
            MapEntry::Vacant(vacant) => {
                let mut items = VecDeque::from([value.to_string()]);
                items.truncate(max_len);
                vacant.insert(Slot {
                    value: Value::List(items),
                    expires_at_ms: expires_at,
                });
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.ensure_open()?;
        let expires_at = Some(self.clock.now_ms() + ttl.as_millis() as i64);
        match self.live_entry(key) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Marker,
                    expires_at_ms: expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        tracing::debug!("Memory store closed");
        Ok(())
    }
}
