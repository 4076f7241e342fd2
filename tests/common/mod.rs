//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abuse_guard::clock::ManualClock;
use abuse_guard::config::GuardConfig;
use abuse_guard::http::{AppState, HttpServer};
use abuse_guard::store::{AtomicStore, CounterState, MemoryStore, StoreError, StoreResult};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;

/// Aligned to a 60s window boundary.
pub const T0: i64 = 1_700_000_040_000;

/// Memory store that fails on demand.
///
/// Every operation counts as one call. `fail_on_call(n)` makes exactly the
/// n-th call (1-based) fail; `set_down(true)` fails every call.
#[derive(Debug, Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    calls: Arc<AtomicUsize>,
    fail_on: Arc<AtomicUsize>,
    down: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            inner: MemoryStore::new(Arc::new(clock)),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: Arc::new(AtomicUsize::new(0)),
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_on_call(&self, n: usize) {
        self.fail_on.store(n, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> StoreResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.down.load(Ordering::SeqCst) || self.fail_on.load(Ordering::SeqCst) == n {
            return Err(StoreError::Connection("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for FlakyStore {
    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.gate()?;
        self.inner.increment(key).await
    }

    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.gate()?;
        self.inner.set_expiry_if_absent(key, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        self.gate()?;
        self.inner.get(key).await
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.gate()?;
        self.inner.pttl(key).await
    }

    async fn push_front(&self, key: &str, value: &str) -> StoreResult<()> {
        self.gate()?;
        self.inner.push_front(key, value).await
    }

    async fn range_list(&self, key: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        self.gate()?;
        self.inner.range_list(key, start, end).await
    }

    async fn trim_list(&self, key: &str, start: isize, end: isize) -> StoreResult<()> {
        self.gate()?;
        self.inner.trim_list(key, start, end).await
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<CounterState> {
        self.gate()?;
        self.inner.increment_with_expiry(key, ttl).await
    }

    async fn push_front_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.gate()?;
        self.inner.push_front_bounded(key, value, max_len, ttl).await
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.gate()?;
        self.inner.set_if_absent(key, ttl).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.gate()?;
        self.inner.ping().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}

/// Config with a 60s / 5 request login policy and an empty key prefix.
pub fn test_config() -> GuardConfig {
    let mut config = GuardConfig::default();
    config.store.key_prefix = String::new();
    config.policies.login.window_ms = 60_000;
    config.policies.login.max_requests = 5;
    config.admin.api_key = "test-key".into();
    config
}

pub fn app_state(config: GuardConfig, store: Arc<dyn AtomicStore>, clock: ManualClock) -> AppState {
    AppState::new(config, store, Arc::new(clock)).unwrap()
}

pub fn router(state: AppState) -> Router {
    HttpServer::new(state).router()
}

pub fn post_from(path: &str, ip: &str) -> Request<Body> {
    Request::post(path)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

pub fn header<'a, B>(res: &'a Response<B>, name: &str) -> &'a str {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

pub async fn body_json(res: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
