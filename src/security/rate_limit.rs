//! Distributed fixed-window rate limiter.
//!
//! # Algorithm
//! ```text
//! bucket = floor(now_ms / window_ms)
//! key    = {prefix}rl:{scope}:{identifier}:{bucket}
//! MULTI  INCR key; PEXPIRE key window NX; PTTL key  EXEC
//! allowed   = count <= max_requests
//! remaining = max(0, max_requests - count)
//! ```
//!
//! The counter expiry is attached once, when the key is created, so a caller
//! that never stops sending still gets a reset at a fixed wall-clock
//! boundary. No process-local state is consulted; the store's atomic batch
//! is the only synchronization between instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::clock::Clock;
use crate::observability::metrics;
use crate::resilience::Deadline;
use crate::security::policy::{FailureMode, RateLimitPolicy};
use crate::store::{bounded, AtomicStore, CounterState};

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at_epoch_ms: i64,
    pub retry_after_ms: u64,
}

/// Result of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// The store answered (or the policy failed open); see `allowed`.
    Decided(RateLimitDecision),
    /// The store failed under a fail-closed policy.
    StoreUnavailable,
}

impl RateLimitOutcome {
    pub fn decision(&self) -> Option<&RateLimitDecision> {
        match self {
            RateLimitOutcome::Decided(d) => Some(d),
            RateLimitOutcome::StoreUnavailable => None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision().is_some_and(|d| d.allowed)
    }
}

/// Current usage of a window, read without consuming quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowUsage {
    pub count: u64,
    pub remaining: u64,
    pub reset_at_epoch_ms: i64,
    pub ttl_ms: Option<u64>,
}

/// Fixed-window limiter over a shared [`AtomicStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    store_timeout: Duration,
}

impl RateLimiter {
    /// `store_timeout` bounds each store round trip; it is further clipped
    /// to the caller's deadline.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
            store_timeout,
        }
    }

    fn bucket(&self, policy: &RateLimitPolicy, now_ms: i64) -> (i64, i64) {
        let window_ms = policy.window_ms();
        let bucket = now_ms.div_euclid(window_ms);
        (bucket, (bucket + 1) * window_ms)
    }

    fn counter_key(&self, policy: &RateLimitPolicy, identifier: &str, bucket: i64) -> String {
        format!(
            "{}rl:{}:{}:{}",
            self.key_prefix,
            policy.scope(),
            identifier,
            bucket
        )
    }

    /// Count this request against `identifier` and decide admission.
    ///
    /// Never fails: store errors are resolved through the policy's
    /// [`FailureMode`].
    pub async fn check(
        &self,
        policy: &RateLimitPolicy,
        identifier: &str,
        deadline: &Deadline,
    ) -> RateLimitOutcome {
        let now = self.clock.now_ms();
        let (bucket, reset_at) = self.bucket(policy, now);
        let key = self.counter_key(policy, identifier, bucket);

        let budget = deadline.child(self.store_timeout);
        let started = Instant::now();
        let result = bounded(&budget, self.store.increment_with_expiry(&key, policy.window())).await;
        metrics::record_store_latency("increment_with_expiry", started);

        match result {
            Ok(state) => {
                let decision = decide(policy, state, now, reset_at);
                if decision.allowed {
                    metrics::record_decision(policy.scope(), "allowed");
                } else {
                    tracing::warn!(
                        scope = %policy.scope(),
                        identifier = %identifier,
                        count = state.count,
                        retry_after_ms = decision.retry_after_ms,
                        "Rate limit exceeded"
                    );
                    metrics::record_decision(policy.scope(), "rejected");
                }
                RateLimitOutcome::Decided(decision)
            }
            Err(e) => {
                metrics::record_store_error("increment_with_expiry");
                match policy.failure_mode() {
                    FailureMode::Open => {
                        tracing::error!(
                            scope = %policy.scope(),
                            identifier = %identifier,
                            error = %e,
                            "Rate limit store unavailable, failing open"
                        );
                        metrics::record_decision(policy.scope(), "fail_open");
                        RateLimitOutcome::Decided(RateLimitDecision {
                            allowed: true,
                            remaining: policy.max_requests(),
                            reset_at_epoch_ms: reset_at,
                            retry_after_ms: 0,
                        })
                    }
                    FailureMode::Closed => {
                        tracing::error!(
                            scope = %policy.scope(),
                            identifier = %identifier,
                            error = %e,
                            "Rate limit store unavailable, failing closed"
                        );
                        metrics::record_decision(policy.scope(), "unavailable");
                        RateLimitOutcome::StoreUnavailable
                    }
                }
            }
        }
    }

    /// Read the current window's counter without incrementing it.
    pub async fn usage(
        &self,
        policy: &RateLimitPolicy,
        identifier: &str,
        deadline: &Deadline,
    ) -> crate::store::StoreResult<WindowUsage> {
        let now = self.clock.now_ms();
        let (bucket, reset_at) = self.bucket(policy, now);
        let key = self.counter_key(policy, identifier, bucket);
        let budget = deadline.child(self.store_timeout);

        let count = bounded(&budget, self.store.get(&key)).await?.unwrap_or(0).max(0) as u64;
        let ttl = bounded(&budget, self.store.pttl(&key)).await?;

        Ok(WindowUsage {
            count,
            remaining: policy.max_requests().saturating_sub(count),
            reset_at_epoch_ms: reset_at,
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
        })
    }
}

fn decide(policy: &RateLimitPolicy, state: CounterState, now: i64, reset_at: i64) -> RateLimitDecision {
    let count = state.count.max(0) as u64;
    let max = policy.max_requests();
    let allowed = count <= max;

    let retry_after_ms = if allowed {
        0
    } else {
        // The key outlives its bucket by up to one window, so the bucket
        // boundary caps what the store reports.
        let until_reset = (reset_at - now).max(1) as u64;
        let ttl_ms = state
            .ttl
            .map(|t| t.as_millis() as u64)
            .filter(|ms| *ms > 0)
            .unwrap_or(until_reset);
        ttl_ms.min(until_reset).clamp(1, policy.window_ms() as u64)
    };

    RateLimitDecision {
        allowed,
        remaining: max.saturating_sub(count),
        reset_at_epoch_ms: reset_at,
        retry_after_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{AtomicStore, CounterState, MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;

    // Aligned to a 60s boundary.
    const T0: i64 = 1_700_000_040_000;

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(
            store,
            Arc::new(clock.clone()),
            "test:",
            Duration::from_millis(100),
        );
        (limiter, clock)
    }

    fn policy(max: u64) -> RateLimitPolicy {
        RateLimitPolicy::new("login", Duration::from_secs(60), max, FailureMode::Closed).unwrap()
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_remaining_strictly_decreases() {
        let (limiter, _clock) = limiter();
        let policy = policy(5);

        let mut last = u64::MAX;
        for _ in 0..5 {
            let outcome = limiter.check(&policy, "1.2.3.4", &deadline()).await;
            let d = *outcome.decision().unwrap();
            assert!(d.allowed);
            assert!(d.remaining < last);
            assert_eq!(d.retry_after_ms, 0);
            last = d.remaining;
        }
        assert_eq!(last, 0);
    }

    #[tokio::test]
    async fn test_rejects_over_quota_with_bounded_retry() {
        let (limiter, clock) = limiter();
        let policy = policy(5);
        clock.advance(Duration::from_secs(10));

        for _ in 0..5 {
            assert!(limiter.check(&policy, "1.2.3.4", &deadline()).await.is_allowed());
        }
        let outcome = limiter.check(&policy, "1.2.3.4", &deadline()).await;
        let d = outcome.decision().unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.retry_after_ms > 0);
        assert!(d.retry_after_ms <= 60_000);
        assert_eq!(d.retry_after_ms, 50_000);
        assert_eq!(d.reset_at_epoch_ms, T0 + 60_000);
    }

    #[tokio::test]
    async fn test_new_window_resets() {
        let (limiter, clock) = limiter();
        let policy = policy(5);

        for _ in 0..6 {
            limiter.check(&policy, "1.2.3.4", &deadline()).await;
        }
        clock.advance(Duration::from_secs(61));

        let d = *limiter
            .check(&policy, "1.2.3.4", &deadline())
            .await
            .decision()
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 4);
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let (limiter, _clock) = limiter();
        let policy = policy(2);

        for _ in 0..3 {
            limiter.check(&policy, "a", &deadline()).await;
        }
        assert!(!limiter.check(&policy, "a", &deadline()).await.is_allowed());

        let d = *limiter.check(&policy, "b", &deadline()).await.decision().unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test]
    async fn test_usage_does_not_consume_quota() {
        let (limiter, _clock) = limiter();
        let policy = policy(5);

        limiter.check(&policy, "a", &deadline()).await;
        limiter.check(&policy, "a", &deadline()).await;

        let usage = limiter.usage(&policy, "a", &deadline()).await.unwrap();
        assert_eq!(usage.count, 2);
        assert_eq!(usage.remaining, 3);
        assert_eq!(usage.ttl_ms, Some(60_000));

        let again = limiter.usage(&policy, "a", &deadline()).await.unwrap();
        assert_eq!(again.count, 2);
    }

    #[tokio::test]
    async fn test_store_failure_follows_failure_mode() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        store.close().await.unwrap();
        let limiter = RateLimiter::new(store, Arc::new(clock), "", Duration::from_millis(50));

        let closed = policy(5);
        assert_eq!(
            limiter.check(&closed, "a", &deadline()).await,
            RateLimitOutcome::StoreUnavailable
        );

        let open = RateLimitPolicy::new("api", Duration::from_secs(60), 5, FailureMode::Open).unwrap();
        let outcome = limiter.check(&open, "a", &deadline()).await;
        let d = outcome.decision().unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);
    }

    /// Store whose every call outlives any sane budget.
    #[derive(Debug)]
    struct HangingStore;

    impl HangingStore {
        async fn hang<T>() -> StoreResult<T> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Err(StoreError::Connection("unreachable".into()))
        }
    }

    #[async_trait]
    impl AtomicStore for HangingStore {
        async fn increment(&self, _key: &str) -> StoreResult<i64> {
            Self::hang().await
        }

        async fn set_expiry_if_absent(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
            Self::hang().await
        }

        async fn get(&self, _key: &str) -> StoreResult<Option<i64>> {
            Self::hang().await
        }

        async fn pttl(&self, _key: &str) -> StoreResult<Option<Duration>> {
            Self::hang().await
        }

        async fn push_front(&self, _key: &str, _value: &str) -> StoreResult<()> {
            Self::hang().await
        }

        async fn range_list(&self, _key: &str, _start: isize, _end: isize) -> StoreResult<Vec<String>> {
            Self::hang().await
        }

        async fn trim_list(&self, _key: &str, _start: isize, _end: isize) -> StoreResult<()> {
            Self::hang().await
        }

        async fn increment_with_expiry(&self, _key: &str, _ttl: Duration) -> StoreResult<CounterState> {
            Self::hang().await
        }

        async fn push_front_bounded(
            &self,
            _key: &str,
            _value: &str,
            _max_len: usize,
            _ttl: Duration,
        ) -> StoreResult<()> {
            Self::hang().await
        }

        async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
            Self::hang().await
        }

        async fn ping(&self) -> StoreResult<()> {
            Self::hang().await
        }

        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_hits_sub_timeout_not_request_deadline() {
        let clock = ManualClock::new(T0);
        let limiter = RateLimiter::new(
            Arc::new(HangingStore),
            Arc::new(clock),
            "",
            Duration::from_millis(75),
        );
        let request_deadline = Deadline::after(Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        let closed = policy(5);
        assert_eq!(
            limiter.check(&closed, "a", &request_deadline).await,
            RateLimitOutcome::StoreUnavailable
        );
        let first = started.elapsed();
        assert!(first >= Duration::from_millis(75));
        assert!(first < Duration::from_millis(100));
        assert!(!request_deadline.is_expired());

        let open = RateLimitPolicy::new("api", Duration::from_secs(60), 5, FailureMode::Open).unwrap();
        let d = *limiter
            .check(&open, "a", &request_deadline)
            .await
            .decision()
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(request_deadline.remaining() > Duration::from_millis(800));
    }
}
