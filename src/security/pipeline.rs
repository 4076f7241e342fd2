//! Admission pipeline (`with_rate_limit`).
//!
//! # Data Flow
//! ```text
//! InboundRequest
//!     → policy.identify()            (x-forwarded-for / x-real-ip / peer)
//!     → RateLimiter::check()
//!         allowed      → handler, response annotated with X-RateLimit-*
//!         rejected     → 429 + Retry-After, spawn record + evaluate
//!         unavailable  → 503
//! ```
//!
//! The pipeline only talks to the outside world through [`InboundRequest`]
//! and [`ResponseSink`]; framework adapters live in `http::middleware`.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::resilience::Deadline;
use crate::security::anomaly::AnomalyDetector;
use crate::security::events::{SecurityEvent, SecurityEventType, Severity};
use crate::security::identifier::InboundRequest;
use crate::security::policy::RateLimitPolicy;
use crate::security::rate_limit::{RateLimitDecision, RateLimitOutcome, RateLimiter};

pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests";
pub const UNAVAILABLE_MESSAGE: &str = "Service temporarily unavailable";

pub const HEADER_RETRY_AFTER: &str = "retry-after";
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Outbound response port.
pub trait ResponseSink {
    fn set_status(&mut self, status: u16);
    fn set_header(&mut self, name: &str, value: &str);
    fn write_json(&mut self, body: serde_json::Value);
}

/// What the pipeline decided for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    Proceed(RateLimitDecision),
    Rejected(RateLimitDecision),
    Unavailable,
}

/// Composes the limiter, event recorder and anomaly detector around a handler.
#[derive(Debug, Clone)]
pub struct AdmissionPipeline {
    limiter: RateLimiter,
    detector: Arc<AnomalyDetector>,
}

impl AdmissionPipeline {
    pub fn new(limiter: RateLimiter, detector: Arc<AnomalyDetector>) -> Self {
        Self { limiter, detector }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    /// Decide admission without touching any response.
    ///
    /// A rejection schedules the `rate_limit_exceeded` event before returning.
    pub async fn admit(
        &self,
        policy: &RateLimitPolicy,
        request: &InboundRequest,
        deadline: &Deadline,
    ) -> Admission {
        let identifier = policy.identify(request);

        match self.limiter.check(policy, &identifier, deadline).await {
            RateLimitOutcome::Decided(decision) if decision.allowed => Admission::Proceed(decision),
            RateLimitOutcome::Decided(decision) => {
                self.report_rejection(policy, request, identifier, &decision);
                Admission::Rejected(decision)
            }
            RateLimitOutcome::StoreUnavailable => Admission::Unavailable,
        }
    }

    /// Run `handler` if `policy` admits `request`, otherwise write a 429 or
    /// 503 to `res` and return `None`.
    ///
    /// On the success path the handler's output is returned untouched; only
    /// rate-limit headers are set on `res`.
    pub async fn with_rate_limit<S, F, Fut, T>(
        &self,
        policy: &RateLimitPolicy,
        request: &InboundRequest,
        deadline: &Deadline,
        res: &mut S,
        handler: F,
    ) -> Option<T>
    where
        S: ResponseSink,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.admit(policy, request, deadline).await {
            Admission::Proceed(decision) => {
                write_limit_headers(res, policy, &decision);
                Some(handler().await)
            }
            Admission::Rejected(decision) => {
                write_limit_headers(res, policy, &decision);
                res.set_status(429);
                res.set_header(HEADER_RETRY_AFTER, &retry_after_secs(decision.retry_after_ms).to_string());
                res.write_json(error_body(TOO_MANY_REQUESTS_MESSAGE));
                None
            }
            Admission::Unavailable => {
                res.set_status(503);
                res.write_json(error_body(UNAVAILABLE_MESSAGE));
                None
            }
        }
    }

    /// Record the rejection and evaluate it, detached from the response.
    ///
    /// The spawned task is not tied to the request, so a client disconnect
    /// does not cancel the write.
    fn report_rejection(
        &self,
        policy: &RateLimitPolicy,
        request: &InboundRequest,
        identifier: String,
        decision: &RateLimitDecision,
    ) {
        let now = self.detector.events().clock().now_ms();
        let event = SecurityEvent::new(
            SecurityEventType::RateLimitExceeded,
            Severity::Medium,
            identifier,
            now,
        )
        .with_endpoint(policy.scope())
        .with_detail("limit", policy.max_requests())
        .with_detail("windowMs", policy.window_ms())
        .with_detail("retryAfterMs", decision.retry_after_ms)
        .with_metadata("method", request.method.clone())
        .with_metadata("path", request.path.clone());

        let detector = self.detector.clone();
        tokio::spawn(async move {
            detector.observe(event).await;
        });
    }
}

/// `Retry-After` seconds, rounded up and at least 1.
pub fn retry_after_secs(retry_after_ms: u64) -> u64 {
    retry_after_ms.div_ceil(1000).max(1)
}

pub fn error_body(message: &str) -> serde_json::Value {
    json!({ "error": { "message": message } })
}

fn write_limit_headers<S: ResponseSink>(res: &mut S, policy: &RateLimitPolicy, decision: &RateLimitDecision) {
    res.set_header(HEADER_LIMIT, &policy.max_requests().to_string());
    res.set_header(HEADER_REMAINING, &decision.remaining.to_string());
    let reset_secs = (decision.reset_at_epoch_ms.max(0) as u64).div_ceil(1000);
    res.set_header(HEADER_RESET, &reset_secs.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::security::events::{Retention, SecurityEventStore};
    use crate::security::policy::FailureMode;
    use crate::store::{AtomicStore, MemoryStore};

    #[derive(Default)]
    struct RecordingSink {
        status: Option<u16>,
        headers: HashMap<String, String>,
        body: Option<serde_json::Value>,
    }

    impl ResponseSink for RecordingSink {
        fn set_status(&mut self, status: u16) {
            self.status = Some(status);
        }

        fn set_header(&mut self, name: &str, value: &str) {
            self.headers.insert(name.to_string(), value.to_string());
        }

        fn write_json(&mut self, body: serde_json::Value) {
            self.body = Some(body);
        }
    }

    fn pipeline(store: Arc<MemoryStore>, clock: ManualClock) -> AdmissionPipeline {
        let limiter = RateLimiter::new(
            store.clone(),
            Arc::new(clock.clone()),
            "",
            Duration::from_millis(100),
        );
        let events = Arc::new(SecurityEventStore::new(
            store.clone(),
            Arc::new(clock),
            "",
            Retention {
                max_count: 100,
                max_age: Duration::from_secs(3600),
            },
            Duration::from_millis(100),
        ));
        let detector = Arc::new(AnomalyDetector::new(
            events,
            store,
            Vec::new(),
            "",
            Duration::from_millis(100),
        ));
        AdmissionPipeline::new(limiter, detector)
    }

    fn request() -> InboundRequest {
        InboundRequest::new("POST", "/login").with_header("x-forwarded-for", "1.2.3.4")
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(1), 1);
        assert_eq!(retry_after_secs(1000), 1);
        assert_eq!(retry_after_secs(1001), 2);
        assert_eq!(retry_after_secs(0), 1);
    }

    #[tokio::test]
    async fn test_pass_through_then_429() {
        let clock = ManualClock::new(1_700_000_040_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let pipeline = pipeline(store, clock);
        let policy =
            RateLimitPolicy::new("login", Duration::from_secs(60), 1, FailureMode::Closed).unwrap();
        let deadline = Deadline::after(Duration::from_secs(1));

        let mut res = RecordingSink::default();
        let out = pipeline
            .with_rate_limit(&policy, &request(), &deadline, &mut res, || async { "handled" })
            .await;
        assert_eq!(out, Some("handled"));
        assert_eq!(res.status, None);
        assert_eq!(res.headers[HEADER_REMAINING], "0");

        let mut res = RecordingSink::default();
        let out = pipeline
            .with_rate_limit(&policy, &request(), &deadline, &mut res, || async { "handled" })
            .await;
        assert_eq!(out, None);
        assert_eq!(res.status, Some(429));
        assert_eq!(res.headers[HEADER_RETRY_AFTER], "60");
        assert_eq!(res.body, Some(error_body(TOO_MANY_REQUESTS_MESSAGE)));
    }

    #[tokio::test]
    async fn test_closed_policy_store_down_is_503() {
        let clock = ManualClock::new(1_700_000_040_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        store.close().await.unwrap();
        let pipeline = pipeline(store, clock);
        let policy =
            RateLimitPolicy::new("email", Duration::from_secs(60), 5, FailureMode::Closed).unwrap();

        let mut res = RecordingSink::default();
        let called = AtomicBool::new(false);
        let flag = &called;
        let out = pipeline
            .with_rate_limit(
                &policy,
                &request(),
                &Deadline::after(Duration::from_secs(1)),
                &mut res,
                || async move {
                    flag.store(true, Ordering::SeqCst);
                },
            )
            .await;
        assert!(out.is_none());
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(res.status, Some(503));
        assert_eq!(res.body, Some(error_body(UNAVAILABLE_MESSAGE)));
    }
}
