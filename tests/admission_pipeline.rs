//! End-to-end admission behaviour through the axum router.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abuse_guard::clock::ManualClock;
use abuse_guard::http::middleware::{protect, AdmissionState};
use abuse_guard::security::{
    AlertThreshold, AnomalyDetector, Retention, SecurityEvent, SecurityEventStore,
    SecurityEventType, Severity,
};
use abuse_guard::store::{AtomicStore, MemoryStore};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tower::ServiceExt;

mod common;
use common::*;

#[tokio::test]
async fn test_login_window_exhaustion_and_reset() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let app = router(app_state(test_config(), store, clock.clone()));

    let mut last_remaining = u64::MAX;
    for i in 0..5 {
        let res = app.clone().oneshot(post_from("/auth/login", "1.2.3.4")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK, "request {} should pass", i + 1);
        assert_eq!(header(&res, "x-ratelimit-limit"), "5");

        let remaining: u64 = header(&res, "x-ratelimit-remaining").parse().unwrap();
        assert!(remaining < last_remaining);
        last_remaining = remaining;
    }
    assert_eq!(last_remaining, 0);

    let res = app.clone().oneshot(post_from("/auth/login", "1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = header(&res, "retry-after").parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(
        body_json(res).await,
        serde_json::json!({"error": {"message": "Too many requests"}})
    );

    clock.advance(Duration::from_secs(61));

    let res = app.clone().oneshot(post_from("/auth/login", "1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "x-ratelimit-remaining"), "4");
}

#[tokio::test]
async fn test_identifiers_are_isolated() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let app = router(app_state(test_config(), store, clock));

    for _ in 0..6 {
        let _ = app.clone().oneshot(post_from("/auth/login", "1.1.1.1")).await.unwrap();
    }
    let blocked = app.clone().oneshot(post_from("/auth/login", "1.1.1.1")).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = app.clone().oneshot(post_from("/auth/login", "2.2.2.2")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(header(&other, "x-ratelimit-remaining"), "4");
}

#[tokio::test]
async fn test_scopes_do_not_share_counters() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let app = router(app_state(test_config(), store, clock));

    for _ in 0..5 {
        let _ = app.clone().oneshot(post_from("/auth/login", "1.1.1.1")).await.unwrap();
    }
    let res = app.clone().oneshot(post_from("/email/send", "1.1.1.1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "x-ratelimit-remaining"), "9");
}

#[tokio::test]
async fn test_closed_policy_store_failure_skips_handler() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(FlakyStore::new(clock.clone()));
    store.fail_on_call(3);
    let state = app_state(test_config(), store.clone(), clock);

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    let app: Router = protect(
        Router::new().route(
            "/checkout",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }
            }),
        ),
        AdmissionState::new(
            state.pipeline.clone(),
            state.policies.login.clone(),
            Duration::from_secs(5),
        ),
    );

    for _ in 0..2 {
        let res = app.clone().oneshot(post_from("/checkout", "1.2.3.4")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 2);

    let res = app.clone().oneshot(post_from("/checkout", "1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(res).await,
        serde_json::json!({"error": {"message": "Service temporarily unavailable"}})
    );
    assert_eq!(invoked.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_open_policy_admits_when_store_down() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(FlakyStore::new(clock.clone()));
    store.set_down(true);
    let app = router(app_state(test_config(), store, clock));

    let res = app
        .clone()
        .oneshot(
            axum::http::Request::get("/api/orders")
                .header("x-real-ip", "5.5.5.5")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "x-ratelimit-remaining"), "100");

    let res = app.clone().oneshot(post_from("/auth/login", "5.5.5.5")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_rejections_are_recorded_and_alerted() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let state = app_state(test_config(), store.clone(), clock);
    let app = router(state.clone());

    // 5 admitted, 5 rejected: crosses the default 5-per-minute threshold.
    for _ in 0..10 {
        let _ = app.clone().oneshot(post_from("/auth/login", "6.6.6.6")).await.unwrap();
    }

    let events = state.pipeline.detector().events().clone();
    let recorded = eventually(|| {
        let events = events.clone();
        async move {
            events
                .query("6.6.6.6", Some(SecurityEventType::RateLimitExceeded), Duration::from_secs(60))
                .await
                .map(|found| found.len() == 5)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(recorded, "five rate_limit_exceeded events expected");

    let found = events
        .query("6.6.6.6", None, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(found.iter().all(|e| e.endpoint.as_deref() == Some("login")));

    let marker = "alert:6.6.6.6:rate_limit_exceeded:5:60000";
    let alerted = eventually(|| {
        let store = store.clone();
        async move { matches!(store.pttl(marker).await, Ok(Some(_))) }
    })
    .await;
    assert!(alerted, "anomaly marker should have been claimed");
}

#[tokio::test]
async fn test_failed_marker_claim_keeps_earlier_alert() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let events = Arc::new(SecurityEventStore::new(
        store.clone(),
        Arc::new(clock.clone()),
        "",
        Retention {
            max_count: 100,
            max_age: Duration::from_secs(600),
        },
        Duration::from_secs(1),
    ));
    let detector = AnomalyDetector::new(
        events,
        store.clone(),
        vec![
            AlertThreshold::new(
                SecurityEventType::AuthFailure,
                1,
                Duration::from_secs(60),
                Severity::Critical,
            ),
            AlertThreshold::new(
                SecurityEventType::AuthFailure,
                1,
                Duration::from_secs(30),
                Severity::Low,
            ),
        ],
        "",
        Duration::from_secs(1),
    );

    // 1: record, 2: load, 3: claim critical, 4: claim low.
    store.fail_on_call(4);
    let event = SecurityEvent::new(SecurityEventType::AuthFailure, Severity::Low, "7.7.7.7", T0);
    let first = detector.observe(event).await.expect("critical claim succeeded");
    assert_eq!(first.severity, Severity::Critical);
    assert_eq!(store.calls(), 4);

    assert!(matches!(
        store.pttl("alert:7.7.7.7:auth_failure:1:60000").await,
        Ok(Some(_))
    ));
}
