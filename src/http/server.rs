//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the shared guard state (limiter, event store, detector)
//! - Create the Axum Router with one admission policy per route group
//! - Wire up middleware (tracing, timeout, request ID)
//! - Serve until shutdown, then close the store

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{HeaderName, Method, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::http::middleware::{protect, AdmissionState};
use crate::security::{
    AdmissionPipeline, AnomalyDetector, PolicyError, PolicySet, RateLimiter, SecurityEventStore,
};
use crate::store::AtomicStore;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Application state shared by the public and admin routers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<GuardConfig>,
    pub store: Arc<dyn AtomicStore>,
    pub policies: Arc<PolicySet>,
    pub pipeline: Arc<AdmissionPipeline>,
}

impl AppState {
    /// Register the configured policies and wire the core components onto `store`.
    ///
    /// # Errors
    /// Returns [`PolicyError`] if any configured policy is invalid.
    pub fn new(
        config: GuardConfig,
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PolicyError> {
        let policies = PolicySet::from_config(&config.policies)?;
        let prefix = config.store.key_prefix.clone();

        let limiter = RateLimiter::new(
            store.clone(),
            clock.clone(),
            prefix.clone(),
            config.store.op_timeout(),
        );
        let events = Arc::new(SecurityEventStore::new(
            store.clone(),
            clock,
            prefix.clone(),
            config.events.retention(),
            config.store.event_timeout(),
        ));
        let detector = Arc::new(AnomalyDetector::new(
            events,
            store.clone(),
            config.alerts.clone(),
            prefix,
            config.store.event_timeout(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            policies: Arc::new(policies),
            pipeline: Arc::new(AdmissionPipeline::new(limiter, detector)),
        })
    }

    fn admission(&self, policy: &crate::security::RateLimitPolicy) -> AdmissionState {
        AdmissionState::new(
            self.pipeline.clone(),
            policy.clone(),
            self.config.timeouts.request(),
        )
    }
}

/// HTTP server for the guarded endpoints.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        let router = Self::build_router(&state);
        Self { router, state }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: &AppState) -> Router {
        let login = protect(
            Router::new()
                .route("/auth/login", post(login_handler))
                .route("/auth/mfa", post(login_handler)),
            state.admission(&state.policies.login),
        );
        let email = protect(
            Router::new().route("/email/send", post(email_handler)),
            state.admission(&state.policies.email),
        );
        let api = protect(
            Router::new().route("/api/{*path}", any(api_handler)),
            state.admission(&state.policies.api),
        );

        let request_id = HeaderName::from_static(X_REQUEST_ID);

        Router::new()
            .route("/health", get(health_handler))
            .merge(login)
            .merge(email)
            .merge(api)
            .layer(TimeoutLayer::new(state.config.timeouts.request()))
            .layer(PropagateRequestIdLayer::new(request_id.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the server until `shutdown` fires and in-flight requests drain.
    ///
    /// The store stays open: the admin listener and detached event writes
    /// may still be using it. Closing it is the caller's job once every
    /// task holding it has stopped.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// Stand-ins for the protected business handlers.

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn login_handler() -> impl IntoResponse {
    Json(json!({ "scope": "login", "status": "accepted" }))
}

async fn email_handler() -> impl IntoResponse {
    Json(json!({ "scope": "email", "status": "queued" }))
}

async fn api_handler(method: Method) -> impl IntoResponse {
    Json(json!({ "scope": "api", "method": method.as_str() }))
}
