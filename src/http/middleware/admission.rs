//! Axum adapter for the admission pipeline.
//!
//! Maps an axum request onto [`InboundRequest`] and collects the pipeline's
//! writes in an [`AxumResponseSink`], which is either turned into the 429/503
//! response or merged into the inner handler's response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};

use crate::resilience::Deadline;
use crate::security::{AdmissionPipeline, InboundRequest, RateLimitPolicy, ResponseSink};

/// State handed to [`admission_middleware`]: one policy per protected route group.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    pipeline: Arc<AdmissionPipeline>,
    policy: RateLimitPolicy,
    request_budget: Duration,
}

impl AdmissionState {
    pub fn new(pipeline: Arc<AdmissionPipeline>, policy: RateLimitPolicy, request_budget: Duration) -> Self {
        Self {
            pipeline,
            policy,
            request_budget,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

/// Collects status, headers and JSON body written by the pipeline.
#[derive(Debug, Default)]
pub struct AxumResponseSink {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
}

impl ResponseSink for AxumResponseSink {
    fn set_status(&mut self, status: u16) {
        self.status = StatusCode::from_u16(status).ok();
    }

    fn set_header(&mut self, name: &str, value: &str) {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::debug!(header = %name, "Dropping invalid response header"),
        }
    }

    fn write_json(&mut self, body: serde_json::Value) {
        self.body = Some(body);
    }
}

impl AxumResponseSink {
    /// Copy the collected headers onto a handler response.
    pub fn decorate(self, mut response: Response) -> Response {
        response.headers_mut().extend(self.headers);
        response
    }
}

impl IntoResponse for AxumResponseSink {
    fn into_response(self) -> Response {
        let status = self.status.unwrap_or(StatusCode::OK);
        let mut response = match self.body {
            Some(body) => (status, Json(body)).into_response(),
            None => status.into_response(),
        };
        response.headers_mut().extend(self.headers);
        response
    }
}

/// Build the port view of an axum request.
///
/// The peer address comes from `ConnectInfo` when the server was started
/// with `into_make_service_with_connect_info`.
pub fn inbound_request(request: &Request<Body>) -> InboundRequest {
    let mut inbound = InboundRequest::new(request.method().as_str(), request.uri().path());
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            inbound.append_header(name.as_str(), value);
        }
    }
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => inbound.with_remote_addr(addr.ip()),
        None => inbound,
    }
}

pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let inbound = inbound_request(&request);
    let deadline = Deadline::after(state.request_budget);
    let mut sink = AxumResponseSink::default();

    let handled = state
        .pipeline
        .with_rate_limit(&state.policy, &inbound, &deadline, &mut sink, || next.run(request))
        .await;

    match handled {
        Some(response) => sink.decorate(response),
        None => sink.into_response(),
    }
}

/// Guard every route already added to `router` with `state`'s policy.
pub fn protect<S>(router: Router<S>, state: AdmissionState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(state, admission_middleware))
}
