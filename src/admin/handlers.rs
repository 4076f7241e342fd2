use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::http::server::AppState;
use crate::resilience::Deadline;
use crate::security::{FailureMode, SecurityEventType};

const ADMIN_BUDGET: Duration = Duration::from_secs(2);

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub store: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    pub scope: String,
    pub window_ms: i64,
    pub max_requests: u64,
    pub failure_mode: FailureMode,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub window_secs: Option<u64>,
    pub limit: Option<usize>,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": { "message": message.into() } }))).into_response()
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let deadline = Deadline::after(ADMIN_BUDGET);
    let (status, store) = match crate::store::bounded(&deadline, state.store.ping()).await {
        Ok(()) => ("operational", "ok".to_string()),
        Err(e) => ("degraded", e.to_string()),
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        store,
    })
}

pub async fn get_policies(State(state): State<AppState>) -> Json<Vec<PolicyView>> {
    Json(
        state
            .policies
            .iter()
            .map(|p| PolicyView {
                scope: p.scope().to_string(),
                window_ms: p.window_ms(),
                max_requests: p.max_requests(),
                failure_mode: p.failure_mode(),
            })
            .collect(),
    )
}

pub async fn get_events(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let event_type = match query.event_type.as_deref().map(str::parse::<SecurityEventType>) {
        None => None,
        Some(Ok(t)) => Some(t),
        Some(Err(e)) => return error(StatusCode::BAD_REQUEST, e),
    };

    let events = state.pipeline.detector().events();
    let limit = query.limit.unwrap_or(events.retention().max_count);
    let result = match (event_type, query.window_secs) {
        (None, None) => events.recent(&identifier, limit).await,
        (event_type, window_secs) => {
            let window = window_secs
                .map(Duration::from_secs)
                .unwrap_or(events.retention().max_age);
            events.query(&identifier, event_type, window).await.map(|mut found| {
                found.truncate(limit);
                found
            })
        }
    };

    match result {
        Ok(found) => Json(found).into_response(),
        Err(e) => {
            tracing::warn!(identifier = %identifier, error = %e, "Admin event query failed");
            error(StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable")
        }
    }
}

pub async fn get_usage(
    State(state): State<AppState>,
    Path((scope, identifier)): Path<(String, String)>,
) -> Response {
    let Some(policy) = state.policies.iter().find(|p| p.scope() == scope) else {
        return error(StatusCode::NOT_FOUND, format!("unknown scope '{scope}'"));
    };

    let deadline = Deadline::after(ADMIN_BUDGET);
    match state.pipeline.limiter().usage(policy, &identifier, &deadline).await {
        Ok(usage) => Json(usage).into_response(),
        Err(e) => {
            tracing::warn!(scope = %scope, identifier = %identifier, error = %e, "Admin usage read failed");
            error(StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable")
        }
    }
}
