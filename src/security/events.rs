//! Security event recording.
//!
//! # Storage model
//! ```text
//! {prefix}events:{identifier} → list of JSON SecurityEvent, newest first
//!   write: LPUSH + LTRIM 0 max_count-1 + PEXPIRE max_age   (one MULTI)
//!   read:  LRANGE 0 max_count-1, then filter by age and type in process
//! ```
//!
//! Recording is best effort. A failed write is logged and dropped, never
//! propagated to the protected action, and there is no delivery guarantee:
//! under store pressure events are lost. The per-identifier cap bounds memory
//! no matter how many events an attacker manages to trigger.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Clock;
use crate::observability::metrics;
use crate::resilience::Deadline;
use crate::store::{bounded, AtomicStore, StoreResult};

/// Kind of monitored action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    RateLimitExceeded,
    AuthFailure,
    MfaFailure,
    CsrfViolation,
    SuspiciousRequest,
    InvalidInput,
    EmailAbuse,
}

impl SecurityEventType {
    pub const ALL: [SecurityEventType; 7] = [
        SecurityEventType::RateLimitExceeded,
        SecurityEventType::AuthFailure,
        SecurityEventType::MfaFailure,
        SecurityEventType::CsrfViolation,
        SecurityEventType::SuspiciousRequest,
        SecurityEventType::InvalidInput,
        SecurityEventType::EmailAbuse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::AuthFailure => "auth_failure",
            SecurityEventType::MfaFailure => "mfa_failure",
            SecurityEventType::CsrfViolation => "csrf_violation",
            SecurityEventType::SuspiciousRequest => "suspicious_request",
            SecurityEventType::InvalidInput => "invalid_input",
            SecurityEventType::EmailAbuse => "email_abuse",
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown security event type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monitored action. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub timestamp_ms: i64,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        identifier: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            event_type,
            severity,
            timestamp_ms,
            identifier: identifier.into(),
            endpoint: None,
            details: None,
            metadata: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Retention bounds applied per identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_count: usize,
    pub max_age: Duration,
}

/// Append-only, per-identifier event log over an [`AtomicStore`].
#[derive(Debug, Clone)]
pub struct SecurityEventStore {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    retention: Retention,
    store_timeout: Duration,
}

impl SecurityEventStore {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        retention: Retention,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
            retention,
            store_timeout,
        }
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn list_key(&self, identifier: &str) -> String {
        format!("{}events:{}", self.key_prefix, identifier)
    }

    /// Append `event` to its identifier's log.
    ///
    /// Returns whether the write reached the store. Failures are logged and
    /// swallowed.
    pub async fn record(&self, event: &SecurityEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize security event");
                return false;
            }
        };

        let key = self.list_key(&event.identifier);
        let deadline = Deadline::after(self.store_timeout);
        let started = Instant::now();
        let result = bounded(
            &deadline,
            self.store.push_front_bounded(
                &key,
                &payload,
                self.retention.max_count,
                self.retention.max_age,
            ),
        )
        .await;
        metrics::record_store_latency("push_front_bounded", started);

        match result {
            Ok(()) => {
                tracing::debug!(
                    identifier = %event.identifier,
                    event_type = %event.event_type,
                    severity = %event.severity,
                    "Security event recorded"
                );
                metrics::record_security_event(event.event_type.as_str());
                true
            }
            Err(e) => {
                tracing::warn!(
                    identifier = %event.identifier,
                    event_type = %event.event_type,
                    error = %e,
                    "Dropping security event, store write failed"
                );
                metrics::record_store_error("push_front_bounded");
                metrics::record_security_event_dropped(event.event_type.as_str());
                false
            }
        }
    }

    /// Events for `identifier` younger than `window`, newest first,
    /// optionally restricted to one type.
    pub async fn query(
        &self,
        identifier: &str,
        event_type: Option<SecurityEventType>,
        window: Duration,
    ) -> StoreResult<Vec<SecurityEvent>> {
        let window_ms = window.min(self.retention.max_age).as_millis() as i64;
        let now = self.clock.now_ms();

        let events = self
            .load(identifier)
            .await?
            .into_iter()
            .filter(|e| now - e.timestamp_ms < window_ms)
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .collect();
        Ok(events)
    }

    /// Up to `limit` retained events for `identifier`, newest first.
    pub async fn recent(&self, identifier: &str, limit: usize) -> StoreResult<Vec<SecurityEvent>> {
        let mut events = self.query(identifier, None, self.retention.max_age).await?;
        events.truncate(limit);
        Ok(events)
    }

    async fn load(&self, identifier: &str) -> StoreResult<Vec<SecurityEvent>> {
        let key = self.list_key(identifier);
        let deadline = Deadline::after(self.store_timeout);
        let end = self.retention.max_count as isize - 1;

        let raw = bounded(&deadline, self.store.range_list(&key, 0, end)).await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str::<SecurityEvent>(entry) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(identifier = %identifier, error = %e, "Skipping undecodable security event");
                    None
                }
            })
            .collect())
    }
}
