//! Threshold-based anomaly detection over recorded security events.
//!
//! # Algorithm
//! ```text
//! after record(event):
//!     for each threshold with threshold.event_type == event.type:
//!         n = |events(identifier, type) younger than threshold.window|
//!         n >= threshold.count  → candidate
//!     order candidates by (severity desc, count desc)
//!     claim marker {prefix}alert:{id}:{type}:{count}:{window_ms} (SET NX PX window)
//!     return the first candidate whose marker this call created
//! ```
//!
//! The marker lives exactly one threshold window, so a sustained attack
//! yields one alert per window instead of one per event. Claiming is a single
//! atomic store operation; two instances evaluating the same crossing cannot
//! both emit.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observability::metrics;
use crate::resilience::Deadline;
use crate::security::events::{SecurityEvent, SecurityEventStore, SecurityEventType, Severity};
use crate::store::{bounded, AtomicStore, StoreResult};

/// Rule defining when repeated events constitute an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub event_type: SecurityEventType,
    pub count: u64,
    pub window_ms: u64,
    pub severity: Severity,
}

impl AlertThreshold {
    pub fn new(event_type: SecurityEventType, count: u64, window: Duration, severity: Severity) -> Self {
        Self {
            event_type,
            count,
            window_ms: window.as_millis() as u64,
            severity,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// A threshold crossing. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyResult {
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub identifier: String,
    pub evidence_count: u64,
    pub window_ms: u64,
    pub detected_at_ms: i64,
}

/// Evaluates an identifier's recent events against configured thresholds.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    events: Arc<SecurityEventStore>,
    store: Arc<dyn AtomicStore>,
    thresholds: Vec<AlertThreshold>,
    key_prefix: String,
    store_timeout: Duration,
}

impl AnomalyDetector {
    pub fn new(
        events: Arc<SecurityEventStore>,
        store: Arc<dyn AtomicStore>,
        thresholds: Vec<AlertThreshold>,
        key_prefix: impl Into<String>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            events,
            store,
            thresholds,
            key_prefix: key_prefix.into(),
            store_timeout,
        }
    }

    pub fn thresholds(&self) -> &[AlertThreshold] {
        &self.thresholds
    }

    pub fn events(&self) -> &Arc<SecurityEventStore> {
        &self.events
    }

    fn marker_key(&self, identifier: &str, threshold: &AlertThreshold) -> String {
        format!(
            "{}alert:{}:{}:{}:{}",
            self.key_prefix, identifier, threshold.event_type, threshold.count, threshold.window_ms
        )
    }

    /// Record `event`, then evaluate it if the write succeeded.
    pub async fn observe(&self, event: SecurityEvent) -> Option<AnomalyResult> {
        if !self.events.record(&event).await {
            return None;
        }
        self.evaluate(&event.identifier, event.event_type).await
    }

    /// Return a fresh anomaly for `(identifier, event_type)`, if any.
    ///
    /// Failing to load events is logged and reported as no anomaly. A failed
    /// marker claim only skips that threshold.
    pub async fn evaluate(
        &self,
        identifier: &str,
        event_type: SecurityEventType,
    ) -> Option<AnomalyResult> {
        match self.try_evaluate(identifier, event_type).await {
            Ok(result) => {
                if let Some(anomaly) = &result {
                    emit(anomaly);
                }
                result
            }
            Err(e) => {
                tracing::warn!(
                    identifier = %identifier,
                    event_type = %event_type,
                    error = %e,
                    "Anomaly evaluation failed"
                );
                None
            }
        }
    }

    async fn try_evaluate(
        &self,
        identifier: &str,
        event_type: SecurityEventType,
    ) -> StoreResult<Option<AnomalyResult>> {
        let matching: Vec<&AlertThreshold> = self
            .thresholds
            .iter()
            .filter(|t| t.event_type == event_type)
            .collect();
        let Some(widest) = matching.iter().map(|t| t.window_ms).max() else {
            return Ok(None);
        };

        let events = self
            .events
            .query(identifier, Some(event_type), Duration::from_millis(widest))
            .await?;
        let now = self.events.clock().now_ms();

        let mut candidates: Vec<(&AlertThreshold, u64)> = matching
            .into_iter()
            .filter_map(|t| {
                let n = events
                    .iter()
                    .filter(|e| now - e.timestamp_ms < t.window_ms as i64)
                    .count() as u64;
                (n >= t.count).then_some((t, n))
            })
            .collect();
        candidates.sort_by(|(a, _), (b, _)| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.count.cmp(&a.count))
        });

        // Claim every crossed marker so lower thresholds do not fire later
        // for the same burst. A failed claim never discards a marker this
        // call already owns.
        let deadline = Deadline::after(self.store_timeout);
        let mut winner = None;
        for (threshold, evidence) in candidates {
            let key = self.marker_key(identifier, threshold);
            let fresh = match bounded(&deadline, self.store.set_if_absent(&key, threshold.window())).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::warn!(
                        identifier = %identifier,
                        event_type = %event_type,
                        threshold_count = threshold.count,
                        window_ms = threshold.window_ms,
                        error = %e,
                        "Anomaly marker claim failed"
                    );
                    metrics::record_store_error("set_if_absent");
                    continue;
                }
            };
            if fresh && winner.is_none() {
                winner = Some(AnomalyResult {
                    event_type,
                    severity: threshold.severity,
                    identifier: identifier.to_string(),
                    evidence_count: evidence,
                    window_ms: threshold.window_ms,
                    detected_at_ms: now,
                });
            }
        }
        Ok(winner)
    }
}

fn emit(anomaly: &AnomalyResult) {
    metrics::record_anomaly(anomaly.event_type.as_str(), anomaly.severity.as_str());
    if anomaly.severity == Severity::Critical {
        tracing::error!(
            identifier = %anomaly.identifier,
            event_type = %anomaly.event_type,
            severity = %anomaly.severity,
            evidence = anomaly.evidence_count,
            window_ms = anomaly.window_ms,
            "Security anomaly detected"
        );
    } else {
        tracing::warn!(
            identifier = %anomaly.identifier,
            event_type = %anomaly.event_type,
            severity = %anomaly.severity,
            evidence = anomaly.evidence_count,
            window_ms = anomaly.window_ms,
            "Security anomaly detected"
        );
    }
}
