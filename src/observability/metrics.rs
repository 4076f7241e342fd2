//! Metrics collection and exposition.
//!
//! # Metrics
//! - `guard_decisions_total` (counter): admission outcomes by scope
//! - `guard_store_errors_total` (counter): failed store operations by op
//! - `guard_store_latency_seconds` (histogram): store round trip by op
//! - `guard_security_events_total` (counter): recorded events by type
//! - `guard_security_events_dropped_total` (counter): events lost on write
//! - `guard_anomalies_total` (counter): emitted anomalies by type, severity
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup
//! - The Prometheus exporter runs its own listener

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and start its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_decision(scope: &str, outcome: &'static str) {
    counter!(
        "guard_decisions_total",
        "scope" => scope.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_store_error(op: &'static str) {
    counter!("guard_store_errors_total", "op" => op).increment(1);
}

pub fn record_store_latency(op: &'static str, started: Instant) {
    histogram!("guard_store_latency_seconds", "op" => op).record(started.elapsed().as_secs_f64());
}

pub fn record_security_event(event_type: &'static str) {
    counter!("guard_security_events_total", "type" => event_type).increment(1);
}

pub fn record_security_event_dropped(event_type: &'static str) {
    counter!("guard_security_events_dropped_total", "type" => event_type).increment(1);
}

pub fn record_anomaly(event_type: &'static str, severity: &'static str) {
    counter!(
        "guard_anomalies_total",
        "type" => event_type,
        "severity" => severity
    )
    .increment(1);
}
