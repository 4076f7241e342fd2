//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! RateLimiter          → decisions, store latency, store errors
//! SecurityEventStore   → recorded / dropped events
//! AnomalyDetector      → emitted anomalies by type and severity
//!     ↓
//! logging.rs  (tracing events with identifier / scope fields, stdout)
//! metrics.rs  (Prometheus exporter on its own listener)
//! ```
//!
//! # Design Decisions
//! - Identifiers go into log fields, never into metric labels
//! - Without an installed recorder every metric call is a no-op

pub mod logging;
pub mod metrics;
