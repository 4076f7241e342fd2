//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → identifier.rs (resolve client identity)
//!     → policy.rs (scope, window, budget, failure mode)
//!     → rate_limit.rs (fixed-window counter in the shared store)
//!     → pipeline.rs (admit / 429 / 503)
//!
//! On rejection (detached):
//!     → events.rs (append to per-identifier log)
//!     → anomaly.rs (threshold evaluation, deduplicated alerts)
//! ```
//!
//! # Design Decisions
//! - All counters live in the shared store so every instance sees one budget
//! - Failure mode is per policy: sensitive scopes fail closed
//! - Event recording never affects the response already sent

pub mod anomaly;
pub mod events;
pub mod identifier;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;

pub use anomaly::{AlertThreshold, AnomalyDetector, AnomalyResult};
pub use events::{Retention, SecurityEvent, SecurityEventStore, SecurityEventType, Severity};
pub use identifier::{resolve_identifier, InboundRequest, UNKNOWN_IDENTIFIER};
pub use pipeline::{Admission, AdmissionPipeline, ResponseSink};
pub use policy::{FailureMode, PolicyError, PolicySet, RateLimitPolicy};
pub use rate_limit::{RateLimitDecision, RateLimitOutcome, RateLimiter, WindowUsage};
