//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::security::anomaly::AlertThreshold;
use crate::security::events::{Retention, SecurityEventType, Severity};
use crate::security::policy::FailureMode;

/// Root configuration for the guard service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Shared store backend.
    pub store: StoreConfig,

    /// Rate-limit policies per endpoint category.
    pub policies: PoliciesConfig,

    /// Security event retention.
    pub events: EventsConfig,

    /// Anomaly alert thresholds.
    pub alerts: Vec<AlertThreshold>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            timeouts: TimeoutConfig::default(),
            store: StoreConfig::default(),
            policies: PoliciesConfig::default(),
            events: EventsConfig::default(),
            alerts: default_alerts(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Overall request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store. Only correct for a single instance.
    Memory,
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Redis connection URL (redis backend only).
    pub url: String,

    /// Prefix prepended to every key.
    pub key_prefix: String,

    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Sub-timeout for the limiter's round trip, in milliseconds.
    pub op_timeout_ms: u64,

    /// Timeout for detached event writes and anomaly evaluation.
    pub event_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: "guard:".to_string(),
            connect_timeout_ms: 5_000,
            op_timeout_ms: 75,
            event_timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One rate-limit policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Window length in milliseconds.
    pub window_ms: u64,

    /// Requests admitted per identifier per window.
    pub max_requests: u64,

    /// Behaviour when the store is unreachable.
    pub failure_mode: FailureMode,
}

/// Policies per endpoint category.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoliciesConfig {
    pub login: PolicyConfig,
    pub email: PolicyConfig,
    pub api: PolicyConfig,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            login: PolicyConfig {
                window_ms: 15 * 60 * 1000,
                max_requests: 5,
                failure_mode: FailureMode::Closed,
            },
            email: PolicyConfig {
                window_ms: 60 * 60 * 1000,
                max_requests: 10,
                failure_mode: FailureMode::Closed,
            },
            api: PolicyConfig {
                window_ms: 60 * 1000,
                max_requests: 100,
                failure_mode: FailureMode::Open,
            },
        }
    }
}

impl PoliciesConfig {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &PolicyConfig)> {
        [("login", &self.login), ("email", &self.email), ("api", &self.api)].into_iter()
    }
}

/// Security event retention.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events kept per identifier.
    pub max_count: usize,

    /// Maximum event age in seconds.
    pub max_age_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_count: 1_000,
            max_age_secs: 24 * 60 * 60,
        }
    }
}

impl EventsConfig {
    pub fn retention(&self) -> Retention {
        Retention {
            max_count: self.max_count,
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }
}

/// Thresholds used when the config file has no `[[alerts]]` table.
pub fn default_alerts() -> Vec<AlertThreshold> {
    use SecurityEventType::*;

    vec![
        AlertThreshold::new(RateLimitExceeded, 5, Duration::from_secs(60), Severity::High),
        AlertThreshold::new(RateLimitExceeded, 20, Duration::from_secs(300), Severity::Critical),
        AlertThreshold::new(AuthFailure, 5, Duration::from_secs(300), Severity::High),
        AlertThreshold::new(MfaFailure, 3, Duration::from_secs(300), Severity::High),
        AlertThreshold::new(CsrfViolation, 3, Duration::from_secs(60), Severity::Medium),
        AlertThreshold::new(SuspiciousRequest, 10, Duration::from_secs(60), Severity::Medium),
    ]
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
