//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (windows and quotas > 0, timeouts ordered)
//! - Check alert thresholds fit inside event retention
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{GuardConfig, StoreBackend};

/// A single semantic problem, tagged with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than zero"));
    }

    let store = &config.store;
    if store.op_timeout_ms == 0 {
        errors.push(ValidationError::new("store.op_timeout_ms", "must be greater than zero"));
    } else if store.op_timeout() >= config.timeouts.request() {
        errors.push(ValidationError::new(
            "store.op_timeout_ms",
            "must be smaller than timeouts.request_secs",
        ));
    }
    if store.event_timeout_ms == 0 {
        errors.push(ValidationError::new("store.event_timeout_ms", "must be greater than zero"));
    }
    if store.backend == StoreBackend::Redis
        && !(store.url.starts_with("redis://") || store.url.starts_with("rediss://"))
    {
        errors.push(ValidationError::new(
            "store.url",
            "must start with redis:// or rediss://",
        ));
    }

    for (scope, policy) in config.policies.iter() {
        if policy.window_ms == 0 {
            errors.push(ValidationError::new(
                format!("policies.{scope}.window_ms"),
                "must be greater than zero",
            ));
        }
        if policy.max_requests == 0 {
            errors.push(ValidationError::new(
                format!("policies.{scope}.max_requests"),
                "must be greater than zero",
            ));
        }
    }

    if config.events.max_count == 0 {
        errors.push(ValidationError::new("events.max_count", "must be greater than zero"));
    }
    if config.events.max_age_secs == 0 {
        errors.push(ValidationError::new("events.max_age_secs", "must be greater than zero"));
    }

    let max_age_ms = config.events.max_age_secs.saturating_mul(1000);
    for (i, alert) in config.alerts.iter().enumerate() {
        if alert.count == 0 {
            errors.push(ValidationError::new(
                format!("alerts[{i}].count"),
                "must be greater than zero",
            ));
        }
        if alert.window_ms == 0 {
            errors.push(ValidationError::new(
                format!("alerts[{i}].window_ms"),
                "must be greater than zero",
            ));
        } else if alert.window_ms > max_age_ms {
            errors.push(ValidationError::new(
                format!("alerts[{i}].window_ms"),
                "exceeds events.max_age_secs",
            ));
        }
        if alert.count as usize > config.events.max_count {
            errors.push(ValidationError::new(
                format!("alerts[{i}].count"),
                "exceeds events.max_count and can never be reached",
            ));
        }
    }

    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must not be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
