//! Rate-limit policies.
//!
//! A policy is registered once per endpoint category and never mutated.
//! Construction validates the window and quota so a bad policy fails at
//! startup instead of on the first request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::schema::{PoliciesConfig, PolicyConfig};
use crate::security::identifier::{resolve_identifier, InboundRequest};

/// Behaviour when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request; abuse protection is best effort.
    Open,
    /// Reject with 503.
    Closed,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureMode::Open => f.write_str("open"),
            FailureMode::Closed => f.write_str("closed"),
        }
    }
}

/// Invalid policy configuration. Fatal at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("policy scope must not be empty")]
    EmptyScope,

    #[error("policy '{0}': window must be greater than zero")]
    ZeroWindow(String),

    #[error("policy '{0}': max_requests must be greater than zero")]
    ZeroMaxRequests(String),
}

/// Maps a request to the identifier its counter is keyed on.
pub type KeyFn = Arc<dyn Fn(&InboundRequest) -> String + Send + Sync>;

/// Fixed-window rate-limit policy.
#[derive(Clone)]
pub struct RateLimitPolicy {
    scope: String,
    window: Duration,
    max_requests: u64,
    failure_mode: FailureMode,
    key_fn: KeyFn,
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("scope", &self.scope)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

impl RateLimitPolicy {
    /// Build a policy keyed on the resolved caller identifier.
    ///
    /// # Errors
    /// Returns [`PolicyError`] if the scope is empty, or the window or quota
    /// is zero.
    pub fn new(
        scope: impl Into<String>,
        window: Duration,
        max_requests: u64,
        failure_mode: FailureMode,
    ) -> Result<Self, PolicyError> {
        let scope = scope.into();
        if scope.trim().is_empty() {
            return Err(PolicyError::EmptyScope);
        }
        if window.as_millis() == 0 {
            return Err(PolicyError::ZeroWindow(scope));
        }
        if max_requests == 0 {
            return Err(PolicyError::ZeroMaxRequests(scope));
        }
        Ok(Self {
            scope,
            window,
            max_requests,
            failure_mode,
            key_fn: Arc::new(resolve_identifier),
        })
    }

    pub fn from_config(scope: &str, config: &PolicyConfig) -> Result<Self, PolicyError> {
        Self::new(
            scope,
            Duration::from_millis(config.window_ms),
            config.max_requests,
            config.failure_mode,
        )
    }

    /// Replace the identifier function.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&InboundRequest) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn identify(&self, request: &InboundRequest) -> String {
        (self.key_fn)(request)
    }
}

/// The policies registered by the service, one per endpoint category.
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub login: RateLimitPolicy,
    pub email: RateLimitPolicy,
    pub api: RateLimitPolicy,
}

impl PolicySet {
    pub fn from_config(config: &PoliciesConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            login: RateLimitPolicy::from_config("login", &config.login)?,
            email: RateLimitPolicy::from_config("email", &config.email)?,
            api: RateLimitPolicy::from_config("api", &config.api)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &RateLimitPolicy> {
        [&self.login, &self.email, &self.api].into_iter()
    }
}
