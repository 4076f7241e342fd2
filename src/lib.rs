//! Distributed abuse-prevention core: fixed-window rate limiting, security
//! event recording and anomaly detection over a shared atomic store.

pub mod admin;
pub mod clock;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::schema::GuardConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
