//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace, timeout)
//!     → middleware/admission.rs (policy per route group)
//!     → handler, or 429 / 503 written by the pipeline
//! ```

pub mod middleware;
pub mod server;

pub use server::{AppState, HttpServer, X_REQUEST_ID};
