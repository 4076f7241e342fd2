//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (overall deadline owned by the HTTP timeout layer):
//!     → timeouts.rs (Deadline::child bounds each store round trip)
//!     → On expiry: store call fails with StoreError::Timeout
//!     → caller applies the policy's failure mode
//! ```
//!
//! # Design Decisions
//! - Every store call has a deadline
//! - Sub-deadlines are strictly tighter than the request deadline so the
//!   failure-mode branch still runs in time

pub mod timeouts;

pub use timeouts::{Deadline, DeadlineExceeded};
