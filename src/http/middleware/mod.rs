//! Request middleware.

pub mod admission;

pub use admission::{admission_middleware, inbound_request, protect, AdmissionState, AxumResponseSink};
