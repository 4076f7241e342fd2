//! Inbound request port and caller identification.
//!
//! # Responsibilities
//! - Describe the minimal request shape the admission pipeline needs
//! - Derive a best-effort caller identifier from forwarding headers
//!
//! # Design Decisions
//! - Header names are stored lowercased so lookups are case-insensitive
//! - The identifier is not authenticated; it only scopes counters and events

use std::collections::HashMap;
use std::net::IpAddr;

/// Identifier used when nothing usable is present on the request.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Framework-neutral view of an incoming request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
    pub remote_addr: Option<IpAddr>,
}

impl InboundRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Add a header; the name is lowercased.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Add a header, joining repeated names with `", "` in arrival order.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.clone());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

/// Resolve the caller identifier.
///
/// First non-empty of: the first `x-forwarded-for` entry, `x-real-ip`, the
/// transport remote address, else [`UNKNOWN_IDENTIFIER`].
pub fn resolve_identifier(request: &InboundRequest) -> String {
    let forwarded = request
        .header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ip) = request
        .header("x-real-ip")
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return ip.to_string();
    }

    match request.remote_addr {
        Some(addr) => addr.to_string(),
        None => UNKNOWN_IDENTIFIER.to_string(),
    }
}
