//! Per-call metadata.
//!
//! # Data Flow
//! ```text
//! HTTP headers ──▶ Metadata::from_http_headers ──▶ CallContext
//!                                                     │
//!                             Metadata::outbound ◀────┘ (copy + derive)
//!                                     │
//!                       to_metadata_map ──▶ tonic request headers
//!                                     │
//!   server: from_http_headers + take_timeout ──▶ handler CallContext
//! ```
//!
//! # Design Decisions
//! - Keys are always lowercase
//! - Forwarding derives a new map; the inbound map is never mutated by the
//!   outbound path
//! - Hop-by-hop and transport-reserved headers never cross the boundary

use std::collections::HashMap;
use std::time::Duration;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};

use crate::codec::DEFAULT_CONTENT_TYPE;

pub const X_CONTENT_TYPE: &str = "x-content-type";
pub const CONTENT_TYPE: &str = "content-type";
/// Remaining call budget in nanoseconds.
pub const TIMEOUT: &str = "timeout";
pub const REQUEST_ID: &str = "request_id";
pub const REQUEST_SQ: &str = "request_sq";
/// Peer address, added by the server.
pub const REMOTE: &str = "remote";

const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "host",
    "content-length",
    "content-type",
    "user-agent",
];

fn is_forwardable(key: &str) -> bool {
    !SKIPPED_HEADERS.contains(&key) && !key.starts_with("grpc-") && !key.starts_with("sec-websocket-")
}

/// Lowercase string map carried alongside every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect request headers. Repeated headers are joined with `,`;
    /// non-UTF-8 values are dropped.
    pub fn from_http_headers(headers: &HeaderMap) -> Self {
        let mut md = Self::new();
        for name in headers.keys() {
            let key = name.as_str();
            if key == "connection" {
                continue;
            }
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if !values.is_empty() {
                md.insert(key, values.join(","));
            }
        }
        md
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.get(REQUEST_ID)
    }

    pub fn request_sq(&self) -> Option<&str> {
        self.get(REQUEST_SQ)
    }

    /// `x-content-type`, falling back to `content-type`.
    pub fn content_type(&self) -> Option<&str> {
        self.get(X_CONTENT_TYPE).or_else(|| self.get(CONTENT_TYPE))
    }

    /// Derive the map for an outbound call.
    ///
    /// Fills `x-content-type` with the default when absent, generates a
    /// `request_id` when absent and advances `request_sq`.
    pub fn outbound(&self) -> Self {
        let mut md = self.clone();
        if md.get(X_CONTENT_TYPE).map_or(true, str::is_empty) {
            md.insert(X_CONTENT_TYPE, DEFAULT_CONTENT_TYPE);
        }
        if md.get(REQUEST_ID).map_or(true, str::is_empty) {
            md.insert(REQUEST_ID, new_request_id());
        }
        let next_sq = md
            .get(REQUEST_SQ)
            .and_then(|sq| sq.trim().parse::<u64>().ok())
            .and_then(|sq| sq.checked_add(1))
            .unwrap_or(0);
        md.insert(REQUEST_SQ, next_sq.to_string());
        md
    }

    pub fn set_timeout(&mut self, budget: Duration) {
        self.insert(TIMEOUT, budget.as_nanos().to_string());
    }

    /// Remove `timeout` and return it as a duration.
    pub fn take_timeout(&mut self) -> Option<Duration> {
        let raw = self.remove(TIMEOUT)?;
        let nanos = raw.trim().parse::<u64>().ok()?;
        Some(Duration::from_nanos(nanos))
    }

    /// Build transport headers. Keys or values the transport cannot
    /// carry are skipped.
    pub fn to_metadata_map(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        for (key, value) in self.iter() {
            if !is_forwardable(key) {
                continue;
            }
            let (Ok(k), Ok(v)) = (
                MetadataKey::<Ascii>::from_bytes(key.as_bytes()),
                MetadataValue::<Ascii>::try_from(value),
            ) else {
                tracing::debug!(key, "Dropping metadata entry not representable as a header");
                continue;
            };
            map.insert(k, v);
        }
        map
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut md = Self::new();
        for (k, v) in iter {
            md.insert(&k, v);
        }
        md
    }
}

/// Request id format: UUID v4 without dashes.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
