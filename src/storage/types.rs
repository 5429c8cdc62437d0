use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single HTTP header. Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A capture endpoint together with the canned response it replies with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub delay: Duration,
    pub headers: Vec<HttpHeader>,
    /// Populated by the storage on creation.
    pub created_at: DateTime<Utc>,
    /// Populated by the storage on creation, advanced by `add_session_ttl`.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(code: u16, content_type: impl Into<String>, body: Vec<u8>, delay: Duration) -> Self {
        Self {
            code,
            content_type: content_type.into(),
            body,
            delay,
            headers: Vec::new(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn with_headers(mut self, headers: Vec<HttpHeader>) -> Self {
        self.headers = headers;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl Default for Session {
    /// The response used for sessions created implicitly by the capture pipeline.
    fn default() -> Self {
        Session::new(200, "text/plain", Vec::new(), Duration::ZERO)
    }
}

/// One captured inbound HTTP interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub client_addr: String,
    /// Path and query exactly as received.
    pub url: String,
    pub headers: Vec<HttpHeader>,
    pub body: Vec<u8>,
    /// Populated by the storage on creation.
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(
        method: impl Into<String>,
        client_addr: impl Into<String>,
        url: impl Into<String>,
        headers: Vec<HttpHeader>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            method: method.into(),
            client_addr: client_addr.into(),
            url: url.into(),
            headers,
            body,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}
