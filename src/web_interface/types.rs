use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::header::{HeaderName, HeaderValue};

use crate::storage::{HttpHeader, Request, Session};

pub const MIN_STATUS_CODE: u16 = 100;
pub const MAX_STATUS_CODE: u16 = 530;
pub const MAX_CONTENT_TYPE_LEN: usize = 32;
pub const MAX_RESPONSE_DELAY: Duration = Duration::from_secs(30);
pub const MAX_RESPONSE_BODY_LEN: usize = 10240;
pub const MAX_RESPONSE_HEADERS: usize = 10;
pub const MAX_HEADER_NAME_LEN: usize = 40;
pub const MAX_HEADER_VALUE_LEN: usize = 2048;

/// API error payload
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPayload {
    pub name: String,
    pub value: String,
}

impl From<&HttpHeader> for HeaderPayload {
    fn from(h: &HttpHeader) -> Self {
        Self {
            name: h.name.clone(),
            value: h.value.clone(),
        }
    }
}

/// POST /api/session body. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewSessionRequest {
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    /// Seconds.
    pub response_delay: Option<u64>,
    pub response_body_base64: Option<String>,
    pub response_headers: Option<Vec<HeaderPayload>>,
}

impl NewSessionRequest {
    /// Validates the payload and turns it into a session template.
    ///
    /// `write_timeout` bounds the delay: a response must leave at least one
    /// second of the write window.
    pub fn into_session(self, write_timeout: Duration) -> Result<Session, String> {
        let code = self.status_code.unwrap_or(200);
        if !(MIN_STATUS_CODE..=MAX_STATUS_CODE).contains(&code) {
            return Err(format!(
                "status code must be between {} and {}",
                MIN_STATUS_CODE, MAX_STATUS_CODE
            ));
        }

        let content_type = self.content_type.unwrap_or_else(|| "text/plain".to_string());
        if content_type.chars().count() > MAX_CONTENT_TYPE_LEN {
            return Err(format!(
                "content type is too long (max {} characters)",
                MAX_CONTENT_TYPE_LEN
            ));
        }
        if HeaderValue::from_str(&content_type).is_err() {
            return Err("content type is not a valid header value".to_string());
        }

        let max_delay = MAX_RESPONSE_DELAY.min(write_timeout.saturating_sub(Duration::from_secs(1)));
        let delay = Duration::from_secs(self.response_delay.unwrap_or(0));
        if delay > max_delay {
            return Err(format!(
                "response delay is too long (max {} seconds)",
                max_delay.as_secs()
            ));
        }

        let body = match self.response_body_base64 {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| format!("cannot decode response body: {}", e))?,
            None => Vec::new(),
        };
        // each invalid UTF-8 sequence counts as one replacement char
        if String::from_utf8_lossy(&body).chars().count() > MAX_RESPONSE_BODY_LEN {
            return Err(format!(
                "response body is too large (max {} characters)",
                MAX_RESPONSE_BODY_LEN
            ));
        }

        let headers = self.response_headers.unwrap_or_default();
        if headers.len() > MAX_RESPONSE_HEADERS {
            return Err(format!("too many response headers (max {})", MAX_RESPONSE_HEADERS));
        }
        let mut checked = Vec::with_capacity(headers.len());
        for h in headers {
            if h.name.is_empty() || h.name.len() > MAX_HEADER_NAME_LEN {
                return Err(format!(
                    "header name must be 1 to {} characters",
                    MAX_HEADER_NAME_LEN
                ));
            }
            if h.value.len() > MAX_HEADER_VALUE_LEN {
                return Err(format!(
                    "header value is too long (max {} characters)",
                    MAX_HEADER_VALUE_LEN
                ));
            }
            if HeaderName::from_bytes(h.name.as_bytes()).is_err()
                || HeaderValue::from_str(&h.value).is_err()
            {
                return Err(format!("invalid response header {:?}", h.name));
            }
            checked.push(HttpHeader::new(h.name, h.value));
        }

        Ok(Session::new(code, content_type, body, delay).with_headers(checked))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseSettings {
    pub code: u16,
    pub content_type: String,
    pub content_base64: String,
    pub delay_sec: u64,
    pub created_at_unix: i64,
    pub headers: Vec<HeaderPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub uuid: Uuid,
    pub response: ResponseSettings,
}

impl SessionResponse {
    pub fn new(uuid: Uuid, session: &Session) -> Self {
        Self {
            uuid,
            response: ResponseSettings {
                code: session.code,
                content_type: session.content_type.clone(),
                content_base64: BASE64.encode(&session.body),
                delay_sec: session.delay.as_secs(),
                created_at_unix: session.created_at.timestamp(),
                headers: session.headers.iter().map(HeaderPayload::from).collect(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestResponse {
    pub uuid: Uuid,
    pub client_address: String,
    pub method: String,
    pub content_base64: String,
    pub headers: Vec<HeaderPayload>,
    pub url: String,
    pub created_at_unix: i64,
}

impl RequestResponse {
    pub fn new(uuid: Uuid, request: &Request) -> Self {
        Self {
            uuid,
            client_address: request.client_addr.clone(),
            method: request.method.clone(),
            content_base64: BASE64.encode(&request.body),
            headers: request.headers.iter().map(HeaderPayload::from).collect(),
            url: request.url.clone(),
            created_at_unix: request.created_at.timestamp(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Limits {
    pub max_requests: usize,
    /// Seconds.
    pub session_ttl: u64,
    pub max_request_body_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub limits: Limits,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}
