//! Webhook capture filter.
//!
//! Any request whose first path segment is a canonical session id is
//! recorded, announced to live-feed observers and answered with the
//! session's canned response. The filter rejects with `not_found` for every
//! other path so the API and UI routes can take over.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp::http::header::{HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE};
use warp::http::{HeaderMap, Method, StatusCode};
use warp::hyper::Body;
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Rejection};

use crate::data_capture::body::read_limited;
use crate::data_capture::client_address::client_address;
use crate::error_handling::types::{CaptureError, StorageError};
use crate::identifier;
use crate::pubsub::{Event, PubSub};
use crate::storage::{HttpHeader, Request, Session, Storage};

/// Knobs of the capture pipeline, derived from the configuration.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub max_body_bytes: usize,
    /// Lowercased header name prefixes that are not recorded.
    pub ignore_header_prefixes: Vec<String>,
    pub auto_create_sessions: bool,
    pub read_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_body_bytes: 64 * 1024,
            ignore_header_prefixes: Vec::new(),
            auto_create_sessions: false,
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl CaptureSettings {
    pub fn with_ignored_prefixes(mut self, prefixes: &[String]) -> Self {
        self.ignore_header_prefixes = prefixes
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    fn is_ignored(&self, header: &str) -> bool {
        let header = header.to_ascii_lowercase();
        self.ignore_header_prefixes
            .iter()
            .any(|prefix| header.starts_with(prefix.as_str()))
    }
}

/// Shared state handed to every captured request.
#[derive(Clone)]
pub struct CaptureContext {
    pub storage: Arc<dyn Storage>,
    pub pubsub: Arc<dyn PubSub>,
    pub settings: CaptureSettings,
    pub shutdown: CancellationToken,
}

/// What the request path says about the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTarget {
    pub session_id: Uuid,
    pub status_override: Option<u16>,
}

/// Matches `/{sid}[/{code}][/...]`.
pub fn match_path(path: &str) -> Option<CaptureTarget> {
    let mut segments = path.trim_start_matches('/').split('/');
    let session_id = identifier::parse(segments.next()?).ok()?;

    let status_override = segments
        .next()
        .filter(|s| s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|code| (100..=599).contains(code));

    Some(CaptureTarget {
        session_id,
        status_override,
    })
}

/// Path plus `?query` exactly as received.
fn request_url() -> impl Filter<Extract = (String,), Error = std::convert::Infallible> + Clone {
    warp::path::full()
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .map(|path: FullPath, query: String| {
            if query.is_empty() {
                path.as_str().to_string()
            } else {
                format!("{}?{}", path.as_str(), query)
            }
        })
}

fn capture_target() -> impl Filter<Extract = (CaptureTarget,), Error = Rejection> + Clone {
    warp::path::full().and_then(|path: FullPath| async move {
        match_path(path.as_str()).ok_or_else(warp::reject::not_found)
    })
}

fn with_context(
    ctx: CaptureContext,
) -> impl Filter<Extract = (CaptureContext,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// ANY /{sid}[/{code}][/...]
pub fn capture_route(
    ctx: CaptureContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    capture_target()
        .and(warp::method())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(request_url())
        .and(warp::body::stream())
        .and(with_context(ctx))
        .and_then(
            |target: CaptureTarget,
             method: Method,
             headers: HeaderMap,
             peer: Option<SocketAddr>,
             url: String,
             body,
             ctx: CaptureContext| async move {
                let incoming = Incoming {
                    method,
                    headers,
                    peer,
                    url,
                };
                Ok::<_, Rejection>(capture(ctx, target, incoming, body).await)
            },
        )
}

struct Incoming {
    method: Method,
    headers: HeaderMap,
    peer: Option<SocketAddr>,
    url: String,
}

async fn capture<S, B>(ctx: CaptureContext, target: CaptureTarget, incoming: Incoming, body: S) -> Response
where
    S: futures_util::Stream<Item = Result<B, warp::Error>> + Send,
    B: bytes::Buf + Send,
{
    let sid = target.session_id;

    let session = match find_session(&ctx, sid).await {
        Ok(session) => session,
        Err(e) => return error_page(&e),
    };

    let declared = incoming
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let body = match tokio::time::timeout(
        ctx.settings.read_timeout,
        read_limited(body, ctx.settings.max_body_bytes, declared),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            warn!("[{}] refused {} {}: {}", sid, incoming.method, incoming.url, e);
            return error_page(&e);
        }
        Err(_) => return error_page(&CaptureError::ReadTimeout),
    };

    let client = client_address(&incoming.headers, incoming.peer);
    let headers: Vec<HttpHeader> = incoming
        .headers
        .iter()
        .filter(|(name, _)| !ctx.settings.is_ignored(name.as_str()))
        .map(|(name, value)| {
            HttpHeader::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()))
        })
        .collect();

    let request = Request::new(
        incoming.method.as_str(),
        client.clone(),
        incoming.url.clone(),
        headers,
        body,
    );

    let rid = match ctx.storage.new_request(sid, request).await {
        Ok(rid) => rid,
        Err(e) => {
            error!("[{}] cannot store request: {}", sid, e);
            return error_page(&CaptureError::Storage(e));
        }
    };
    info!(
        "[{}] captured {} {} from {} as {}",
        sid, incoming.method, incoming.url, client, rid
    );

    let pubsub = ctx.pubsub.clone();
    tokio::spawn(async move {
        if let Err(e) = pubsub.publish(&sid.to_string(), Event::RequestCreated(rid)).await {
            error!("[{}] cannot publish request-created for {}: {}", sid, rid, e);
        }
    });

    if !session.delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(session.delay) => {}
            _ = ctx.shutdown.cancelled() => {
                debug!("[{}] delayed response canceled by shutdown", sid);
                return error_page(&CaptureError::Canceled);
            }
        }
    }

    canned_response(&session, target.status_override)
}

async fn find_session(ctx: &CaptureContext, sid: Uuid) -> Result<Session, CaptureError> {
    match ctx.storage.get_session(sid).await {
        Ok(session) => Ok(session),
        Err(StorageError::SessionNotFound(_)) if ctx.settings.auto_create_sessions => {
            match ctx
                .storage
                .new_session(Session::default(), Some(&sid.to_string()))
                .await
            {
                Ok(_) => info!("[{}] session created on first capture", sid),
                // another request won the race
                Err(StorageError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            Ok(ctx.storage.get_session(sid).await?)
        }
        Err(StorageError::SessionNotFound(_)) => Err(CaptureError::SessionNotFound(sid)),
        Err(e) => Err(e.into()),
    }
}

fn canned_response(session: &Session, status_override: Option<u16>) -> Response {
    let code = status_override.unwrap_or(session.code);
    let mut response = Response::new(Body::from(session.body.clone()));
    *response.status_mut() = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);

    let headers = response.headers_mut();
    for header in &session.headers {
        match (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_str(&header.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!("skipping unusable response header {:?}", header.name),
        }
    }
    if let Ok(content_type) = HeaderValue::from_str(&session.content_type) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    response
}

fn error_status(err: &CaptureError) -> StatusCode {
    match err {
        CaptureError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        CaptureError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        CaptureError::BodyReadFailed(_) => StatusCode::BAD_REQUEST,
        CaptureError::ReadTimeout => StatusCode::REQUEST_TIMEOUT,
        CaptureError::Storage(StorageError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
        CaptureError::Storage(_) | CaptureError::Canceled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_page(err: &CaptureError) -> Response {
    let status = error_status(err);
    let message = match err {
        CaptureError::SessionNotFound(_) | CaptureError::Storage(StorageError::SessionNotFound(_)) => {
            "session not found".to_string()
        }
        other => other.to_string(),
    };
    let html = format!(
        "<!doctype html><html><head><title>{code}</title></head>\
         <body><h1>{code}</h1><p>{message}</p></body></html>",
        code = status.as_u16(),
        message = message,
    );

    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
