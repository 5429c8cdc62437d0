use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{reply, Filter, Rejection, Reply};

use crate::error_handling::types::StorageError;
use crate::identifier;
use crate::pubsub::{Event, PubSub};
use crate::storage::Storage;
use crate::web_interface::types::{
    ApiError, Limits, NewSessionRequest, RequestResponse, SessionResponse, SettingsResponse,
    SuccessResponse, VersionResponse,
};

/// Largest accepted JSON body on the API.
const MAX_API_BODY: u64 = 64 * 1024;

/// Values the API reports or validates against.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub max_requests: usize,
    pub session_ttl: Duration,
    pub max_request_body_size: usize,
    pub write_timeout: Duration,
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Arc<dyn Storage>,
    pub pubsub: Arc<dyn PubSub>,
    pub settings: ApiSettings,
}

fn with_context(ctx: ApiContext) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    reply::with_status(reply::json(&ApiError::new(message)), status).into_response()
}

fn storage_error(err: &StorageError) -> Response {
    let status = match err {
        StorageError::SessionNotFound(_) | StorageError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        StorageError::AlreadyExists(_) => StatusCode::CONFLICT,
        StorageError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        StorageError::Closed | StorageError::Transport(_) | StorageError::Encoding(_) => {
            error!("storage failure: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(status, err.to_string())
}

fn parse_id(text: &str, what: &str) -> Result<Uuid, Response> {
    identifier::parse(text)
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, format!("invalid {} id", what)))
}

/// Publishes without holding up the response.
fn publish_detached(pubsub: &Arc<dyn PubSub>, sid: Uuid, event: Event) {
    let pubsub = pubsub.clone();
    tokio::spawn(async move {
        let name = event.name();
        if let Err(e) = pubsub.publish(&sid.to_string(), event).await {
            error!("[{}] cannot publish {}: {}", sid, name, e);
        }
    });
}

fn ok_json<T: serde::Serialize>(value: &T) -> Response {
    reply::json(value).into_response()
}

/// POST /api/session
pub fn create_session_route(
    ctx: ApiContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "session")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_API_BODY))
        .and(warp::body::json())
        .and(with_context(ctx))
        .and_then(|payload: NewSessionRequest, ctx: ApiContext| async move {
            let session = match payload.into_session(ctx.settings.write_timeout) {
                Ok(session) => session,
                Err(message) => return Ok::<_, Rejection>(json_error(StatusCode::BAD_REQUEST, message)),
            };
            let sid = match ctx.storage.new_session(session, None).await {
                Ok(sid) => sid,
                Err(e) => return Ok(storage_error(&e)),
            };
            info!("[{}] session created", sid);

            match ctx.storage.get_session(sid).await {
                Ok(stored) => Ok(ok_json(&SessionResponse::new(sid, &stored))),
                Err(e) => Ok(storage_error(&e)),
            }
        })
}

/// GET /api/session/:sid
pub fn get_session_route(
    ctx: ApiContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "session" / String)
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(|sid: String, ctx: ApiContext| async move {
            let sid = match parse_id(&sid, "session") {
                Ok(sid) => sid,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            match ctx.storage.get_session(sid).await {
                Ok(session) => Ok(ok_json(&SessionResponse::new(sid, &session))),
                Err(e) => Ok(storage_error(&e)),
            }
        })
}

/// DELETE /api/session/:sid
pub fn delete_session_route(
    ctx: ApiContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "session" / String)
        .and(warp::delete())
        .and(with_context(ctx))
        .and_then(|sid: String, ctx: ApiContext| async move {
            let sid = match parse_id(&sid, "session") {
                Ok(sid) => sid,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            match ctx.storage.delete_session(sid).await {
                Ok(()) => {
                    info!("[{}] session deleted", sid);
                    Ok(ok_json(&SuccessResponse { success: true }))
                }
                Err(e) => Ok(storage_error(&e)),
            }
        })
}

/// GET /api/session/:sid/requests, newest first
pub fn list_requests_route(
    ctx: ApiContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "session" / String / "requests")
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(|sid: String, ctx: ApiContext| async move {
            let sid = match parse_id(&sid, "session") {
                Ok(sid) => sid,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            match ctx.storage.get_all_requests(sid).await {
                Ok(all) => {
                    let mut list: Vec<_> = all.into_iter().collect();
                    list.sort_by(|(a_id, a), (b_id, b)| {
                        b.created_at.cmp(&a.created_at).then_with(|| b_id.cmp(a_id))
                    });
                    let body: Vec<RequestResponse> = list
                        .iter()
                        .map(|(rid, req)| RequestResponse::new(*rid, req))
                        .collect();
                    Ok(ok_json(&body))
                }
                Err(e) => Ok(storage_error(&e)),
            }
        })
}

/// DELETE /api/session/:sid/requests
pub fn delete_all_requests_route(
    ctx: ApiContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "session" / String / "requests")
        .and(warp::delete())
        .and(with_context(ctx))
        .and_then(|sid: String, ctx: ApiContext| async move {
            let sid = match parse_id(&sid, "session") {
                Ok(sid) => sid,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            match ctx.storage.delete_all_requests(sid).await {
                Ok(()) => {
                    publish_detached(&ctx.pubsub, sid, Event::RequestsCleared);
                    Ok(ok_json(&SuccessResponse { success: true }))
                }
                Err(e) => Ok(storage_error(&e)),
            }
        })
}

/// GET /api/session/:sid/requests/:rid
pub fn get_request_route(
    ctx: ApiContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "session" / String / "requests" / String)
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(|sid: String, rid: String, ctx: ApiContext| async move {
            let (sid, rid) = match (parse_id(&sid, "session"), parse_id(&rid, "request")) {
                (Ok(sid), Ok(rid)) => (sid, rid),
                (Err(res), _) | (_, Err(res)) => return Ok::<_, Rejection>(res),
            };
            match ctx.storage.get_request(sid, rid).await {
                Ok(req) => Ok(ok_json(&RequestResponse::new(rid, &req))),
                Err(e) => Ok(storage_error(&e)),
            }
        })
}

/// DELETE /api/session/:sid/requests/:rid
pub fn delete_request_route(
    ctx: ApiContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "session" / String / "requests" / String)
        .and(warp::delete())
        .and(with_context(ctx))
        .and_then(|sid: String, rid: String, ctx: ApiContext| async move {
            let (sid, rid) = match (parse_id(&sid, "session"), parse_id(&rid, "request")) {
                (Ok(sid), Ok(rid)) => (sid, rid),
                (Err(res), _) | (_, Err(res)) => return Ok::<_, Rejection>(res),
            };
            match ctx.storage.delete_request(sid, rid).await {
                Ok(()) => {
                    publish_detached(&ctx.pubsub, sid, Event::RequestDeleted(rid));
                    Ok(ok_json(&SuccessResponse { success: true }))
                }
                Err(e) => Ok(storage_error(&e)),
            }
        })
}

/// GET /api/settings
pub fn settings_route(
    settings: ApiSettings,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "settings").and(warp::get()).map(move || {
        ok_json(&SettingsResponse {
            limits: Limits {
                max_requests: settings.max_requests,
                session_ttl: settings.session_ttl.as_secs(),
                max_request_body_size: settings.max_request_body_size,
            },
        })
    })
}

/// GET /api/version
pub fn version_route() -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "version").and(warp::get()).map(|| {
        ok_json(&VersionResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    })
}

/// GET /healthz and GET /readyz
pub fn probe_routes() -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let healthz = warp::path!("healthz").and(warp::get());
    let readyz = warp::path!("readyz").and(warp::get());
    healthz
        .or(readyz)
        .unify()
        .map(|| reply::with_status("OK", StatusCode::OK).into_response())
}

/// Every `/api` route.
pub fn api_routes(ctx: ApiContext) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    create_session_route(ctx.clone())
        .or(get_session_route(ctx.clone()))
        .unify()
        .or(delete_session_route(ctx.clone()))
        .unify()
        .or(list_requests_route(ctx.clone()))
        .unify()
        .or(delete_all_requests_route(ctx.clone()))
        .unify()
        .or(get_request_route(ctx.clone()))
        .unify()
        .or(delete_request_route(ctx.clone()))
        .unify()
        .or(settings_route(ctx.settings))
        .unify()
        .or(version_route())
        .unify()
}
