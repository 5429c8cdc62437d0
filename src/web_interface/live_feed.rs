//! WebSocket live feed.
//!
//! `GET /ws/session/:sid` streams the events of one session as JSON text
//! frames (`{"name": "request-created", "data": "<rid>"}`). A feed lives until
//! the peer goes away, the server shuts down, or its optional lifetime runs
//! out. A ping keeps idle connections from being reaped by proxies.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::error_handling::types::StorageError;
use crate::identifier;
use crate::pubsub::PubSub;
use crate::storage::Storage;
use crate::web_interface::routes::json_error;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LiveFeedSettings {
    /// `None` means unlimited.
    pub max_clients: Option<usize>,
    /// `None` means unlimited.
    pub max_lifetime: Option<Duration>,
    pub heartbeat: Duration,
    pub write_timeout: Duration,
}

impl Default for LiveFeedSettings {
    fn default() -> Self {
        Self {
            max_clients: None,
            max_lifetime: None,
            heartbeat: DEFAULT_HEARTBEAT,
            write_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct LiveFeedContext {
    pub storage: Arc<dyn Storage>,
    pub pubsub: Arc<dyn PubSub>,
    pub settings: LiveFeedSettings,
    pub shutdown: CancellationToken,
    clients: Arc<AtomicUsize>,
}

impl LiveFeedContext {
    pub fn new(
        storage: Arc<dyn Storage>,
        pubsub: Arc<dyn PubSub>,
        settings: LiveFeedSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            pubsub,
            settings,
            shutdown,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of feeds currently holding a client slot.
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Option<ClientSlot> {
        let max = self.settings.max_clients.unwrap_or(usize::MAX);
        self.clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ClientSlot(self.clients.clone()))
    }
}

/// Releases its place in the client count when dropped.
struct ClientSlot(Arc<AtomicUsize>);

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lifecycle of one feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Upgraded, not yet subscribed.
    Unverified,
    /// Forwarding events.
    Active,
    /// Unsubscribed, sending the close frame.
    Draining,
    Closed,
}

impl FeedState {
    fn advance(self, next: FeedState, sid: Uuid) -> FeedState {
        trace!("[{}] live feed {:?} -> {:?}", sid, self, next);
        next
    }
}

fn with_context(
    ctx: LiveFeedContext,
) -> impl Filter<Extract = (LiveFeedContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// GET /ws/session/:sid
pub fn live_feed_route(
    ctx: LiveFeedContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("ws" / "session" / String)
        .and(warp::get())
        .and(warp::ws())
        .and(with_context(ctx))
        .and_then(|sid: String, ws: Ws, ctx: LiveFeedContext| async move {
            Ok::<_, Rejection>(upgrade(ctx, sid, ws).await)
        })
}

async fn upgrade(ctx: LiveFeedContext, sid: String, ws: Ws) -> Response {
    let sid = match identifier::parse(&sid) {
        Ok(sid) => sid,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid session id"),
    };

    let Some(slot) = ctx.acquire() else {
        warn!("[{}] live feed refused: too many clients", sid);
        return json_error(StatusCode::TOO_MANY_REQUESTS, "too many live feed clients");
    };

    match ctx.storage.get_session(sid).await {
        Ok(_) => {}
        Err(e @ StorageError::SessionNotFound(_)) => {
            return json_error(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => {
            error!("[{}] live feed cannot check session: {}", sid, e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    ws.on_upgrade(move |socket| serve(socket, sid, ctx, slot))
        .into_response()
}

async fn send_within(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: Message,
    limit: Duration,
) -> bool {
    match timeout(limit, tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("live feed write failed: {}", e);
            false
        }
        Err(_) => {
            debug!("live feed write timed out");
            false
        }
    }
}

async fn serve(socket: WebSocket, sid: Uuid, ctx: LiveFeedContext, _slot: ClientSlot) {
    let mut state = FeedState::Unverified;
    let (mut tx, mut rx) = socket.split();
    let write_timeout = ctx.settings.write_timeout;

    let (mut events, unsubscribe) = match ctx.pubsub.subscribe(&sid.to_string()).await {
        Ok(sub) => sub,
        Err(e) => {
            error!("[{}] live feed cannot subscribe: {}", sid, e);
            let _ = send_within(&mut tx, Message::close(), write_timeout).await;
            return;
        }
    };
    state = state.advance(FeedState::Active, sid);
    info!("[{}] live feed connected", sid);

    let lifetime = async {
        match ctx.settings.max_lifetime {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(lifetime);

    let period = ctx.settings.heartbeat;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        let outgoing = tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("[{}] live feed closing for shutdown", sid);
                break;
            }
            _ = &mut lifetime => {
                debug!("[{}] live feed reached its lifetime", sid);
                break;
            }
            incoming = rx.next() => match incoming {
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("[{}] live feed read failed: {}", sid, e);
                    break;
                }
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => match serde_json::to_string(&event.to_frame()) {
                    Ok(text) => Message::text(text),
                    Err(e) => {
                        error!("[{}] cannot encode {}: {}", sid, event.name(), e);
                        continue;
                    }
                },
                // the pub/sub side went away
                None => break,
            },
            _ = heartbeat.tick() => Message::ping(Vec::new()),
        };

        if !send_within(&mut tx, outgoing, write_timeout).await {
            break;
        }
    }

    state = state.advance(FeedState::Draining, sid);
    unsubscribe.unsubscribe();
    let _ = send_within(&mut tx, Message::close(), write_timeout).await;
    let _ = timeout(write_timeout, tx.close()).await;

    state = state.advance(FeedState::Closed, sid);
    info!("[{}] live feed disconnected ({:?})", sid, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{Event, MemoryPubSub};
    use crate::storage::{MemoryStorage, Session};

    fn context(settings: LiveFeedSettings) -> LiveFeedContext {
        LiveFeedContext::new(
            Arc::new(MemoryStorage::new(Duration::from_secs(60), 8)),
            Arc::new(MemoryPubSub::new()),
            settings,
            CancellationToken::new(),
        )
    }

    fn upgrade_request(path: &str) -> warp::test::RequestBuilder {
        warp::test::request()
            .path(path)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[tokio::test]
    async fn test_unknown_session_refused() {
        let ctx = context(LiveFeedSettings::default());
        let res = upgrade_request(&format!("/ws/session/{}", Uuid::new_v4()))
            .reply(&live_feed_route(ctx.clone()))
            .await;

        assert_eq!(res.status(), 404);
        assert_eq!(ctx.clients(), 0);
    }

    #[tokio::test]
    async fn test_streams_events() {
        let ctx = context(LiveFeedSettings::default());
        let sid = ctx.storage.new_session(Session::default(), None).await.unwrap();
        let route = live_feed_route(ctx.clone());

        let mut client = warp::test::ws()
            .path(&format!("/ws/session/{}", sid))
            .handshake(route)
            .await
            .expect("handshake");

        // wait for the feed to subscribe
        let rid = Uuid::new_v4();
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.pubsub.publish(&sid.to_string(), Event::RequestCreated(rid)).await.is_ok() {
            let got = timeout(Duration::from_millis(50), client.recv()).await;
            if let Ok(Ok(msg)) = got {
                let text = msg.to_str().expect("text frame");
                let frame: serde_json::Value = serde_json::from_str(text).unwrap();
                assert_eq!(frame["name"], "request-created");
                assert_eq!(frame["data"], rid.to_string());
                break;
            }
            assert!(Instant::now() < deadline, "no event received");
        }
        assert_eq!(ctx.clients(), 1);

        ctx.shutdown.cancel();
        let drained = timeout(Duration::from_secs(2), async {
            // late duplicates of the test event may still be queued
            while let Ok(msg) = client.recv().await {
                if msg.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_client_cap() {
        let ctx = context(LiveFeedSettings {
            max_clients: Some(1),
            ..LiveFeedSettings::default()
        });
        let sid = ctx.storage.new_session(Session::default(), None).await.unwrap();
        let path = format!("/ws/session/{}", sid);

        let _first = warp::test::ws()
            .path(&path)
            .handshake(live_feed_route(ctx.clone()))
            .await
            .expect("handshake");

        let res = upgrade_request(&path).reply(&live_feed_route(ctx.clone())).await;
        assert_eq!(res.status(), 429);
    }

    #[tokio::test]
    async fn test_lifetime_closes_feed() {
        let ctx = context(LiveFeedSettings {
            max_lifetime: Some(Duration::from_millis(100)),
            ..LiveFeedSettings::default()
        });
        let sid = ctx.storage.new_session(Session::default(), None).await.unwrap();

        let mut client = warp::test::ws()
            .path(&format!("/ws/session/{}", sid))
            .handshake(live_feed_route(ctx.clone()))
            .await
            .expect("handshake");

        let closing = timeout(Duration::from_secs(2), client.recv()).await.unwrap();
        assert!(closing.map(|m| m.is_close()).unwrap_or(true));
    }
}
