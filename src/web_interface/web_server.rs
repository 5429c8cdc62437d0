use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;
use warp::{Filter, Reply};

use crate::data_capture::capture::{capture_route, CaptureContext, CaptureSettings};
use crate::error_handling::types::WebError;
use crate::pubsub::PubSub;
use crate::storage::Storage;
use crate::web_interface::assets::assets_route;
use crate::web_interface::live_feed::{live_feed_route, LiveFeedContext, LiveFeedSettings};
use crate::web_interface::rejection::handle_rejection;
use crate::web_interface::routes::{api_routes, probe_routes, ApiContext, ApiSettings};

/// Everything the HTTP surface needs to know about its limits.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub capture: CaptureSettings,
    pub api: ApiSettings,
    pub live_feed: LiveFeedSettings,
}

/// Web server for the capture endpoint, the API, the live feed and the UI
pub struct WebServer {
    storage: Arc<dyn Storage>,
    pubsub: Arc<dyn PubSub>,
    settings: ServerSettings,
    shutdown: CancellationToken,
}

impl WebServer {
    /// `shutdown` stops the listener, cancels delayed captures and closes live feeds.
    pub fn new(
        storage: Arc<dyn Storage>,
        pubsub: Arc<dyn PubSub>,
        settings: ServerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            pubsub,
            settings,
            shutdown,
        }
    }

    /// The complete filter tree. Capture comes first so a session id in the
    /// first path segment always wins over every other route.
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone + Send + Sync + 'static {
        let capture = capture_route(CaptureContext {
            storage: self.storage.clone(),
            pubsub: self.pubsub.clone(),
            settings: self.settings.capture.clone(),
            shutdown: self.shutdown.clone(),
        });
        let api = api_routes(ApiContext {
            storage: self.storage.clone(),
            pubsub: self.pubsub.clone(),
            settings: self.settings.api.clone(),
        });
        let live_feed = live_feed_route(LiveFeedContext::new(
            self.storage.clone(),
            self.pubsub.clone(),
            self.settings.live_feed.clone(),
            self.shutdown.clone(),
        ));

        capture
            .or(api)
            .unify()
            .or(live_feed)
            .unify()
            .or(probe_routes())
            .unify()
            .or(assets_route())
            .unify()
            .recover(handle_rejection)
            .with(warp::log("webhook_tester::http"))
    }

    /// Binds the listener. The returned future serves until the shutdown
    /// token is cancelled and in-flight connections have finished.
    pub fn bind(&self) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), WebError> {
        let shutdown = self.shutdown.clone();
        let (addr, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(self.settings.addr, async move {
                shutdown.cancelled().await
            })
            .map_err(|e| WebError::BindFailed(format!("{}: {}", self.settings.addr, e)))?;

        info!("Listening on http://{}", addr);
        Ok((addr, server))
    }

    /// Binds and serves until shutdown.
    pub async fn start(&self) -> Result<(), WebError> {
        let (_, server) = self.bind()?;
        server.await;
        info!("Web server stopped");
        Ok(())
    }
}
