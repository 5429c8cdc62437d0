use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::configuration::{Config, PubSubDriver, StorageDriver};
use crate::data_capture::CaptureSettings;
use crate::error_handling::types::*;
use crate::pubsub::{MemoryPubSub, PubSub};
use crate::storage::{MemoryStorage, Storage};
use crate::web_interface::live_feed::DEFAULT_HEARTBEAT;
use crate::web_interface::{ApiSettings, LiveFeedSettings, ServerSettings, WebServer};

#[cfg(feature = "redis")]
use crate::pubsub::RedisPubSub;
#[cfg(feature = "redis")]
use crate::storage::RedisStorage;

/// Key prefix shared by every Redis key and channel this service owns.
pub const REDIS_PREFIX: &str = "webhook-tester:";

/// Owns the back-ends and the web server for the lifetime of the process.
pub struct Controller {
    pub config: Config,
    storage: Arc<dyn Storage>,
    pubsub: Arc<dyn PubSub>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Builds the storage and pub/sub back-ends selected by `config`.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing controller");
        config.validate()?;

        let storage = build_storage(&config).await?;
        let pubsub = build_pubsub(&config).await?;

        Ok(Self {
            config,
            storage,
            pubsub,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token cancelled when the controller starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn server_settings(&self) -> Result<ServerSettings, ControllerError> {
        let config = &self.config;
        Ok(ServerSettings {
            addr: config.socket_addr()?,
            capture: CaptureSettings {
                max_body_bytes: config.max_request_body_size,
                auto_create_sessions: config.auto_create_sessions,
                read_timeout: std::time::Duration::from_secs(config.read_timeout_secs),
                ..CaptureSettings::default()
            }
            .with_ignored_prefixes(&config.ignore_header_prefixes),
            api: ApiSettings {
                max_requests: config.max_requests,
                session_ttl: config.session_ttl(),
                max_request_body_size: config.max_request_body_size,
                write_timeout: config.write_timeout(),
            },
            live_feed: LiveFeedSettings {
                max_clients: config.ws_max_clients(),
                max_lifetime: config.ws_max_lifetime(),
                heartbeat: DEFAULT_HEARTBEAT,
                write_timeout: config.write_timeout(),
            },
        })
    }

    /// Serves until SIGINT/SIGTERM or until [`Controller::shutdown_token`] is
    /// cancelled. In-flight HTTP work gets at most the configured shutdown
    /// timeout before pub/sub and storage are closed.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let server = WebServer::new(
            self.storage.clone(),
            self.pubsub.clone(),
            self.server_settings()?,
            self.shutdown.clone(),
        );
        if self.config.idle_timeout_secs > 0 {
            debug!(
                "idle timeout of {}s is left to the HTTP stack defaults",
                self.config.idle_timeout_secs
            );
        }

        let (_, serving) = server.bind()?;
        tokio::pin!(serving);

        let stopped = tokio::select! {
            _ = &mut serving => {
                warn!("Web server stopped unexpectedly");
                true
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                false
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
                false
            }
        };
        self.shutdown.cancel();

        let mut result = Ok(());
        if !stopped
            && tokio::time::timeout(self.config.shutdown_timeout(), &mut serving)
                .await
                .is_err()
        {
            warn!(
                "Connections still open after {:?}, closing back-ends anyway",
                self.config.shutdown_timeout()
            );
            result = Err(WebError::ShutdownTimedOut.into());
        }

        self.close_backends().await?;
        info!("Controller stopped");
        result
    }

    /// Closes pub/sub first so live feeds end before the storage goes away.
    async fn close_backends(&self) -> Result<(), ControllerError> {
        let pubsub_closed = self.pubsub.close().await;
        let storage_closed = self.storage.close().await;

        if let Err(e) = &pubsub_closed {
            error!("Cannot close pub/sub: {}", e);
        }
        if let Err(e) = &storage_closed {
            error!("Cannot close storage: {}", e);
        }
        pubsub_closed?;
        storage_closed?;
        Ok(())
    }
}

async fn build_storage(config: &Config) -> Result<Arc<dyn Storage>, ControllerError> {
    match config.storage_driver {
        StorageDriver::Memory => {
            info!("Using in-memory storage");
            Ok(Arc::new(MemoryStorage::new(
                config.session_ttl(),
                config.max_requests,
            )))
        }
        #[cfg(feature = "redis")]
        StorageDriver::Redis => {
            info!("Using Redis storage");
            let client = redis_client(config)?;
            let storage =
                RedisStorage::new(client, REDIS_PREFIX, config.session_ttl(), config.max_requests)
                    .await?;
            Ok(Arc::new(storage))
        }
        #[cfg(not(feature = "redis"))]
        StorageDriver::Redis => Err(ControllerError::InitializationFailed(
            "built without Redis support".to_string(),
        )),
    }
}

async fn build_pubsub(config: &Config) -> Result<Arc<dyn PubSub>, ControllerError> {
    match config.pubsub_driver {
        PubSubDriver::Memory => {
            info!("Using in-memory pub/sub");
            Ok(Arc::new(MemoryPubSub::new()))
        }
        #[cfg(feature = "redis")]
        PubSubDriver::Redis => {
            info!("Using Redis pub/sub");
            let client = redis_client(config)?;
            Ok(Arc::new(RedisPubSub::new(client, REDIS_PREFIX).await?))
        }
        #[cfg(not(feature = "redis"))]
        PubSubDriver::Redis => Err(ControllerError::InitializationFailed(
            "built without Redis support".to_string(),
        )),
    }
}

#[cfg(feature = "redis")]
fn redis_client(config: &Config) -> Result<redis::Client, ControllerError> {
    redis::Client::open(config.redis_dsn.as_str())
        .map_err(|e| ControllerError::InitializationFailed(format!("invalid Redis DSN: {}", e)))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
