use std::fmt;

use uuid::Uuid;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadIPFormatting(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    Malformed(String),
}

impl fmt::Display for IdentifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierError::Malformed(s) => write!(f, "malformed identifier: {:?}", s),
        }
    }
}

impl std::error::Error for IdentifierError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::Encode(e) => write!(f, "encoding failed: {}", e),
            EncodingError::Decode(e) => write!(f, "decoding failed: {}", e),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Errors returned by every [`Storage`](crate::storage::storage_trait::Storage) backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The storage was used after `close()`, or closed twice.
    Closed,
    SessionNotFound(Uuid),
    RequestNotFound(Uuid),
    /// An explicit session id collides with a live session.
    AlreadyExists(Uuid),
    InvalidArgument(String),
    /// Remote backend I/O failure. Never retried at the storage layer.
    Transport(String),
    Encoding(EncodingError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Closed => write!(f, "storage is closed"),
            StorageError::SessionNotFound(id) => write!(f, "session {} not found", id),
            StorageError::RequestNotFound(id) => write!(f, "request {} not found", id),
            StorageError::AlreadyExists(id) => write!(f, "session {} already exists", id),
            StorageError::InvalidArgument(e) => write!(f, "invalid argument: {}", e),
            StorageError::Transport(e) => write!(f, "storage transport error: {}", e),
            StorageError::Encoding(e) => write!(f, "storage {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<EncodingError> for StorageError {
    fn from(err: EncodingError) -> Self {
        StorageError::Encoding(err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubError {
    Closed,
    Transport(String),
    Encoding(EncodingError),
}

impl fmt::Display for PubSubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PubSubError::Closed => write!(f, "pubsub is closed"),
            PubSubError::Transport(e) => write!(f, "pubsub transport error: {}", e),
            PubSubError::Encoding(e) => write!(f, "pubsub {}", e),
        }
    }
}

impl std::error::Error for PubSubError {}

impl From<EncodingError> for PubSubError {
    fn from(err: EncodingError) -> Self {
        PubSubError::Encoding(err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for PubSubError {
    fn from(err: redis::RedisError) -> Self {
        PubSubError::Transport(err.to_string())
    }
}

/// Reasons the capture pipeline refuses or aborts a request.
#[derive(Debug)]
pub enum CaptureError {
    SessionNotFound(Uuid),
    PayloadTooLarge { current: u64, max: u64 },
    BodyReadFailed(String),
    ReadTimeout,
    Storage(StorageError),
    Canceled,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::SessionNotFound(id) => write!(f, "session {} not found", id),
            CaptureError::PayloadTooLarge { current, max } => write!(
                f,
                "request body is too large (current: {} bytes, max: {} bytes)",
                current, max
            ),
            CaptureError::BodyReadFailed(e) => write!(f, "cannot read request body: {}", e),
            CaptureError::ReadTimeout => write!(f, "timed out reading request body"),
            CaptureError::Storage(e) => write!(f, "cannot store request: {}", e),
            CaptureError::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<StorageError> for CaptureError {
    fn from(err: StorageError) -> Self {
        CaptureError::Storage(err)
    }
}

#[derive(Debug)]
pub enum WebError {
    BindFailed(String),
    ShutdownTimedOut,
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::BindFailed(e) => write!(f, "cannot bind HTTP server: {}", e),
            WebError::ShutdownTimedOut => write!(f, "HTTP server shutdown timed out"),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    PubSubError(PubSubError),
    WebError(WebError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::PubSubError(e) => write!(f, "PubSub error: {}", e),
            ControllerError::WebError(e) => write!(f, "Web server error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::StorageError(err)
    }
}

impl From<PubSubError> for ControllerError {
    fn from(err: PubSubError) -> Self {
        ControllerError::PubSubError(err)
    }
}

impl From<WebError> for ControllerError {
    fn from(err: WebError) -> Self {
        ControllerError::WebError(err)
    }
}
