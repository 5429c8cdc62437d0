//! HTTP surface
//!
//! Components:
//! - `routes`: session and request endpoints, settings, version and probes.
//! - `live_feed`: the per-session WebSocket event stream.
//! - `assets`: the embedded web UI.
//! - `rejection`: JSON replies for unmatched or malformed requests.
//! - `types`: API payloads and their validation.
//! - `web_server`: composes everything and runs the listener.

pub mod assets;
pub mod live_feed;
pub mod rejection;
pub mod routes;
pub mod types;
pub mod web_server;

pub use live_feed::{LiveFeedContext, LiveFeedSettings};
pub use routes::{ApiContext, ApiSettings};
pub use web_server::{ServerSettings, WebServer};
