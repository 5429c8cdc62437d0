//! Pub/sub fabric
//!
//! Delivers `request-created`, `request-deleted` and `requests-cleared`
//! events to everyone watching a session.
//!
//! Components:
//! - `pubsub_trait`: the PubSub trait shared by every backend.
//! - `types`: events, live-feed frames and subscriber plumbing.
//! - `memory_pubsub`: in-process fan-out.
//! - `redis_pubsub`: Redis PUBLISH/SUBSCRIBE backend.

pub mod memory_pubsub;
pub mod pubsub_trait;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use memory_pubsub::MemoryPubSub;
pub use pubsub_trait::PubSub;
pub use types::{Event, EventFrame, Unsubscribe};

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSub;
