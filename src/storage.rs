//! Storage subsystem
//!
//! This module provides the session/request store and its backends.
//!
//! Components:
//! - `storage_trait`: the Storage trait defining a uniform async API.
//! - `types`: sessions, captured requests and headers.
//! - `clock`: strictly increasing timestamps used for `created_at`.
//! - `memory_storage`: in-process backend with a background sweeper.
//! - `redis_storage`: Redis backend using sorted sets and native key expiry.

pub mod clock;
pub mod memory_storage;
pub mod storage_trait;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis_storage;

pub use memory_storage::MemoryStorage;
pub use storage_trait::Storage;
pub use types::{HttpHeader, Request, Session};

#[cfg(feature = "redis")]
pub use redis_storage::RedisStorage;
