//! Storage Trait
//!
//! This module defines the `Storage` trait, the contract shared by the
//! in-memory and the Redis backends.
//!
//! Implementors are responsible for:
//! - Creating sessions and expiring them once `expires_at` has passed
//! - Keeping at most `max_requests` captured requests per session, evicting the oldest
//! - Cascading session deletion to every request the session owns
//!
//! All methods are async and return a typed [`StorageError`]. Dropping a
//! returned future cancels the operation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error_handling::types::StorageError;
use crate::storage::types::{Request, Session};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists a new session and returns its identifier.
    ///
    /// - `session` - response settings; `created_at`/`expires_at` are overwritten.
    /// - `id` - optional explicit identifier. A malformed value fails with
    ///   `InvalidArgument`, a collision with a live session with `AlreadyExists`.
    async fn new_session(&self, session: Session, id: Option<&str>) -> Result<Uuid, StorageError>;

    /// Returns the session, or `SessionNotFound` once it has expired.
    async fn get_session(&self, sid: Uuid) -> Result<Session, StorageError>;

    /// Pushes `expires_at` forward by `how_long`. `created_at` is untouched.
    async fn add_session_ttl(&self, sid: Uuid, how_long: Duration) -> Result<(), StorageError>;

    /// Deletes the session and all its requests.
    async fn delete_session(&self, sid: Uuid) -> Result<(), StorageError>;

    /// Stores a captured request, stamping `created_at`.
    async fn new_request(&self, sid: Uuid, request: Request) -> Result<Uuid, StorageError>;

    async fn get_request(&self, sid: Uuid, rid: Uuid) -> Result<Request, StorageError>;

    /// Returns every stored request of the session. Order is not guaranteed.
    async fn get_all_requests(&self, sid: Uuid) -> Result<HashMap<Uuid, Request>, StorageError>;

    async fn delete_request(&self, sid: Uuid, rid: Uuid) -> Result<(), StorageError>;

    async fn delete_all_requests(&self, sid: Uuid) -> Result<(), StorageError>;

    /// Releases background tasks and connections. A second call fails with `Closed`.
    async fn close(&self) -> Result<(), StorageError>;
}
