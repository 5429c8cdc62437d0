//! In-process storage backend.
//!
//! Sessions live in a concurrent map keyed by id; each session owns a separate
//! concurrent map of its requests. A background sweeper removes expired
//! sessions on a fixed interval, and reads evict expired sessions eagerly so a
//! caller never observes a session past its `expires_at`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, trace};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error_handling::types::StorageError;
use crate::identifier;
use crate::storage::clock::MonotonicClock;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{Request, Session};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type RequestMap = Arc<DashMap<Uuid, Request>>;

struct Inner {
    session_ttl: TimeDelta,
    max_requests: usize,
    clock: MonotonicClock,
    sessions: DashMap<Uuid, Session>,
    requests: DashMap<Uuid, RequestMap>,
}

impl Inner {
    /// Removes the session and its requests. Returns whether a session was removed.
    fn drop_session(&self, sid: Uuid) -> bool {
        let removed = self.sessions.remove(&sid).is_some();
        self.requests.remove(&sid);
        removed
    }

    /// Fetches a live session, deleting it first if it has expired.
    fn live_session(&self, sid: Uuid) -> Result<Session, StorageError> {
        let session = match self.sessions.get(&sid) {
            Some(s) => s.value().clone(),
            None => return Err(StorageError::SessionNotFound(sid)),
        };

        if session.is_expired(Utc::now()) {
            debug!("[{}] session expired on read, evicting", sid);
            self.drop_session(sid);
            return Err(StorageError::SessionNotFound(sid));
        }

        Ok(session)
    }

    fn requests_of(&self, sid: Uuid) -> RequestMap {
        self.requests
            .entry(sid)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .value()
            .clone()
    }

    fn sweep(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        for sid in &expired {
            self.drop_session(*sid);
        }
        expired.len()
    }

    /// Drops the oldest requests until at most `max_requests` remain.
    /// Oldest is by `created_at`, ties broken by the textual request id.
    fn enforce_ring_cap(&self, requests: &DashMap<Uuid, Request>) {
        if requests.len() <= self.max_requests {
            return;
        }

        let mut order: Vec<(chrono::DateTime<Utc>, String, Uuid)> = requests
            .iter()
            .map(|entry| (entry.value().created_at, entry.key().to_string(), *entry.key()))
            .collect();
        order.sort();

        let surplus = order.len().saturating_sub(self.max_requests);
        for (_, _, rid) in order.into_iter().take(surplus) {
            trace!("evicting request {} over ring cap", rid);
            requests.remove(&rid);
        }
    }
}

/// Storage keeping everything in the current process.
pub struct MemoryStorage {
    inner: Arc<Inner>,
    closed: AtomicBool,
    sweeper: CancellationToken,
}

impl MemoryStorage {
    /// Creates the storage and spawns its sweeper on the current tokio runtime.
    pub fn new(session_ttl: Duration, max_requests: usize) -> Self {
        Self::with_sweep_interval(session_ttl, max_requests, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(
        session_ttl: Duration,
        max_requests: usize,
        sweep_interval: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            session_ttl: TimeDelta::from_std(session_ttl).unwrap_or(TimeDelta::MAX),
            max_requests,
            clock: MonotonicClock::new(),
            sessions: DashMap::new(),
            requests: DashMap::new(),
        });
        let sweeper = CancellationToken::new();

        let task_inner = inner.clone();
        let task_token = sweeper.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = task_inner.sweep();
                        if swept > 0 {
                            debug!("sweeper removed {} expired session(s)", swept);
                        }
                    }
                }
            }
            task_inner.sessions.clear();
            task_inner.requests.clear();
            debug!("memory storage sweeper stopped");
        });

        info!(
            "MemoryStorage initialized (ttl: {:?}, max requests: {})",
            session_ttl, max_requests
        );

        Self {
            inner,
            closed: AtomicBool::new(false),
            sweeper,
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn new_session(
        &self,
        mut session: Session,
        id: Option<&str>,
    ) -> Result<Uuid, StorageError> {
        self.ensure_open()?;

        let sid = match id {
            Some(text) => identifier::parse(text)
                .map_err(|e| StorageError::InvalidArgument(e.to_string()))?,
            None => identifier::new_id(),
        };

        let now = self.inner.clock.now();
        session.created_at = now;
        session.expires_at = now
            .checked_add_signed(self.inner.session_ttl)
            .ok_or_else(|| StorageError::InvalidArgument("session TTL is too large".into()))?;

        match self.inner.sessions.entry(sid) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(Utc::now()) {
                    return Err(StorageError::AlreadyExists(sid));
                }
                // the previous owner of this id expired but was not swept yet
                occupied.insert(session);
                self.inner.requests.remove(&sid);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
        }

        debug!("[{}] session created", sid);
        Ok(sid)
    }

    async fn get_session(&self, sid: Uuid) -> Result<Session, StorageError> {
        self.ensure_open()?;
        self.inner.live_session(sid)
    }

    async fn add_session_ttl(&self, sid: Uuid, how_long: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.inner.live_session(sid)?;

        let delta = TimeDelta::from_std(how_long)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;

        match self.inner.sessions.get_mut(&sid) {
            Some(mut session) => {
                session.expires_at = session
                    .expires_at
                    .checked_add_signed(delta)
                    .ok_or_else(|| StorageError::InvalidArgument("TTL is too large".into()))?;
                Ok(())
            }
            None => Err(StorageError::SessionNotFound(sid)),
        }
    }

    async fn delete_session(&self, sid: Uuid) -> Result<(), StorageError> {
        self.ensure_open()?;

        if self.inner.drop_session(sid) {
            debug!("[{}] session deleted", sid);
            Ok(())
        } else {
            Err(StorageError::SessionNotFound(sid))
        }
    }

    async fn new_request(&self, sid: Uuid, mut request: Request) -> Result<Uuid, StorageError> {
        self.ensure_open()?;
        self.inner.live_session(sid)?;

        let rid = identifier::new_id();
        request.created_at = self.inner.clock.now();

        let requests = self.inner.requests_of(sid);
        requests.insert(rid, request);
        self.inner.enforce_ring_cap(&requests);

        // the session may have been deleted while we were inserting
        if !self.inner.sessions.contains_key(&sid) {
            self.inner.requests.remove(&sid);
            return Err(StorageError::SessionNotFound(sid));
        }

        trace!("[{}] request {} stored", sid, rid);
        Ok(rid)
    }

    async fn get_request(&self, sid: Uuid, rid: Uuid) -> Result<Request, StorageError> {
        self.ensure_open()?;
        self.inner.live_session(sid)?;

        self.inner
            .requests
            .get(&sid)
            .and_then(|requests| requests.get(&rid).map(|r| r.value().clone()))
            .ok_or(StorageError::RequestNotFound(rid))
    }

    async fn get_all_requests(&self, sid: Uuid) -> Result<HashMap<Uuid, Request>, StorageError> {
        self.ensure_open()?;
        self.inner.live_session(sid)?;

        let all = match self.inner.requests.get(&sid) {
            Some(requests) => requests
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
            None => HashMap::new(),
        };
        Ok(all)
    }

    async fn delete_request(&self, sid: Uuid, rid: Uuid) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.inner.live_session(sid)?;

        let removed = self
            .inner
            .requests
            .get(&sid)
            .and_then(|requests| requests.remove(&rid))
            .is_some();

        if removed {
            Ok(())
        } else {
            Err(StorageError::RequestNotFound(rid))
        }
    }

    async fn delete_all_requests(&self, sid: Uuid) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.inner.live_session(sid)?;

        if let Some(requests) = self.inner.requests.get(&sid) {
            requests.clear();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StorageError::Closed);
        }

        self.sweeper.cancel();
        self.inner.sessions.clear();
        self.inner.requests.clear();
        info!("MemoryStorage closed");
        Ok(())
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
