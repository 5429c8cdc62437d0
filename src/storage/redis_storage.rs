#[cfg(feature = "redis")]
use std::collections::HashMap;
#[cfg(feature = "redis")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use chrono::{TimeDelta, Utc};
#[cfg(feature = "redis")]
use log::{debug, info, warn};
#[cfg(feature = "redis")]
use redis::aio::MultiplexedConnection;
#[cfg(feature = "redis")]
use uuid::Uuid;

#[cfg(feature = "redis")]
use crate::encoding;
#[cfg(feature = "redis")]
use crate::error_handling::types::StorageError;
#[cfg(feature = "redis")]
use crate::identifier;
#[cfg(feature = "redis")]
use crate::storage::clock::MonotonicClock;
#[cfg(feature = "redis")]
use crate::storage::storage_trait::Storage;
#[cfg(feature = "redis")]
use crate::storage::types::{Request, Session};

/// Storage backed by a Redis server.
///
/// Every session uses three key families:
/// - `{prefix}session:{sid}` holds the encoded session, expiring with it
/// - `{prefix}session:{sid}:requests` is a sorted set of request ids scored by
///   creation time in nanoseconds
/// - `{prefix}session:{sid}:requests:{rid}` holds one encoded request
#[cfg(feature = "redis")]
pub struct RedisStorage {
    conn: MultiplexedConnection,
    prefix: String,
    session_ttl: TimeDelta,
    max_requests: usize,
    clock: MonotonicClock,
    closed: AtomicBool,
}

#[cfg(feature = "redis")]
impl RedisStorage {
    pub async fn new(
        client: redis::Client,
        prefix: impl Into<String>,
        session_ttl: Duration,
        max_requests: usize,
    ) -> Result<Self, StorageError> {
        let conn = client.get_multiplexed_tokio_connection().await?;
        let session_ttl = TimeDelta::from_std(session_ttl)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        info!(
            "RedisStorage initialized (ttl: {}s, max requests: {})",
            session_ttl.num_seconds(),
            max_requests
        );

        Ok(Self {
            conn,
            prefix: prefix.into(),
            session_ttl,
            max_requests,
            clock: MonotonicClock::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn session_key(&self, sid: Uuid) -> String {
        format!("{}session:{}", self.prefix, sid)
    }

    fn requests_key(&self, sid: Uuid) -> String {
        format!("{}session:{}:requests", self.prefix, sid)
    }

    fn request_key(&self, sid: Uuid, rid: &str) -> String {
        format!("{}session:{}:requests:{}", self.prefix, sid, rid)
    }

    fn ensure_open(&self) -> Result<MultiplexedConnection, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(self.conn.clone())
    }

    /// Milliseconds left until the session expires, `None` once it has.
    fn remaining_ms(session: &Session) -> Option<i64> {
        let ms = (session.expires_at - Utc::now()).num_milliseconds();
        if ms > 0 {
            Some(ms)
        } else {
            None
        }
    }

    async fn request_ids(
        &self,
        conn: &mut MultiplexedConnection,
        sid: Uuid,
    ) -> Result<Vec<String>, StorageError> {
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.requests_key(sid))
            .arg(0)
            .arg(-1)
            .query_async(conn)
            .await?;
        Ok(ids)
    }

    /// Loads a live session. An expired leftover is purged and reported missing.
    async fn load_session(
        &self,
        conn: &mut MultiplexedConnection,
        sid: Uuid,
    ) -> Result<Session, StorageError> {
        let blob: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.session_key(sid))
            .query_async(conn)
            .await?;

        let session: Session = match blob {
            Some(bytes) => encoding::decode(&bytes)?,
            None => return Err(StorageError::SessionNotFound(sid)),
        };

        if Self::remaining_ms(&session).is_none() {
            debug!("[{}] session expired on read, purging", sid);
            self.purge(conn, sid).await?;
            return Err(StorageError::SessionNotFound(sid));
        }

        Ok(session)
    }

    /// Deletes all three key families. Returns whether the session key existed.
    async fn purge(&self, conn: &mut MultiplexedConnection, sid: Uuid) -> Result<bool, StorageError> {
        let ids = self.request_ids(conn, sid).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(self.session_key(sid));
        pipe.cmd("DEL").arg(self.requests_key(sid)).ignore();
        for id in &ids {
            pipe.cmd("DEL").arg(self.request_key(sid, id)).ignore();
        }

        let (deleted,): (i64,) = pipe.query_async(conn).await?;
        Ok(deleted > 0)
    }

    /// Writes back a session with a later `expires_at`. `SET XX` never
    /// recreates a session deleted since it was loaded.
    async fn store_extended(
        &self,
        conn: &mut MultiplexedConnection,
        sid: Uuid,
        session: &Session,
    ) -> Result<(), StorageError> {
        let ttl_ms = Self::remaining_ms(session).ok_or(StorageError::SessionNotFound(sid))?;
        let ids = self.request_ids(conn, sid).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET")
            .arg(self.session_key(sid))
            .arg(encoding::encode(session)?)
            .arg("PX")
            .arg(ttl_ms)
            .arg("XX");
        self.refresh_requests_ttl(&mut pipe, sid, &ids, ttl_ms);
        let (stored,): (Option<String>,) = pipe.query_async(conn).await?;

        stored.map(|_| ()).ok_or(StorageError::SessionNotFound(sid))
    }

    /// Indexes and stores one request, returning the index in ascending order.
    ///
    /// The session key is checked inside the same transaction. When the
    /// session vanished since it was loaded the request is taken back out.
    async fn append_request(
        &self,
        conn: &mut MultiplexedConnection,
        sid: Uuid,
        rid: Uuid,
        request: &Request,
        ttl_ms: i64,
    ) -> Result<Vec<String>, StorageError> {
        let score = request.created_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let rid_text = rid.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("EXISTS").arg(self.session_key(sid));
        pipe.cmd("ZADD")
            .arg(self.requests_key(sid))
            .arg(score)
            .arg(&rid_text)
            .ignore();
        pipe.cmd("SET")
            .arg(self.request_key(sid, &rid_text))
            .arg(encoding::encode(request)?)
            .arg("PX")
            .arg(ttl_ms)
            .ignore();
        pipe.cmd("ZRANGE").arg(self.requests_key(sid)).arg(0).arg(-1);
        let (exists, ids): (i64, Vec<String>) = pipe.query_async(conn).await?;

        if exists == 0 {
            debug!("[{}] session deleted while storing request {}", sid, rid);
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("ZREM").arg(self.requests_key(sid)).arg(&rid_text).ignore();
            pipe.cmd("DEL").arg(self.request_key(sid, &rid_text)).ignore();
            let () = pipe.query_async(conn).await?;
            return Err(StorageError::SessionNotFound(sid));
        }
        Ok(ids)
    }

    /// Applies `ttl_ms` to the index and to each listed request blob.
    fn refresh_requests_ttl(&self, pipe: &mut redis::Pipeline, sid: Uuid, ids: &[String], ttl_ms: i64) {
        pipe.cmd("PEXPIRE").arg(self.requests_key(sid)).arg(ttl_ms).ignore();
        for id in ids {
            pipe.cmd("PEXPIRE").arg(self.request_key(sid, id)).arg(ttl_ms).ignore();
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl Storage for RedisStorage {
    async fn new_session(
        &self,
        mut session: Session,
        id: Option<&str>,
    ) -> Result<Uuid, StorageError> {
        let mut conn = self.ensure_open()?;

        let sid = match id {
            Some(text) => identifier::parse(text)
                .map_err(|e| StorageError::InvalidArgument(e.to_string()))?,
            None => identifier::new_id(),
        };

        let now = self.clock.now();
        session.created_at = now;
        session.expires_at = now
            .checked_add_signed(self.session_ttl)
            .ok_or_else(|| StorageError::InvalidArgument("session TTL is too large".into()))?;

        let blob = encoding::encode(&session)?;
        let stored: Option<String> = redis::cmd("SET")
            .arg(self.session_key(sid))
            .arg(blob)
            .arg("PX")
            .arg(self.session_ttl.num_milliseconds().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        if stored.is_none() {
            return Err(StorageError::AlreadyExists(sid));
        }

        debug!("[{}] session created", sid);
        Ok(sid)
    }

    async fn get_session(&self, sid: Uuid) -> Result<Session, StorageError> {
        let mut conn = self.ensure_open()?;
        self.load_session(&mut conn, sid).await
    }

    async fn add_session_ttl(&self, sid: Uuid, how_long: Duration) -> Result<(), StorageError> {
        let mut conn = self.ensure_open()?;
        let mut session = self.load_session(&mut conn, sid).await?;

        let delta = TimeDelta::from_std(how_long)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        session.expires_at = session
            .expires_at
            .checked_add_signed(delta)
            .ok_or_else(|| StorageError::InvalidArgument("TTL is too large".into()))?;

        self.store_extended(&mut conn, sid, &session).await
    }

    async fn delete_session(&self, sid: Uuid) -> Result<(), StorageError> {
        let mut conn = self.ensure_open()?;

        if self.purge(&mut conn, sid).await? {
            debug!("[{}] session deleted", sid);
            Ok(())
        } else {
            Err(StorageError::SessionNotFound(sid))
        }
    }

    async fn new_request(&self, sid: Uuid, mut request: Request) -> Result<Uuid, StorageError> {
        let mut conn = self.ensure_open()?;
        let session = self.load_session(&mut conn, sid).await?;
        let ttl_ms = Self::remaining_ms(&session).ok_or(StorageError::SessionNotFound(sid))?;

        let rid = identifier::new_id();
        request.created_at = self.clock.now();
        let mut ids = self.append_request(&mut conn, sid, rid, &request, ttl_ms).await?;

        // ascending score order, equal scores ordered by member
        let surplus: Vec<String> = if ids.len() > self.max_requests {
            ids.drain(..ids.len() - self.max_requests).collect()
        } else {
            Vec::new()
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        if !surplus.is_empty() {
            pipe.cmd("ZREM").arg(self.requests_key(sid)).arg(&surplus).ignore();
            let keys: Vec<String> = surplus.iter().map(|id| self.request_key(sid, id)).collect();
            pipe.cmd("DEL").arg(keys).ignore();
        }
        pipe.cmd("PEXPIRE").arg(self.session_key(sid)).arg(ttl_ms).ignore();
        self.refresh_requests_ttl(&mut pipe, sid, &ids, ttl_ms);
        let () = pipe.query_async(&mut conn).await?;

        Ok(rid)
    }

    async fn get_request(&self, sid: Uuid, rid: Uuid) -> Result<Request, StorageError> {
        let mut conn = self.ensure_open()?;
        self.load_session(&mut conn, sid).await?;

        let blob: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.request_key(sid, &rid.to_string()))
            .query_async(&mut conn)
            .await?;

        match blob {
            Some(bytes) => Ok(encoding::decode(&bytes)?),
            None => Err(StorageError::RequestNotFound(rid)),
        }
    }

    async fn get_all_requests(&self, sid: Uuid) -> Result<HashMap<Uuid, Request>, StorageError> {
        let mut conn = self.ensure_open()?;
        self.load_session(&mut conn, sid).await?;

        let ids = self.request_ids(&mut conn, sid).await?;
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.request_key(sid, id)).collect();
        let blobs: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

        let mut all = HashMap::with_capacity(ids.len());
        for (id, blob) in ids.iter().zip(blobs) {
            // the blob may have expired out from under the index
            let Some(bytes) = blob else { continue };
            let rid = match Uuid::parse_str(id) {
                Ok(rid) => rid,
                Err(_) => {
                    warn!("[{}] skipping malformed request id {:?} in index", sid, id);
                    continue;
                }
            };
            all.insert(rid, encoding::decode(&bytes)?);
        }
        Ok(all)
    }

    async fn delete_request(&self, sid: Uuid, rid: Uuid) -> Result<(), StorageError> {
        let mut conn = self.ensure_open()?;
        self.load_session(&mut conn, sid).await?;

        let rid_text = rid.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZREM").arg(self.requests_key(sid)).arg(&rid_text);
        pipe.cmd("DEL").arg(self.request_key(sid, &rid_text));
        let (unindexed, deleted): (i64, i64) = pipe.query_async(&mut conn).await?;

        if unindexed == 0 && deleted == 0 {
            return Err(StorageError::RequestNotFound(rid));
        }
        Ok(())
    }

    async fn delete_all_requests(&self, sid: Uuid) -> Result<(), StorageError> {
        let mut conn = self.ensure_open()?;
        self.load_session(&mut conn, sid).await?;

        let ids = self.request_ids(&mut conn, sid).await?;
        let mut keys: Vec<String> = ids.iter().map(|id| self.request_key(sid, id)).collect();
        keys.push(self.requests_key(sid));

        let _: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StorageError::Closed);
        }
        info!("RedisStorage closed");
        Ok(())
    }
}
