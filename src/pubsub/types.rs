use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Minimum per-subscriber buffer. A subscriber that falls further behind loses events.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Something that happened to the requests of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RequestCreated(Uuid),
    RequestDeleted(Uuid),
    RequestsCleared,
}

/// Wire shape of an event on the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFrame {
    pub name: String,
    pub data: String,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RequestCreated(_) => "request-created",
            Event::RequestDeleted(_) => "request-deleted",
            Event::RequestsCleared => "requests-cleared",
        }
    }

    pub fn to_frame(&self) -> EventFrame {
        let data = match self {
            Event::RequestCreated(rid) | Event::RequestDeleted(rid) => rid.to_string(),
            Event::RequestsCleared => "*".to_string(),
        };
        EventFrame {
            name: self.name().to_string(),
            data,
        }
    }
}

/// The sending half of one subscription.
///
/// The sender sits behind a lock so that taking it out (unsubscribe) and
/// handing off an event can never interleave: once [`SubscriberSlot::close`]
/// returns, no further send happens and the receiver observes the channel end.
pub struct SubscriberSlot {
    topic: String,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    dropped: AtomicU64,
}

impl SubscriberSlot {
    pub fn new(topic: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(SUBSCRIBER_BUFFER));
        let slot = Arc::new(Self {
            topic: topic.into(),
            tx: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
        });
        (slot, rx)
    }

    /// Hands the event off without waiting. A full buffer drops the event.
    /// Returns `false` once the slot is closed or the receiver went away.
    pub fn deliver(&self, event: Event) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "subscriber on topic {} is full, dropped {} ({} dropped so far)",
                    self.topic,
                    event.name(),
                    total
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Drops the sender, closing the channel. Idempotent.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Ends a subscription. Cloneable, callable from any task, idempotent.
#[derive(Clone)]
pub struct Unsubscribe {
    inner: Arc<UnsubscribeInner>,
}

struct UnsubscribeInner {
    done: AtomicBool,
    on_unsubscribe: Box<dyn Fn() + Send + Sync>,
}

impl Unsubscribe {
    pub fn new(on_unsubscribe: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(UnsubscribeInner {
                done: AtomicBool::new(false),
                on_unsubscribe: Box::new(on_unsubscribe),
            }),
        }
    }

    pub fn unsubscribe(&self) {
        if !self.inner.done.swap(true, Ordering::AcqRel) {
            (self.inner.on_unsubscribe)();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("done", &self.inner.done.load(Ordering::Relaxed))
            .finish()
    }
}
