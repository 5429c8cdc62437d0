//! In-process pub/sub.
//!
//! A single lock guards the topic → subscribers mapping and is released
//! before any event is handed off. Each subscriber owns a bounded channel;
//! a subscriber that stops draining it loses events instead of stalling the
//! publisher or its neighbours.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use log::{debug, info, trace};
use tokio::sync::mpsc;

use crate::error_handling::types::PubSubError;
use crate::pubsub::pubsub_trait::PubSub;
use crate::pubsub::types::{Event, SubscriberSlot, Unsubscribe, SUBSCRIBER_BUFFER};

type Topics = Mutex<HashMap<String, HashMap<u64, Arc<SubscriberSlot>>>>;

pub struct MemoryPubSub {
    topics: Arc<Topics>,
    next_id: AtomicU64,
    buffer: usize,
    closed: AtomicBool,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_buffer(SUBSCRIBER_BUFFER)
    }

    /// `buffer` is raised to [`SUBSCRIBER_BUFFER`] when smaller.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(SUBSCRIBER_BUFFER),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), PubSubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }

    /// Number of live subscribers on `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, |subs| subs.len())
    }

    fn remove_subscriber(topics: &Topics, topic: &str, id: u64) {
        let mut topics = topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, event: Event) -> Result<(), PubSubError> {
        self.ensure_open()?;

        let targets: Vec<Arc<SubscriberSlot>> = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            match topics.get(topic) {
                Some(subs) => subs.values().cloned().collect(),
                None => return Ok(()),
            }
        };

        trace!("publishing {} to {} subscriber(s) of {}", event.name(), targets.len(), topic);
        for slot in targets {
            slot.deliver(event.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<(mpsc::Receiver<Event>, Unsubscribe), PubSubError> {
        self.ensure_open()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = SubscriberSlot::new(topic, self.buffer);

        {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            // re-check under the lock so close() cannot miss this subscriber
            if self.closed.load(Ordering::Acquire) {
                return Err(PubSubError::Closed);
            }
            topics
                .entry(topic.to_string())
                .or_default()
                .insert(id, slot.clone());
        }
        debug!("subscriber {} joined topic {}", id, topic);

        let topics: Weak<Topics> = Arc::downgrade(&self.topics);
        let topic = topic.to_string();
        let unsubscribe = Unsubscribe::new(move || {
            slot.close();
            if let Some(topics) = topics.upgrade() {
                Self::remove_subscriber(&topics, &topic, id);
            }
            debug!("subscriber {} left topic {}", id, topic);
        });

        Ok((rx, unsubscribe))
    }

    async fn close(&self) -> Result<(), PubSubError> {
        let drained: Vec<Arc<SubscriberSlot>> = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(PubSubError::Closed);
            }
            topics.drain().flat_map(|(_, subs)| subs.into_values()).collect()
        };

        for slot in &drained {
            slot.close();
        }
        info!("MemoryPubSub closed ({} subscriber(s) disconnected)", drained.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let ps = MemoryPubSub::new();
        let rid = Uuid::new_v4();

        let (mut rx1, unsub1) = ps.subscribe("topic").await.unwrap();
        let (mut rx2, unsub2) = ps.subscribe("topic").await.unwrap();
        let (mut other, unsub3) = ps.subscribe("other").await.unwrap();

        ps.publish("topic", Event::RequestCreated(rid)).await.unwrap();

        let got = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap();
        assert_eq!(got, Some(Event::RequestCreated(rid)));
        let got = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap();
        assert_eq!(got, Some(Event::RequestCreated(rid)));
        assert!(other.try_recv().is_err());

        unsub1.unsubscribe();
        unsub2.unsubscribe();
        unsub3.unsubscribe();
    }

    #[tokio::test]
    async fn test_publish_order_from_one_task() {
        let ps = MemoryPubSub::new();
        let (mut rx, unsub) = ps.subscribe("topic").await.unwrap();

        let ids: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
        for rid in &ids {
            ps.publish("topic", Event::RequestCreated(*rid)).await.unwrap();
        }
        for rid in &ids {
            assert_eq!(rx.recv().await, Some(Event::RequestCreated(*rid)));
        }
        unsub.unsubscribe();
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let ps = MemoryPubSub::new();
        assert!(ps.publish("nobody", Event::RequestsCleared).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let ps = MemoryPubSub::new();
        let (mut rx, unsub) = ps.subscribe("topic").await.unwrap();
        assert_eq!(ps.subscribers("topic"), 1);

        unsub.unsubscribe();
        unsub.unsubscribe();

        assert_eq!(ps.subscribers("topic"), 0);
        ps.publish("topic", Event::RequestsCleared).await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block() {
        let ps = MemoryPubSub::new();
        let (_stalled, unsub_stalled) = ps.subscribe("topic").await.unwrap();
        let (mut rx, unsub) = ps.subscribe("topic").await.unwrap();

        let publishing = async {
            for _ in 0..SUBSCRIBER_BUFFER * 4 {
                ps.publish("topic", Event::RequestsCleared).await.unwrap();
                // keep the draining subscriber from overflowing
                assert_eq!(rx.recv().await, Some(Event::RequestsCleared));
            }
        };
        timeout(Duration::from_secs(1), publishing).await.unwrap();

        unsub_stalled.unsubscribe();
        unsub.unsubscribe();
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_unsubscribe() {
        let ps = Arc::new(MemoryPubSub::new());

        let publisher = {
            let ps = ps.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    ps.publish("topic", Event::RequestsCleared).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let subscribers: Vec<_> = (0..16)
            .map(|_| {
                let ps = ps.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let (mut rx, unsub) = ps.subscribe("topic").await.unwrap();
                        tokio::task::yield_now().await;
                        unsub.unsubscribe();
                        while rx.recv().await.is_some() {}
                    }
                })
            })
            .collect();

        for s in subscribers {
            timeout(Duration::from_secs(5), s).await.unwrap().unwrap();
        }
        publisher.await.unwrap();
        assert_eq!(ps.subscribers("topic"), 0);
    }

    #[tokio::test]
    async fn test_close() {
        let ps = MemoryPubSub::new();
        let (mut rx, unsub) = ps.subscribe("topic").await.unwrap();

        ps.close().await.unwrap();
        assert_eq!(ps.close().await, Err(PubSubError::Closed));
        assert_eq!(rx.recv().await, None);
        assert_eq!(ps.publish("topic", Event::RequestsCleared).await, Err(PubSubError::Closed));
        assert!(ps.subscribe("topic").await.is_err());

        unsub.unsubscribe();
    }
}
