#[cfg(feature = "redis")]
use std::collections::HashMap;
#[cfg(feature = "redis")]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(feature = "redis")]
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use futures_util::StreamExt;
#[cfg(feature = "redis")]
use log::{debug, error, info, warn};
#[cfg(feature = "redis")]
use redis::aio::MultiplexedConnection;
#[cfg(feature = "redis")]
use tokio::sync::mpsc;
#[cfg(feature = "redis")]
use tokio_util::sync::CancellationToken;

#[cfg(feature = "redis")]
use crate::encoding;
#[cfg(feature = "redis")]
use crate::error_handling::types::PubSubError;
#[cfg(feature = "redis")]
use crate::pubsub::pubsub_trait::PubSub;
#[cfg(feature = "redis")]
use crate::pubsub::types::{Event, SubscriberSlot, Unsubscribe, SUBSCRIBER_BUFFER};

#[cfg(feature = "redis")]
type Subscribers = Mutex<HashMap<u64, Arc<SubscriberSlot>>>;

/// One Redis subscription shared by every local subscriber of a topic.
#[cfg(feature = "redis")]
struct TopicFeed {
    subscribers: Arc<Subscribers>,
    cancel: CancellationToken,
}

#[cfg(feature = "redis")]
type Feeds = Mutex<HashMap<String, TopicFeed>>;

/// Pub/sub over Redis `PUBLISH`/`SUBSCRIBE`.
///
/// The first local subscriber of a topic opens the Redis subscription and
/// starts a pump task that decodes payloads and fans them out to every local
/// subscriber of that topic. The last one to leave cancels the pump, which
/// ends the Redis subscription.
#[cfg(feature = "redis")]
pub struct RedisPubSub {
    client: redis::Client,
    conn: MultiplexedConnection,
    prefix: String,
    feeds: Arc<Feeds>,
    next_id: AtomicU64,
    /// Parent of every pump's token; cancelled on close.
    shutdown: CancellationToken,
    closed: AtomicBool,
}

#[cfg(feature = "redis")]
impl RedisPubSub {
    pub async fn new(client: redis::Client, prefix: impl Into<String>) -> Result<Self, PubSubError> {
        let conn = client.get_multiplexed_tokio_connection().await?;
        info!("RedisPubSub initialized");

        Ok(Self {
            client,
            conn,
            prefix: prefix.into(),
            feeds: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}events:{}", self.prefix, topic)
    }

    fn ensure_open(&self) -> Result<(), PubSubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }

    /// Number of topics with a live Redis subscription.
    pub fn active_topics(&self) -> usize {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of local subscribers on `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds.get(topic).map_or(0, |feed| {
            feed.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        })
    }

    /// Adds the slot to an existing feed. `false` when the topic has none yet.
    fn join_feed(&self, topic: &str, id: u64, slot: &Arc<SubscriberSlot>) -> Result<bool, PubSubError> {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        let Some(feed) = feeds.get(topic) else {
            return Ok(false);
        };
        feed.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot.clone());
        Ok(true)
    }

    fn remove_subscriber(feeds: &Feeds, topic: &str, id: u64) {
        let mut feeds = feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(feed) = feeds.get(topic) else {
            return;
        };
        let now_empty = {
            let mut subs = feed.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subs.remove(&id);
            subs.is_empty()
        };
        if now_empty {
            if let Some(feed) = feeds.remove(topic) {
                feed.cancel.cancel();
                debug!("last subscriber left {}, dropping redis subscription", topic);
            }
        }
    }
}

#[cfg(feature = "redis")]
async fn pump(
    mut pubsub: redis::aio::PubSub,
    channel: String,
    topic: String,
    subscribers: Arc<Subscribers>,
    feeds: Weak<Feeds>,
    cancel: CancellationToken,
) {
    {
        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        warn!("redis subscription on {} ended", channel);
                        break;
                    };
                    match encoding::decode::<Event>(msg.get_payload_bytes()) {
                        Ok(event) => {
                            let targets: Vec<Arc<SubscriberSlot>> = subscribers
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .values()
                                .cloned()
                                .collect();
                            for slot in targets {
                                slot.deliver(event.clone());
                            }
                        }
                        Err(e) => error!("dropping undecodable event on {}: {}", channel, e),
                    }
                }
            }
        }
    }

    // a transport failure leaves the feed registered; detach it so the next
    // subscriber opens a fresh subscription
    if let Some(feeds) = feeds.upgrade() {
        let mut feeds = feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if feeds
            .get(&topic)
            .is_some_and(|feed| Arc::ptr_eq(&feed.subscribers, &subscribers))
        {
            feeds.remove(&topic);
        }
    }
    let remaining: Vec<Arc<SubscriberSlot>> = subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .map(|(_, slot)| slot)
        .collect();
    for slot in remaining {
        slot.close();
    }

    if let Err(e) = pubsub.unsubscribe(&channel).await {
        debug!("unsubscribe from {} failed: {}", channel, e);
    }
    debug!("redis pump for {} stopped", channel);
}

#[cfg(feature = "redis")]
#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, topic: &str, event: Event) -> Result<(), PubSubError> {
        self.ensure_open()?;

        let payload = encoding::encode(&event)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<(mpsc::Receiver<Event>, Unsubscribe), PubSubError> {
        self.ensure_open()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = SubscriberSlot::new(topic, SUBSCRIBER_BUFFER);

        if !self.join_feed(topic, id, &slot)? {
            let channel = self.channel(topic);
            let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
            pubsub.subscribe(&channel).await?;

            let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.load(Ordering::Acquire) {
                return Err(PubSubError::Closed);
            }
            match feeds.get(topic) {
                // another subscriber won the race; our connection is dropped
                Some(feed) => {
                    feed.subscribers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id, slot.clone());
                }
                None => {
                    let subscribers = Arc::new(Mutex::new(HashMap::from([(id, slot.clone())])));
                    let cancel = self.shutdown.child_token();
                    feeds.insert(
                        topic.to_string(),
                        TopicFeed {
                            subscribers: subscribers.clone(),
                            cancel: cancel.clone(),
                        },
                    );
                    tokio::spawn(pump(
                        pubsub,
                        channel.clone(),
                        topic.to_string(),
                        subscribers,
                        Arc::downgrade(&self.feeds),
                        cancel,
                    ));
                    debug!("subscribed to {}", channel);
                }
            }
        }

        let feeds: Weak<Feeds> = Arc::downgrade(&self.feeds);
        let topic = topic.to_string();
        let unsubscribe = Unsubscribe::new(move || {
            // closing the slot first guarantees no send after we return
            slot.close();
            if let Some(feeds) = feeds.upgrade() {
                RedisPubSub::remove_subscriber(&feeds, &topic, id);
            }
        });

        Ok((rx, unsubscribe))
    }

    async fn close(&self) -> Result<(), PubSubError> {
        let drained: Vec<TopicFeed> = {
            let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(PubSubError::Closed);
            }
            feeds.drain().map(|(_, feed)| feed).collect()
        };
        self.shutdown.cancel();

        for feed in &drained {
            let subs = feed.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            for slot in subs.values() {
                slot.close();
            }
        }
        info!("RedisPubSub closed ({} topic(s) dropped)", drained.len());
        Ok(())
    }
}
