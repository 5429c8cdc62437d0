//! PubSub Trait
//!
//! Topic-keyed event bus. The topic is the session id in its canonical
//! textual form; events are ephemeral and a subscriber only sees events
//! published after it subscribed.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error_handling::types::PubSubError;
use crate::pubsub::types::{Event, Unsubscribe};

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes without waiting for subscribers. Publishing to a topic
    /// nobody listens on is a no-op.
    async fn publish(&self, topic: &str, event: Event) -> Result<(), PubSubError>;

    /// Subscribes to `topic`. After the returned [`Unsubscribe`] has run, the
    /// receiver yields `None` and nothing more is sent on it.
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<(mpsc::Receiver<Event>, Unsubscribe), PubSubError>;

    /// Closes every subscription. A second call fails with `Closed`.
    async fn close(&self) -> Result<(), PubSubError>;
}
