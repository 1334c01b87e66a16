//! Publish/subscribe abstraction (mechanics only).
//!
//! Messages are opaque byte payloads addressed to a named topic. Every
//! subscriber of a topic receives its own copy (broadcast semantics).
//!
//! ## Delivery
//!
//! Delivery is **best effort / fire-and-forget**: there is no acknowledgement,
//! and a subscriber that joins late misses earlier messages. Consumers treat a
//! message as a hint (e.g. "cancel job X") and confirm through the job store.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Error)]
pub enum PubSubError {
    /// Internal lock poisoned.
    #[error("pubsub state poisoned")]
    Poisoned,

    /// The message payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport failure (connection lost, broker error, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

type CloseHook = Box<dyn FnOnce() + Send + Sync>;

/// A subscription to a single topic.
///
/// Must be closed on shutdown; dropping it has the same effect.
pub struct Subscription {
    topic: String,
    receiver: UnboundedReceiver<Vec<u8>>,
    on_close: Option<CloseHook>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, receiver: UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            on_close: None,
        }
    }

    /// Attach a hook run once when the subscription closes (e.g. stop a
    /// transport listener task).
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next payload; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    /// Take a payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving. Publishers drop this subscriber on their next send.
    pub fn close(&mut self) {
        self.receiver.close();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Topic-addressed publish/subscribe transport.
///
/// Implementations must be safe to share across tasks; any number of
/// publishers may publish concurrently.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError>;
}

#[async_trait]
impl<B> PubSub for Arc<B>
where
    B: PubSub + ?Sized,
{
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
        (**self).publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        (**self).subscribe(topic).await
    }
}
