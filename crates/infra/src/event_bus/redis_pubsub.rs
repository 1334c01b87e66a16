//! Redis pub/sub transport (optional).
//!
//! Note: Redis pub/sub is not durable (messages are dropped while a subscriber
//! is offline). That matches the fire-and-forget contract of job cancellation
//! and state-change notifications.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use jobforge_events::{PubSub, PubSubError, Subscription};

/// Redis pub/sub transport. Topic names are used as channel names verbatim.
#[derive(Debug, Clone)]
pub struct RedisPubSub {
    client: redis::Client,
}

impl RedisPubSub {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, PubSubError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| PubSubError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PubSubError::Transport(e.to_string()))?;

        let _: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| PubSubError::Transport(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| PubSubError::Transport(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| PubSubError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = topic.to_string();

        // Background task that receives pub/sub messages and forwards them.
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(error) => {
                        tracing::warn!(channel = %channel, %error, "undecodable redis message");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    return;
                }
            }
            tracing::debug!(channel = %channel, "redis subscription stream ended");
        });
        let abort = forwarder.abort_handle();

        Ok(Subscription::new(topic, rx).with_close_hook(move || abort.abort()))
    }
}
