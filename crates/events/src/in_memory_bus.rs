//! In-memory pub/sub for tests/dev and single-instance deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{PubSub, PubSubError, Subscription};

/// In-memory pub/sub.
///
/// - No IO
/// - Best-effort fan-out per topic
/// - Closed subscribers are dropped lazily on the next publish
#[derive(Debug, Default)]
pub struct InMemoryPubSub {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| {
                topics
                    .get(topic)
                    .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
        let mut topics = self.topics.lock().map_err(|_| PubSubError::Poisoned)?;

        if let Some(subs) = topics.get_mut(topic) {
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(payload.clone()).is_ok());
        }

        tracing::trace!(topic, bytes = payload.len(), "published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.topics
            .lock()
            .map_err(|_| PubSubError::Poisoned)?
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        Ok(Subscription::new(topic, rx))
    }
}
