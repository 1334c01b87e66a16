//! Wire codec for [`JobStateChange`] broadcasts.

use jobforge_core::JobStateChange;

use crate::TOPIC_STATE_CHANGE;
use crate::bus::{PubSub, PubSubError, Subscription};

pub fn encode_state_change(change: &JobStateChange) -> Result<Vec<u8>, PubSubError> {
    serde_json::to_vec(change).map_err(|e| PubSubError::Codec(e.to_string()))
}

pub fn decode_state_change(payload: &[u8]) -> Result<JobStateChange, PubSubError> {
    serde_json::from_slice(payload).map_err(|e| PubSubError::Codec(e.to_string()))
}

/// Decoding view over a [`TOPIC_STATE_CHANGE`] subscription.
#[derive(Debug)]
pub struct StateChangeSubscription {
    inner: Subscription,
}

impl StateChangeSubscription {
    /// Next decodable state change; malformed payloads are logged and skipped.
    pub async fn recv(&mut self) -> Option<JobStateChange> {
        loop {
            let payload = self.inner.recv().await?;
            match decode_state_change(&payload) {
                Ok(change) => return Some(change),
                Err(error) => {
                    tracing::warn!(%error, "dropping undecodable job state change");
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

/// Subscribe to job state-change broadcasts.
pub async fn subscribe_state_changes<P>(pubsub: &P) -> Result<StateChangeSubscription, PubSubError>
where
    P: PubSub + ?Sized,
{
    let inner = pubsub.subscribe(TOPIC_STATE_CHANGE).await?;
    Ok(StateChangeSubscription { inner })
}
