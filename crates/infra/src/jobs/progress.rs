//! Progress reporting from inside a running handler.

use std::sync::Arc;

use chrono::Utc;

use jobforge_core::{JobUid, clamp_progress};
use jobforge_events::{PubSub, TOPIC_STATE_CHANGE, encode_state_change};

use super::store::{JobStore, JobStoreError};

/// Handle given to a handler to persist and broadcast its progress.
#[derive(Clone)]
pub struct ProgressReporter {
    uid: JobUid,
    store: Arc<dyn JobStore>,
    pubsub: Arc<dyn PubSub>,
}

impl ProgressReporter {
    pub fn new(uid: JobUid, store: Arc<dyn JobStore>, pubsub: Arc<dyn PubSub>) -> Self {
        Self { uid, store, pubsub }
    }

    /// Record `progress` (clamped to `0..=100`) and an interim `result`.
    ///
    /// Fails with `NotFound` once the job is no longer running. A failed
    /// broadcast is only logged.
    pub async fn report(&self, progress: i64, result: &str) -> Result<(), JobStoreError> {
        let job = self
            .store
            .update_progress(&self.uid, clamp_progress(progress), result, Utc::now())
            .await?;

        match encode_state_change(&job.state_change()) {
            Ok(payload) => {
                if let Err(error) = self.pubsub.publish(TOPIC_STATE_CHANGE, payload).await {
                    tracing::warn!(job_uid = %self.uid, %error, "failed to broadcast job progress");
                }
            }
            Err(error) => {
                tracing::warn!(job_uid = %self.uid, %error, "failed to encode job progress");
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressReporter").field("uid", &self.uid).finish_non_exhaustive()
    }
}
