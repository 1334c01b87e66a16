//! Self-registering maintenance jobs run through the ordinary dispatch path.
//!
//! - **overdue**: reclaims jobs stuck `Running` past their deadline (a crashed
//!   instance, or a completion write that never landed).
//! - **purge**: deletes terminal one-off jobs older than the retention age.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_events::{PubSub, TOPIC_STATE_CHANGE, encode_state_change};

use super::executor::{Handler, HandlerError, JobContext};
use super::scheduler::SchedulerSignal;
use super::store::{JobStore, JobStoreError};
use crate::lock::{self, MutexManager};

pub const JOB_UID_OVERDUE: &str = "jobs:overdue";
pub const JOB_TYPE_OVERDUE: &str = "jobs:overdue";
pub const JOB_CRON_OVERDUE: &str = "*/20 * * * *";

pub const JOB_UID_PURGE: &str = "jobs:purge";
pub const JOB_TYPE_PURGE: &str = "jobs:purge";
pub const JOB_CRON_PURGE: &str = "15 */4 * * *";

/// Execution window of either maintenance job.
pub const MAINTENANCE_MAX_DURATION: Duration = Duration::from_secs(5);

/// Failure message recorded on reclaimed jobs.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Reclaims jobs whose run deadline passed while still `Running`.
pub struct OverdueReclaimer {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn MutexManager>,
    pubsub: Arc<dyn PubSub>,
    signal: SchedulerSignal,
}

impl OverdueReclaimer {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn MutexManager>,
        pubsub: Arc<dyn PubSub>,
        signal: SchedulerSignal,
    ) -> Self {
        Self {
            store,
            locks,
            pubsub,
            signal,
        }
    }

    /// Apply the failure path to every overdue job; returns how many were
    /// reclaimed and the earliest time any of them is due again.
    pub async fn reclaim(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, Option<DateTime<Utc>>), JobStoreError> {
        let overdue = self.store.list_deadline_exceeded(now).await?;

        let mut reclaimed = 0;
        let mut earliest: Option<DateTime<Utc>> = None;

        for mut job in overdue {
            if !job.apply_execution_result(String::new(), Some(DEADLINE_EXCEEDED.to_string()), now) {
                continue;
            }

            if let Err(error) = self.store.update_execution(&job).await {
                tracing::warn!(job_uid = %job.uid, %error, "failed to reclaim overdue job");
                continue;
            }

            reclaimed += 1;
            if job.state == jobforge_core::JobState::Scheduled {
                earliest = Some(earliest.map_or(job.scheduled_at, |t| t.min(job.scheduled_at)));
            }

            tracing::info!(
                job_uid = %job.uid,
                job_type = %job.job_type,
                state = %job.state,
                "reclaimed overdue job"
            );

            match encode_state_change(&job.state_change()) {
                Ok(payload) => {
                    if let Err(error) = self.pubsub.publish(TOPIC_STATE_CHANGE, payload).await {
                        tracing::warn!(job_uid = %job.uid, %error, "failed to publish state change");
                    }
                }
                Err(error) => tracing::warn!(job_uid = %job.uid, %error, "failed to encode state change"),
            }
        }

        Ok((reclaimed, earliest))
    }
}

#[async_trait]
impl Handler for OverdueReclaimer {
    async fn handle(&self, _ctx: JobContext, _data: String) -> Result<String, HandlerError> {
        let mutex = lock::acquire_global(&*self.locks)
            .await
            .map_err(|e| HandlerError::new(format!("failed to obtain global lock: {e}")))?;
        let outcome = self.reclaim(Utc::now()).await;
        lock::release(mutex).await;

        let (reclaimed, earliest) =
            outcome.map_err(|e| HandlerError::new(format!("failed to list overdue jobs: {e}")))?;

        if let Some(next) = earliest {
            self.signal.reschedule(Some(next));
        }

        Ok(format!("reclaimed {reclaimed} overdue jobs"))
    }
}

/// Deletes terminal one-off jobs older than the retention age.
pub struct Purger {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn MutexManager>,
    min_old_age: Duration,
}

impl Purger {
    pub fn new(store: Arc<dyn JobStore>, locks: Arc<dyn MutexManager>, min_old_age: Duration) -> Self {
        Self {
            store,
            locks,
            min_old_age,
        }
    }

    /// Cut-off time: jobs last executed before it are purged.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.min_old_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl Handler for Purger {
    async fn handle(&self, _ctx: JobContext, _data: String) -> Result<String, HandlerError> {
        let mutex = lock::acquire_global(&*self.locks)
            .await
            .map_err(|e| HandlerError::new(format!("failed to obtain global lock: {e}")))?;
        let outcome = self.store.delete_old(self.cutoff(Utc::now())).await;
        lock::release(mutex).await;

        let deleted =
            outcome.map_err(|e| HandlerError::new(format!("failed to purge old jobs: {e}")))?;

        if deleted > 0 {
            tracing::info!(deleted, "purged old jobs");
        }
        Ok(format!("deleted {deleted} old jobs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::TimeZone;
    use jobforge_core::{Definition, JobState, JobUid};
    use jobforge_events::InMemoryPubSub;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn reclaims_jobs_past_their_deadline() {
        let store = InMemoryJobStore::arc();
        let pubsub = Arc::new(InMemoryPubSub::new());
        let (signal, _rx) = SchedulerSignal::channel();

        let mut retried = Definition {
            uid: JobUid::from("retry"),
            job_type: "t".into(),
            max_retries: 1,
            timeout: Duration::from_secs(10),
            data: String::new(),
        }
        .into_job(now())
        .unwrap();
        retried.mark_running("dead-instance", now() - chrono::Duration::minutes(5));
        store.create(&retried).await.unwrap();

        let mut final_failure = retried.clone();
        final_failure.uid = JobUid::from("final");
        final_failure.max_retries = 0;
        store.create(&final_failure).await.unwrap();

        let reclaimer = OverdueReclaimer::new(
            store.clone(),
            crate::lock::InMemoryMutexManager::arc(),
            pubsub,
            signal,
        );
        let (count, earliest) = reclaimer.reclaim(now()).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(earliest, Some(now() + chrono::Duration::seconds(15)));

        let retried = store.find(&JobUid::from("retry")).await.unwrap();
        assert_eq!(retried.state, JobState::Scheduled);
        assert_eq!(retried.last_failure_error, DEADLINE_EXCEEDED);

        let final_failure = store.find(&JobUid::from("final")).await.unwrap();
        assert_eq!(final_failure.state, JobState::Failed);
        assert!(final_failure.run_by.is_empty());
    }

    #[test]
    fn purge_cutoff_subtracts_retention_age() {
        let purger = Purger::new(
            InMemoryJobStore::arc(),
            crate::lock::InMemoryMutexManager::arc(),
            Duration::from_secs(3600),
        );
        assert_eq!(purger.cutoff(now()), now() - chrono::Duration::hours(1));
    }

    #[test]
    fn purge_cutoff_saturates_for_huge_retention_ages() {
        let purger = Purger::new(
            InMemoryJobStore::arc(),
            crate::lock::InMemoryMutexManager::arc(),
            Duration::from_secs(u64::MAX / 4),
        );
        assert_eq!(purger.cutoff(now()), DateTime::<Utc>::MIN_UTC);
    }
}
