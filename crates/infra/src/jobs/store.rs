//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{Job, JobState, JobUid};

/// Job store abstraction.
///
/// The store is the single source of truth shared by every scheduler
/// instance. Callers serialize scheduler-wide read-modify-write sequences with
/// the global lock; the store itself only guarantees per-call atomicity.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Get a job by UID.
    async fn find(&self, uid: &JobUid) -> Result<Job, JobStoreError>;

    /// Insert a new job; fails if the UID is taken.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Insert, or rewrite an existing job only if its definition changed.
    async fn upsert(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Persist the execution fields of an existing job.
    async fn update_execution(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Record progress (and an interim result) of a running job.
    async fn update_progress(
        &self,
        uid: &JobUid,
        progress: u8,
        result: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Number of jobs currently `Running` on any instance.
    async fn count_running(&self) -> Result<usize, JobStoreError>;

    /// `Scheduled` jobs due at `now`, highest priority first, then by due time.
    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// `Running` jobs whose deadline has passed.
    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Earliest due time of a `Scheduled` job strictly after `now`.
    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError>;

    /// Delete non-recurring terminal jobs last executed before `older_than`.
    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError>;

    async fn delete_by_uid(&self, uid: &JobUid) -> Result<(), JobStoreError>;

    /// Every job submitted under `group_id`, oldest first.
    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, JobStoreError>;

    /// Delete every job submitted under `group_id`, returning how many went.
    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobUid),
    #[error("job already exists: {0}")]
    AlreadyExists(JobUid),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn find(&self, uid: &JobUid) -> Result<Job, JobStoreError> {
        (**self).find(uid).await
    }

    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).create(job).await
    }

    async fn upsert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).upsert(job).await
    }

    async fn update_execution(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update_execution(job).await
    }

    async fn update_progress(
        &self,
        uid: &JobUid,
        progress: u8,
        result: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).update_progress(uid, progress, result, now).await
    }

    async fn count_running(&self) -> Result<usize, JobStoreError> {
        (**self).count_running().await
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_ready(now, limit).await
    }

    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_deadline_exceeded(now).await
    }

    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        (**self).next_scheduled_time(now).await
    }

    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).delete_old(older_than).await
    }

    async fn delete_by_uid(&self, uid: &JobUid) -> Result<(), JobStoreError> {
        (**self).delete_by_uid(uid).await
    }

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_group_id(group_id).await
    }

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, JobStoreError> {
        (**self).delete_by_group_id(group_id).await
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobUid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every stored job, ordered by UID.
    pub fn all(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.read()?.values().cloned().collect();
        jobs.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(jobs)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobUid, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobUid, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find(&self, uid: &JobUid) -> Result<Job, JobStoreError> {
        self.read()?
            .get(uid)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(uid.clone()))
    }

    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.uid) {
            return Err(JobStoreError::AlreadyExists(job.uid.clone()));
        }
        jobs.insert(job.uid.clone(), job.clone());
        Ok(())
    }

    async fn upsert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.uid) {
            Some(existing) if !existing.definition_differs(job) => {}
            Some(existing) => {
                existing.updated_at = job.updated_at;
                existing.group_id = job.group_id.clone();
                existing.job_type = job.job_type.clone();
                existing.priority = job.priority;
                existing.data = job.data.clone();
                existing.result = job.result.clone();
                existing.max_duration_seconds = job.max_duration_seconds;
                existing.max_retries = job.max_retries;
                existing.state = job.state;
                existing.scheduled_at = job.scheduled_at;
                existing.is_recurring = job.is_recurring;
                existing.recurring_cron = job.recurring_cron.clone();
            }
            None => {
                jobs.insert(job.uid.clone(), job.clone());
            }
        }
        Ok(())
    }

    async fn update_execution(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let existing = jobs
            .get_mut(&job.uid)
            .ok_or_else(|| JobStoreError::NotFound(job.uid.clone()))?;

        existing.updated_at = job.updated_at;
        existing.result = job.result.clone();
        existing.state = job.state;
        existing.scheduled_at = job.scheduled_at;
        existing.total_executions = job.total_executions;
        existing.run_by = job.run_by.clone();
        existing.run_deadline = job.run_deadline;
        existing.run_progress = job.run_progress;
        existing.last_executed = job.last_executed;
        existing.consecutive_failures = job.consecutive_failures;
        existing.last_failure_error = job.last_failure_error.clone();
        existing.max_duration_seconds = job.max_duration_seconds;
        Ok(())
    }

    async fn update_progress(
        &self,
        uid: &JobUid,
        progress: u8,
        result: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(uid) {
            Some(job) if job.state == JobState::Running => {
                job.updated_at = now;
                job.run_progress = progress;
                job.result = result.to_string();
                Ok(job.clone())
            }
            _ => Err(JobStoreError::NotFound(uid.clone())),
        }
    }

    async fn count_running(&self) -> Result<usize, JobStoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|j| j.state == JobState::Running)
            .count())
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut ready: Vec<&Job> = jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled && j.scheduled_at <= now)
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                .then_with(|| a.uid.cmp(&b.uid))
        });

        Ok(ready.into_iter().take(limit).cloned().collect())
    }

    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut overdue: Vec<Job> = jobs.values().filter(|j| j.is_overdue(now)).cloned().collect();
        overdue.sort_by_key(|j| j.run_deadline);
        Ok(overdue)
    }

    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|j| j.state == JobState::Scheduled && j.scheduled_at > now)
            .map(|j| j.scheduled_at)
            .min())
    }

    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| {
            let purgeable = j.state.is_terminal()
                && !j.is_recurring
                && j.last_executed.is_some_and(|at| at < older_than);
            !purgeable
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn delete_by_uid(&self, uid: &JobUid) -> Result<(), JobStoreError> {
        self.write()?
            .remove(uid)
            .map(|_| ())
            .ok_or_else(|| JobStoreError::NotFound(uid.clone()))
    }

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, JobStoreError> {
        let mut grouped: Vec<Job> = self
            .read()?
            .values()
            .filter(|j| j.group_id == group_id)
            .cloned()
            .collect();
        grouped.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uid.cmp(&b.uid)));
        Ok(grouped)
    }

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| j.group_id != group_id);
        Ok((before - jobs.len()) as u64)
    }
}
