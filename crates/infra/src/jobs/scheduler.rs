//! The job scheduler.
//!
//! One run loop per process decides when and how many jobs run; each execution
//! is an independent tracked task. All scheduler-wide read-modify-write steps
//! run under the global lock so any number of instances can share one store.
//!
//! ## Run loop
//!
//! Each iteration waits on one of:
//! - shutdown (the cancellation token passed to [`Scheduler::run`]),
//! - a "recheck" signal (a job was submitted or finished),
//! - a cross-instance cancel request,
//! - the adaptive timer.
//!
//! On a timer tick the loop claims up to `max_running - count_running` ready
//! jobs. When more jobs were ready than could be claimed, the timer is armed
//! *edgy* so the next finishing job triggers another poll right away.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use jobforge_core::{CronSchedule, Definition, DomainError, Job, JobProgress, JobState, JobUid};
use jobforge_events::{
    PubSub, PubSubError, StateChangeSubscription, Subscription, TOPIC_CANCEL_JOB, TOPIC_STATE_CHANGE,
    encode_state_change, subscribe_state_changes,
};

use super::executor::{Executor, ExecutorError, Handler, JobContext};
use super::maintenance::{
    DEADLINE_EXCEEDED, JOB_CRON_OVERDUE, JOB_CRON_PURGE, JOB_TYPE_OVERDUE, JOB_TYPE_PURGE,
    JOB_UID_OVERDUE, JOB_UID_PURGE, MAINTENANCE_MAX_DURATION, OverdueReclaimer, Purger,
};
use super::progress::ProgressReporter;
use super::store::{JobStore, JobStoreError};
use super::timer::SchedulerTimer;
use crate::config::SchedulerConfig;
use crate::lock::{self, LockError, MutexManager};

/// How far out the timer is armed when the store knows no future due time.
pub const DEFAULT_NEXT_TICK: Duration = Duration::from_secs(60);

/// Failure message recorded on a cancelled execution.
pub const JOB_CANCELED: &str = "job canceled";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job scheduler already started")]
    AlreadyStarted,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    PubSub(#[from] PubSubError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Sender side of the run loop's "recheck" wake-up source.
///
/// `Some(t)`: work is due at `t`. `None`: something finished, which only
/// matters if the last poll left ready work behind.
#[derive(Debug, Clone)]
pub struct SchedulerSignal {
    tx: mpsc::UnboundedSender<Option<DateTime<Utc>>>,
}

impl SchedulerSignal {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Option<DateTime<Utc>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn reschedule(&self, next: Option<DateTime<Utc>>) {
        // Fails only once the run loop is gone, when there is nothing to wake.
        let _ = self.tx.send(next);
    }
}

type SignalReceiver = mpsc::UnboundedReceiver<Option<DateTime<Utc>>>;

/// Result of one poll of the store.
#[derive(Debug, Default)]
struct Poll {
    claimed: Vec<Job>,
    next: Option<DateTime<Utc>>,
    got_all: bool,
}

struct Inner {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn MutexManager>,
    pubsub: Arc<dyn PubSub>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
    signal: SchedulerSignal,
    signal_rx: Mutex<Option<SignalReceiver>>,
    running: Mutex<HashMap<JobUid, CancellationToken>>,
    tracker: TaskTracker,
}

/// Background job scheduler. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn MutexManager>,
        pubsub: Arc<dyn PubSub>,
        config: SchedulerConfig,
    ) -> Self {
        let (signal, signal_rx) = SchedulerSignal::channel();
        Self {
            inner: Arc::new(Inner {
                store,
                locks,
                pubsub,
                executor: Arc::new(Executor::new()),
                config,
                signal,
                signal_rx: Mutex::new(Some(signal_rx)),
                running: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Register a handler; must happen before [`Scheduler::run`].
    pub fn register<H>(&self, job_type: impl Into<String>, handler: H) -> Result<(), SchedulerError>
    where
        H: Handler + 'static,
    {
        Ok(self.inner.executor.register(job_type, handler)?)
    }

    pub fn signal(&self) -> SchedulerSignal {
        self.inner.signal.clone()
    }

    /// Number of executions currently running on this instance.
    pub fn running_locally(&self) -> usize {
        self.running_map().len()
    }

    /// Submit a one-off job under a freshly generated UID.
    ///
    /// The job starts before this returns if a concurrency slot is free;
    /// otherwise the run loop picks it up later.
    #[instrument(skip(self, data), err)]
    pub async fn run_job(
        &self,
        job_type: &str,
        max_retries: i32,
        timeout: Duration,
        data: impl Into<String> + Send,
    ) -> Result<JobUid, SchedulerError> {
        self.run_definition(Definition {
            uid: JobUid::generate(),
            job_type: job_type.to_string(),
            max_retries,
            timeout,
            data: data.into(),
        })
        .await
    }

    /// Submit a one-off job described by `definition`.
    pub async fn run_definition(&self, definition: Definition) -> Result<JobUid, SchedulerError> {
        let now = Utc::now();
        let mut job = definition.into_job(now)?;
        let uid = job.uid.clone();

        let mutex = lock::acquire_global(&*self.inner.locks).await?;
        let dispatched = self.admit(&mut job, now).await;
        lock::release(mutex).await;

        if dispatched? {
            debug!(job_uid = %uid, job_type = %job.job_type, "job started immediately");
            self.publish_state_change(&job).await;
            self.spawn_execution(job);
        } else {
            debug!(job_uid = %uid, job_type = %job.job_type, "job queued");
            self.inner.signal.reschedule(Some(job.scheduled_at));
        }

        Ok(uid)
    }

    /// Submit several one-off jobs under `group_id`.
    ///
    /// Every definition is validated before any job is stored, so one invalid
    /// definition rejects the whole batch. The jobs are queued rather than
    /// started inline and the run loop is woken once for all of them.
    #[instrument(skip(self, definitions), fields(count = definitions.len()), err)]
    pub async fn run_jobs(
        &self,
        group_id: &str,
        definitions: Vec<Definition>,
    ) -> Result<Vec<JobUid>, SchedulerError> {
        if definitions.is_empty() {
            return Ok(Vec::new());
        }
        require_group_id(group_id)?;

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !seen.insert(definition.uid.clone()) {
                return Err(DomainError::validation(format!(
                    "duplicate job uid in group: {}",
                    definition.uid
                ))
                .into());
            }
            let mut job = definition.into_job(now)?;
            job.group_id = group_id.to_string();
            jobs.push(job);
        }

        for job in &jobs {
            self.inner.store.create(job).await?;
        }
        debug!(group_id, count = jobs.len(), "job group queued");

        self.inner.signal.reschedule(Some(now));
        Ok(jobs.into_iter().map(|job| job.uid).collect())
    }

    /// Create or update a recurring job, idempotent by `uid`.
    #[instrument(skip(self, uid, job_type), err)]
    pub async fn add_recurring(
        &self,
        uid: impl Into<JobUid> + Send,
        job_type: impl Into<String> + Send,
        cron_expr: &str,
        max_duration: Duration,
    ) -> Result<(), SchedulerError> {
        let cron = CronSchedule::parse(cron_expr)?;
        let job = Job::recurring(uid, job_type, &cron, max_duration, Utc::now())?;

        self.inner.store.upsert(&job).await?;
        debug!(job_uid = %job.uid, next = %job.scheduled_at, "recurring job registered");

        self.inner.signal.reschedule(Some(job.scheduled_at));
        Ok(())
    }

    /// Request cancellation of a job.
    ///
    /// A job running on this instance is cancelled directly; otherwise the
    /// request is broadcast to the other instances. There is no
    /// acknowledgement: confirm through [`Scheduler::get_job_progress`].
    #[instrument(skip(self), fields(job_uid = %uid), err)]
    pub async fn cancel_job(&self, uid: &JobUid) -> Result<(), SchedulerError> {
        if self.cancel_local(uid.as_str()) {
            info!(job_uid = %uid, "cancelled running job");
            return Ok(());
        }

        self.inner
            .pubsub
            .publish(TOPIC_CANCEL_JOB, uid.as_str().as_bytes().to_vec())
            .await?;
        Ok(())
    }

    pub async fn get_job_progress(&self, uid: &JobUid) -> Result<JobProgress, SchedulerError> {
        Ok(self.inner.store.find(uid).await?.progress())
    }

    /// Progress of every job submitted under `group_id`, oldest first.
    pub async fn get_job_progress_for_group(
        &self,
        group_id: &str,
    ) -> Result<Vec<(JobUid, JobProgress)>, SchedulerError> {
        require_group_id(group_id)?;
        let jobs = self.inner.store.list_by_group_id(group_id).await?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let progress = job.progress();
                (job.uid, progress)
            })
            .collect())
    }

    /// Delete a single job record.
    pub async fn purge_job(&self, uid: &JobUid) -> Result<(), SchedulerError> {
        Ok(self.inner.store.delete_by_uid(uid).await?)
    }

    /// Delete every job submitted under `group_id`; returns how many went.
    #[instrument(skip(self), err)]
    pub async fn purge_jobs_by_group_id(&self, group_id: &str) -> Result<u64, SchedulerError> {
        require_group_id(group_id)?;
        Ok(self.inner.store.delete_by_group_id(group_id).await?)
    }

    pub async fn subscribe_state_changes(&self) -> Result<StateChangeSubscription, SchedulerError> {
        Ok(subscribe_state_changes(&*self.inner.pubsub).await?)
    }

    /// Run the scheduler until `shutdown` is cancelled.
    ///
    /// Once a run has started, further calls fail with `AlreadyStarted`. A run
    /// that fails during startup may be retried. In-flight jobs keep running
    /// after this returns, see [`Scheduler::wait_jobs_done`].
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let mut signals = self.take_signal_receiver()?;
        let mut cancellations = match self.start_up().await {
            Ok(cancellations) => cancellations,
            Err(error) => {
                self.restore_signal_receiver(signals);
                return Err(error);
            }
        };

        let mut timer = SchedulerTimer::new();

        info!(
            instance_id = %self.inner.config.instance_id,
            max_running = self.inner.config.max_running,
            "job scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(next) = signals.recv() => {
                    timer.reschedule_earlier(next);
                }
                Some(payload) = cancellations.recv() => {
                    self.handle_cancel_message(&payload);
                }
                _ = timer.tick() => {
                    let (next, got_all) = match AssertUnwindSafe(self.process_ready_jobs())
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(panic) => {
                            error!(panic = %panic_message(&*panic), "job scheduler tick panicked");
                            (None, false)
                        }
                    };

                    let next = next.unwrap_or_else(|| time_after(Utc::now(), DEFAULT_NEXT_TICK));
                    timer.reset_at(next, !got_all);
                }
            }
        }

        cancellations.close();
        info!("job scheduler stopped");
        Ok(())
    }

    /// Wait for in-flight executions on this instance to finish, or for
    /// `interrupt` to be cancelled.
    pub async fn wait_jobs_done(&self, interrupt: CancellationToken) {
        self.inner.tracker.close();
        tokio::select! {
            _ = self.inner.tracker.wait() => info!("job scheduler gracefully stopped"),
            _ = interrupt.cancelled() => {
                warn!(in_flight = self.inner.tracker.len(), "job scheduler stop interrupted");
            }
        }
    }

    /// Subscribe to cancel requests and make sure the maintenance jobs and
    /// their handlers exist.
    async fn start_up(&self) -> Result<Subscription, SchedulerError> {
        let cancellations = self.inner.pubsub.subscribe(TOPIC_CANCEL_JOB).await?;

        self.ensure_maintenance_jobs().await?;
        self.register_maintenance_handlers()?;
        self.inner.executor.finish_registration();

        Ok(cancellations)
    }

    fn signal_slot(&self) -> MutexGuard<'_, Option<SignalReceiver>> {
        match self.inner.signal_rx.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_signal_receiver(&self) -> Result<SignalReceiver, SchedulerError> {
        self.signal_slot().take().ok_or(SchedulerError::AlreadyStarted)
    }

    fn restore_signal_receiver(&self, signals: SignalReceiver) {
        *self.signal_slot() = Some(signals);
    }

    async fn ensure_maintenance_jobs(&self) -> Result<(), SchedulerError> {
        let mutex = lock::acquire_global(&*self.inner.locks).await?;
        let outcome = self.add_maintenance_jobs().await;
        lock::release(mutex).await;
        outcome
    }

    async fn add_maintenance_jobs(&self) -> Result<(), SchedulerError> {
        self.add_recurring(JOB_UID_PURGE, JOB_TYPE_PURGE, JOB_CRON_PURGE, MAINTENANCE_MAX_DURATION)
            .await?;
        self.add_recurring(
            JOB_UID_OVERDUE,
            JOB_TYPE_OVERDUE,
            JOB_CRON_OVERDUE,
            MAINTENANCE_MAX_DURATION,
        )
        .await
    }

    fn register_maintenance_handlers(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if !inner.executor.is_registered(JOB_TYPE_PURGE) {
            inner.executor.register(
                JOB_TYPE_PURGE,
                Purger::new(inner.store.clone(), inner.locks.clone(), inner.config.purge_min_old_age),
            )?;
        }
        if !inner.executor.is_registered(JOB_TYPE_OVERDUE) {
            inner.executor.register(
                JOB_TYPE_OVERDUE,
                OverdueReclaimer::new(
                    inner.store.clone(),
                    inner.locks.clone(),
                    inner.pubsub.clone(),
                    inner.signal.clone(),
                ),
            )?;
        }
        Ok(())
    }

    /// Persist a new job, claiming it right away if a slot is free.
    async fn admit(&self, job: &mut Job, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let running = self.inner.store.count_running().await?;
        let dispatch = running < self.inner.config.max_running;
        if dispatch {
            job.mark_running(&self.inner.config.instance_id, now);
        }
        self.inner.store.create(job).await?;
        Ok(dispatch)
    }

    /// Returns the next due time (if known) and whether every ready job was
    /// claimed.
    async fn process_ready_jobs(&self) -> (Option<DateTime<Utc>>, bool) {
        let mutex = match lock::acquire_global(&*self.inner.locks).await {
            Ok(mutex) => mutex,
            Err(error) => {
                error!(%error, "failed to obtain global lock to process ready jobs");
                return (None, false);
            }
        };
        let outcome = self.claim_ready_jobs(Utc::now()).await;
        lock::release(mutex).await;

        match outcome {
            Ok(poll) => {
                for job in poll.claimed {
                    self.publish_state_change(&job).await;
                    self.spawn_execution(job);
                }
                (poll.next, poll.got_all)
            }
            Err(error) => {
                error!(%error, "failed to process ready jobs");
                (None, false)
            }
        }
    }

    async fn claim_ready_jobs(&self, now: DateTime<Utc>) -> Result<Poll, SchedulerError> {
        let store = &self.inner.store;

        let running = store.count_running().await?;
        let available = self.inner.config.max_running.saturating_sub(running);

        let mut ready = store.list_ready(now, available + 1).await?;
        let mut poll = Poll {
            got_all: true,
            ..Poll::default()
        };
        if ready.len() > available {
            ready.truncate(available);
            poll.got_all = false;
        } else {
            poll.next = store.next_scheduled_time(now).await?;
        }

        for mut job in ready {
            job.mark_running(&self.inner.config.instance_id, now);
            if let Err(error) = store.update_execution(&job).await {
                warn!(job_uid = %job.uid, %error, "failed to claim job");
                poll.next = None;
                poll.got_all = false;
                continue;
            }
            poll.claimed.push(job);
        }

        Ok(poll)
    }

    fn spawn_execution(&self, job: Job) {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            let started = Instant::now();
            let (result, failure) = this.execute(&job).await;
            this.complete_execution(&job, result, failure, started.elapsed())
                .await;
        });
    }

    /// Run the handler, bounded by the job's deadline and cancellation.
    async fn execute(&self, job: &Job) -> (String, Option<String>) {
        let cancel = CancellationToken::new();
        if !self.track_running(&job.uid, cancel.clone()) {
            return (
                String::new(),
                Some("failed to start: already running".to_string()),
            );
        }

        let max_duration = job.max_duration();
        let ctx = JobContext {
            uid: job.uid.clone(),
            job_type: job.job_type.clone(),
            deadline: job
                .run_deadline
                .unwrap_or_else(|| time_after(Utc::now(), max_duration)),
            cancel: cancel.clone(),
            progress: ProgressReporter::new(
                job.uid.clone(),
                self.inner.store.clone(),
                self.inner.pubsub.clone(),
            ),
        };

        let executor = self.inner.executor.clone();
        let data = job.data.clone();
        let handle = tokio::spawn(async move { executor.exec(ctx, data).await });
        let abort = handle.abort_handle();

        let outcome = tokio::select! {
            joined = handle => match joined {
                Ok(Ok(result)) => (result, None),
                Ok(Err(error)) => (String::new(), Some(error.to_string())),
                Err(join_error) if join_error.is_panic() => {
                    let panic = join_error.into_panic();
                    (String::new(), Some(format!("job panicked: {}", panic_message(&*panic))))
                }
                Err(join_error) => (String::new(), Some(format!("job aborted: {join_error}"))),
            },
            _ = cancel.cancelled() => {
                abort.abort();
                (String::new(), Some(JOB_CANCELED.to_string()))
            }
            _ = tokio::time::sleep(max_duration) => {
                cancel.cancel();
                abort.abort();
                (String::new(), Some(DEADLINE_EXCEEDED.to_string()))
            }
        };

        self.untrack_running(&job.uid);
        outcome
    }

    async fn complete_execution(
        &self,
        claimed: &Job,
        result: String,
        failure: Option<String>,
        elapsed: Duration,
    ) {
        // Proceed without the lock rather than leave the job "running" forever.
        let mutex = match lock::acquire_global(&*self.inner.locks).await {
            Ok(mutex) => Some(mutex),
            Err(error) => {
                error!(
                    job_uid = %claimed.uid,
                    %error,
                    "failed to obtain global lock; updating job state anyway"
                );
                None
            }
        };
        let outcome = self.persist_result(&claimed.uid, result, failure).await;
        if let Some(mutex) = mutex {
            lock::release(mutex).await;
        }

        let duration_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(Some(job)) => {
                if job.last_failure_error.is_empty() {
                    info!(
                        job_uid = %job.uid,
                        job_type = %job.job_type,
                        state = %job.state,
                        duration_ms,
                        "job execution finished"
                    );
                } else {
                    warn!(
                        job_uid = %job.uid,
                        job_type = %job.job_type,
                        state = %job.state,
                        duration_ms,
                        error = %job.last_failure_error,
                        "job execution failed"
                    );
                }

                self.publish_state_change(&job).await;

                match job.state {
                    JobState::Scheduled => self.inner.signal.reschedule(Some(job.scheduled_at)),
                    _ => self.inner.signal.reschedule(None),
                }
            }
            Ok(None) => {
                debug!(
                    job_uid = %claimed.uid,
                    duration_ms,
                    "job no longer owned by this instance; execution result dropped"
                );
                self.inner.signal.reschedule(None);
            }
            Err(error) => {
                error!(job_uid = %claimed.uid, %error, "failed to update job after execution");
                self.inner.signal.reschedule(None);
            }
        }
    }

    async fn persist_result(
        &self,
        uid: &JobUid,
        result: String,
        failure: Option<String>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut job = self.inner.store.find(uid).await?;
        if job.run_by != self.inner.config.instance_id {
            return Ok(None);
        }
        if !job.apply_execution_result(result, failure, Utc::now()) {
            return Ok(None);
        }
        self.inner.store.update_execution(&job).await?;
        Ok(Some(job))
    }

    async fn publish_state_change(&self, job: &Job) {
        let payload = match encode_state_change(&job.state_change()) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(job_uid = %job.uid, %error, "failed to encode job state change");
                return;
            }
        };
        if let Err(error) = self.inner.pubsub.publish(TOPIC_STATE_CHANGE, payload).await {
            warn!(job_uid = %job.uid, %error, "failed to publish job state change");
        }
    }

    fn handle_cancel_message(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        match std::str::from_utf8(payload) {
            Ok(uid) => {
                if self.cancel_local(uid) {
                    info!(job_uid = %uid, "cancelled running job on request");
                }
            }
            Err(error) => warn!(%error, "ignoring malformed job cancel request"),
        }
    }

    fn cancel_local(&self, uid: &str) -> bool {
        match self.running_map().get(uid) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn track_running(&self, uid: &JobUid, cancel: CancellationToken) -> bool {
        let mut running = self.running_map();
        if running.contains_key(uid) {
            return false;
        }
        running.insert(uid.clone(), cancel);
        true
    }

    fn untrack_running(&self, uid: &JobUid) {
        self.running_map().remove(uid);
    }

    fn running_map(&self) -> MutexGuard<'_, HashMap<JobUid, CancellationToken>> {
        // Entries are inserted/removed atomically; a poisoned map is still consistent.
        match self.inner.running.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("executor", &self.inner.executor)
            .finish_non_exhaustive()
    }
}

/// `now + d`, saturating at the latest representable time.
fn time_after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn require_group_id(group_id: &str) -> Result<(), SchedulerError> {
    if group_id.trim().is_empty() {
        return Err(DomainError::validation("job group id must not be empty").into());
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
