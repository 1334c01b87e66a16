use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use jobforge_core::{CronSchedule, Definition, DomainError, Job, JobState, JobStateChange, JobUid};
use jobforge_events::{InMemoryPubSub, PubSub, StateChangeSubscription, TOPIC_CANCEL_JOB};
use jobforge_infra::jobs::maintenance::{
    DEADLINE_EXCEEDED, JOB_CRON_OVERDUE, JOB_TYPE_OVERDUE, JOB_UID_OVERDUE,
    MAINTENANCE_MAX_DURATION,
};
use jobforge_infra::jobs::scheduler::JOB_CANCELED;
use jobforge_infra::lock::{acquire_global, release};
use jobforge_infra::{
    Handler, HandlerError, InMemoryJobStore, InMemoryMutexManager, JobContext, JobStore,
    JobStoreError, LockError, Scheduler, SchedulerConfig, SchedulerError, handler_fn,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    scheduler: Scheduler,
    store: Arc<InMemoryJobStore>,
    locks: Arc<InMemoryMutexManager>,
    pubsub: Arc<InMemoryPubSub>,
}

impl Harness {
    fn new(max_running: usize) -> Self {
        Self::with_locks("test-instance", max_running, InMemoryMutexManager::arc())
    }

    fn with_locks(instance_id: &str, max_running: usize, locks: Arc<InMemoryMutexManager>) -> Self {
        Self::assemble(
            instance_id,
            max_running,
            InMemoryJobStore::arc(),
            locks,
            Arc::new(InMemoryPubSub::new()),
        )
    }

    /// A second scheduler instance sharing this one's store, lock and bus.
    fn sibling(&self, instance_id: &str, max_running: usize) -> Self {
        Self::assemble(
            instance_id,
            max_running,
            self.store.clone(),
            self.locks.clone(),
            self.pubsub.clone(),
        )
    }

    fn assemble(
        instance_id: &str,
        max_running: usize,
        store: Arc<InMemoryJobStore>,
        locks: Arc<InMemoryMutexManager>,
        pubsub: Arc<InMemoryPubSub>,
    ) -> Self {
        let scheduler = Scheduler::new(
            store.clone(),
            locks.clone(),
            pubsub.clone(),
            SchedulerConfig::default()
                .with_instance_id(instance_id)
                .with_max_running(max_running),
        );
        Self {
            scheduler,
            store,
            locks,
            pubsub,
        }
    }

    /// Wait until startup has created the maintenance jobs.
    async fn wait_started(&self) {
        tokio::time::timeout(WAIT, async {
            while self.store.find(&JobUid::from(JOB_UID_OVERDUE)).await.is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scheduler did not start");
    }

    async fn wait_running_locally(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.scheduler.running_locally() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("local execution count never reached");
    }

    fn start(&self) -> (CancellationToken, JoinHandle<Result<(), SchedulerError>>) {
        let shutdown = CancellationToken::new();
        let scheduler = self.scheduler.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(token).await });
        (shutdown, handle)
    }
}

/// Wait for the next state change of `uid` matching `accept`.
async fn wait_for(
    sub: &mut StateChangeSubscription,
    uid: &JobUid,
    accept: impl Fn(&JobStateChange) -> bool,
) -> JobStateChange {
    tokio::time::timeout(WAIT, async {
        loop {
            let change = sub.recv().await.expect("state change subscription closed");
            if &change.uid == uid && accept(&change) {
                return change;
            }
        }
    })
    .await
    .expect("timed out waiting for job state change")
}

fn is_terminal(change: &JobStateChange) -> bool {
    change.state.is_terminal()
}

async fn explode(_ctx: JobContext, _data: String) -> Result<String, HandlerError> {
    panic!("kaboom")
}

fn definition(uid: &str, job_type: &str, data: &str) -> Definition {
    Definition {
        uid: JobUid::from(uid),
        job_type: job_type.to_string(),
        max_retries: 0,
        timeout: Duration::from_secs(10),
        data: data.to_string(),
    }
}

/// Collect the terminal state change of every job in `uids`.
async fn wait_all_terminal(
    sub: &mut StateChangeSubscription,
    uids: &[JobUid],
) -> HashMap<JobUid, JobStateChange> {
    tokio::time::timeout(WAIT, async {
        let mut done = HashMap::new();
        while done.len() < uids.len() {
            let change = sub.recv().await.expect("state change subscription closed");
            if uids.contains(&change.uid) && change.state.is_terminal() {
                done.insert(change.uid.clone(), change);
            }
        }
        done
    })
    .await
    .expect("timed out waiting for jobs to finish")
}

/// Handler that records how many executions overlap across instances.
fn overlap_counter(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> impl Handler {
    handler_fn(move |_ctx, _data| {
        let active = active.clone();
        let peak = peak.clone();
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(String::new())
        }
    })
}

/// Job store whose first poll for ready jobs panics.
struct PanicsOnFirstPoll {
    inner: Arc<InMemoryJobStore>,
    armed: AtomicBool,
}

#[async_trait]
impl JobStore for PanicsOnFirstPoll {
    async fn find(&self, uid: &JobUid) -> Result<Job, JobStoreError> {
        self.inner.find(uid).await
    }

    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        self.inner.create(job).await
    }

    async fn upsert(&self, job: &Job) -> Result<(), JobStoreError> {
        self.inner.upsert(job).await
    }

    async fn update_execution(&self, job: &Job) -> Result<(), JobStoreError> {
        self.inner.update_execution(job).await
    }

    async fn update_progress(
        &self,
        uid: &JobUid,
        progress: u8,
        result: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.inner.update_progress(uid, progress, result, now).await
    }

    async fn count_running(&self) -> Result<usize, JobStoreError> {
        self.inner.count_running().await
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("ready job query blew up");
        }
        self.inner.list_ready(now, limit).await
    }

    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list_deadline_exceeded(now).await
    }

    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        self.inner.next_scheduled_time(now).await
    }

    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.inner.delete_old(older_than).await
    }

    async fn delete_by_uid(&self, uid: &JobUid) -> Result<(), JobStoreError> {
        self.inner.delete_by_uid(uid).await
    }

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list_by_group_id(group_id).await
    }

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, JobStoreError> {
        self.inner.delete_by_group_id(group_id).await
    }
}

#[tokio::test]
async fn run_job_rejects_invalid_definitions() {
    let h = Harness::new(1);
    let timeout = Duration::from_secs(10);

    let empty_type = h.scheduler.run_job("", 0, timeout, "").await;
    assert!(matches!(empty_type, Err(SchedulerError::Domain(DomainError::Validation(_)))));

    let negative_retries = h.scheduler.run_job("t", -1, timeout, "").await;
    assert!(matches!(negative_retries, Err(SchedulerError::Domain(_))));

    let short_timeout = h.scheduler.run_job("t", 0, Duration::from_millis(500), "").await;
    assert!(matches!(short_timeout, Err(SchedulerError::Domain(_))));

    let huge_timeout = h
        .scheduler
        .run_job("t", 0, Duration::from_secs(u64::MAX / 4), "")
        .await;
    assert!(matches!(huge_timeout, Err(SchedulerError::Domain(_))));

    let huge_recurring = h
        .scheduler
        .add_recurring("r", "t", "0 3 * * *", Duration::from_secs(u64::MAX / 4))
        .await;
    assert!(matches!(huge_recurring, Err(SchedulerError::Domain(_))));

    assert!(h.store.all().unwrap().is_empty());
}

#[tokio::test]
async fn job_runs_to_completion_and_reports_result() {
    let h = Harness::new(2);
    h.scheduler
        .register("echo", handler_fn(|_ctx, data| async move { Ok(format!("echo:{data}")) }))
        .unwrap();
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();

    let uid = h
        .scheduler
        .run_job("echo", 0, Duration::from_secs(10), "hello")
        .await
        .unwrap();

    wait_for(&mut sub, &uid, |c| c.state == JobState::Running).await;
    let done = wait_for(&mut sub, &uid, is_terminal).await;
    assert_eq!(done.state, JobState::Finished);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result, "echo:hello");

    let progress = h.scheduler.get_job_progress(&uid).await.unwrap();
    assert_eq!(progress.state, JobState::Finished);

    let job = h.store.find(&uid).await.unwrap();
    assert_eq!(job.total_executions, 1);
    assert!(job.run_by.is_empty());

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn capacity_limits_concurrent_executions() {
    let h = Harness::new(1);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let active = active.clone();
        let peak = peak.clone();
        h.scheduler
            .register(
                "slow",
                handler_fn(move |_ctx, _data| {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(String::new())
                    }
                }),
            )
            .unwrap();
    }
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();

    let mut uids = Vec::new();
    for _ in 0..3 {
        uids.push(
            h.scheduler
                .run_job("slow", 0, Duration::from_secs(10), "")
                .await
                .unwrap(),
        );
    }

    let mut running_broadcasts = 0;
    let mut finished = 0;
    tokio::time::timeout(WAIT, async {
        while finished < 3 {
            let change = sub.recv().await.unwrap();
            match change.state {
                JobState::Running => running_broadcasts += 1,
                JobState::Finished => finished += 1,
                _ => {}
            }
        }
    })
    .await
    .expect("jobs did not finish");

    assert_eq!(running_broadcasts, 3);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    for uid in &uids {
        assert_eq!(h.store.find(uid).await.unwrap().state, JobState::Finished);
    }

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_job_is_rescheduled_after_retry_delay() {
    let h = Harness::new(1);
    h.scheduler
        .register("flaky", handler_fn(|_ctx, _data| async { Err::<String, _>(HandlerError::new("boom")) }))
        .unwrap();
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();

    let before = Utc::now();
    let uid = h
        .scheduler
        .run_job("flaky", 2, Duration::from_secs(10), "")
        .await
        .unwrap();

    let change = wait_for(&mut sub, &uid, |c| c.state != JobState::Running).await;
    assert_eq!(change.state, JobState::Scheduled);
    assert_eq!(change.failure, "boom");

    let job = h.store.find(&uid).await.unwrap();
    assert_eq!(job.consecutive_failures, 1);
    assert_eq!(job.total_executions, 1);
    assert!(job.scheduled_at >= before + chrono::Duration::seconds(15));

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_type_and_panics_fail_the_job() {
    let h = Harness::new(2);
    h.scheduler
        .register("panics", handler_fn(explode))
        .unwrap();
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();

    let unknown = h
        .scheduler
        .run_job("nobody-handles-this", 0, Duration::from_secs(10), "")
        .await
        .unwrap();
    let change = wait_for(&mut sub, &unknown, is_terminal).await;
    assert_eq!(change.state, JobState::Failed);
    assert_eq!(change.failure, "unknown job type");

    let panicking = h
        .scheduler
        .run_job("panics", 0, Duration::from_secs(10), "")
        .await
        .unwrap();
    let change = wait_for(&mut sub, &panicking, is_terminal).await;
    assert_eq!(change.state, JobState::Failed);
    assert!(change.failure.starts_with("job panicked"), "{}", change.failure);
    assert!(change.failure.contains("kaboom"));

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_is_stopped_at_its_deadline() {
    let h = Harness::new(1);
    h.scheduler
        .register(
            "sleepy",
            handler_fn(|_ctx, _data| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            }),
        )
        .unwrap();
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();

    let uid = h
        .scheduler
        .run_job("sleepy", 0, Duration::from_secs(1), "")
        .await
        .unwrap();

    let change = wait_for(&mut sub, &uid, is_terminal).await;
    assert_eq!(change.state, JobState::Failed);
    assert_eq!(change.failure, DEADLINE_EXCEEDED);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelling_a_local_job_stops_it() {
    let h = Harness::new(1);
    h.scheduler
        .register(
            "waits",
            handler_fn(|ctx, _data| async move {
                ctx.cancel.cancelled().await;
                Err::<String, _>(HandlerError::new("stopped"))
            }),
        )
        .unwrap();
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();

    let uid = h
        .scheduler
        .run_job("waits", 0, Duration::from_secs(30), "")
        .await
        .unwrap();
    h.wait_running_locally(1).await;

    h.scheduler.cancel_job(&uid).await.unwrap();

    let change = wait_for(&mut sub, &uid, is_terminal).await;
    assert_eq!(change.state, JobState::Failed);
    assert_eq!(change.failure, JOB_CANCELED);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelling_an_unknown_job_broadcasts_the_request() {
    let h = Harness::new(1);
    let mut cancels = h.pubsub.subscribe(TOPIC_CANCEL_JOB).await.unwrap();

    h.scheduler
        .cancel_job(&JobUid::from("elsewhere"))
        .await
        .unwrap();

    let payload = tokio::time::timeout(WAIT, cancels.recv()).await.unwrap().unwrap();
    assert_eq!(payload, b"elsewhere");
}

#[tokio::test]
async fn progress_reports_are_persisted_and_broadcast() {
    let h = Harness::new(1);
    h.scheduler
        .register(
            "steps",
            handler_fn(|ctx, _data| async move {
                ctx.progress
                    .report(250, "almost")
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                ctx.progress
                    .report(40, "partial")
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                Ok("done".to_string())
            }),
        )
        .unwrap();
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();

    let uid = h
        .scheduler
        .run_job("steps", 0, Duration::from_secs(10), "")
        .await
        .unwrap();

    let clamped = wait_for(&mut sub, &uid, |c| c.result == "almost").await;
    assert_eq!(clamped.state, JobState::Running);
    assert_eq!(clamped.progress, 100);

    let partial = wait_for(&mut sub, &uid, |c| c.result == "partial").await;
    assert_eq!(partial.progress, 40);

    let done = wait_for(&mut sub, &uid, is_terminal).await;
    assert_eq!(done.state, JobState::Finished);
    assert_eq!(done.result, "done");

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn recurring_registration_is_idempotent() {
    let h = Harness::new(1);

    h.scheduler
        .add_recurring("nightly", "report", "0 3 * * *", Duration::from_secs(60))
        .await
        .unwrap();
    h.scheduler
        .add_recurring("nightly", "report", "0 3 * * *", Duration::from_secs(60))
        .await
        .unwrap();

    let jobs = h.store.all().unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].is_recurring);
    assert_eq!(jobs[0].state, JobState::Scheduled);
    assert!(jobs[0].scheduled_at > Utc::now());

    let invalid = h
        .scheduler
        .add_recurring("bad", "report", "every tuesday", Duration::from_secs(60))
        .await;
    assert!(matches!(
        invalid,
        Err(SchedulerError::Domain(DomainError::InvalidCron { .. }))
    ));
}

#[tokio::test]
async fn run_registers_maintenance_jobs_and_rejects_second_start() {
    let h = Harness::new(1);
    let (shutdown, run) = h.start();

    tokio::time::timeout(WAIT, async {
        while h.store.all().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("maintenance jobs were not created");

    let second = h.scheduler.run(CancellationToken::new()).await;
    assert!(matches!(second, Err(SchedulerError::AlreadyStarted)));

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn overdue_jobs_are_reclaimed() {
    let h = Harness::new(2);
    let now = Utc::now();

    // A job left running by an instance that died.
    let mut stale = Job::recurring(
        "stale",
        "export",
        &CronSchedule::parse("0 3 * * *").unwrap(),
        Duration::from_secs(10),
        now,
    )
    .unwrap();
    stale.is_recurring = false;
    stale.recurring_cron.clear();
    stale.mark_running("dead-instance", now - chrono::Duration::minutes(10));
    h.store.create(&stale).await.unwrap();

    // Make the overdue reclaimer due right away; registration at startup
    // leaves an unchanged definition untouched.
    let mut overdue = Job::recurring(
        JOB_UID_OVERDUE,
        JOB_TYPE_OVERDUE,
        &CronSchedule::parse(JOB_CRON_OVERDUE).unwrap(),
        MAINTENANCE_MAX_DURATION,
        now,
    )
    .unwrap();
    overdue.scheduled_at = now - chrono::Duration::seconds(1);
    h.store.upsert(&overdue).await.unwrap();

    let (shutdown, run) = h.start();

    let reclaimed = tokio::time::timeout(WAIT, async {
        loop {
            let job = h.store.find(&stale.uid).await.unwrap();
            if job.state != JobState::Running {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("overdue job was not reclaimed");

    assert_eq!(reclaimed.state, JobState::Failed);
    assert_eq!(reclaimed.last_failure_error, DEADLINE_EXCEEDED);
    assert!(reclaimed.run_by.is_empty());

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn wait_jobs_done_drains_in_flight_executions() {
    let h = Harness::new(1);
    h.scheduler
        .register(
            "short",
            handler_fn(|_ctx, _data| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(String::new())
            }),
        )
        .unwrap();
    let (shutdown, run) = h.start();

    let uid = h
        .scheduler
        .run_job("short", 0, Duration::from_secs(10), "")
        .await
        .unwrap();

    shutdown.cancel();
    run.await.unwrap().unwrap();

    tokio::time::timeout(WAIT, h.scheduler.wait_jobs_done(CancellationToken::new()))
        .await
        .expect("in-flight job did not drain");

    assert_eq!(h.store.find(&uid).await.unwrap().state, JobState::Finished);
    assert_eq!(h.scheduler.running_locally(), 0);

    h.scheduler.purge_job(&uid).await.unwrap();
    assert!(h.scheduler.get_job_progress(&uid).await.is_err());
}

#[tokio::test]
async fn failed_startup_can_be_retried() {
    let locks = Arc::new(InMemoryMutexManager::with_acquire_timeout(Duration::from_millis(50)));
    let h = Harness::with_locks("test-instance", 1, locks);

    let held = acquire_global(&*h.locks).await.unwrap();
    let first = h.scheduler.run(CancellationToken::new()).await;
    assert!(matches!(first, Err(SchedulerError::Lock(LockError::Timeout(_)))));
    assert!(h.store.all().unwrap().is_empty());
    release(held).await;

    let (shutdown, run) = h.start();
    h.wait_started().await;

    let second = h.scheduler.run(CancellationToken::new()).await;
    assert!(matches!(second, Err(SchedulerError::AlreadyStarted)));

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn job_is_cancelled_by_request_from_another_instance() {
    let a = Harness::with_locks("instance-a", 2, InMemoryMutexManager::arc());
    let b = a.sibling("instance-b", 2);
    a.scheduler
        .register(
            "waits",
            handler_fn(|ctx, _data| async move {
                ctx.cancel.cancelled().await;
                Err::<String, _>(HandlerError::new("stopped"))
            }),
        )
        .unwrap();
    let mut sub = a.scheduler.subscribe_state_changes().await.unwrap();

    let (shutdown_a, run_a) = a.start();
    a.wait_started().await;
    let (shutdown_b, run_b) = b.start();

    let uid = a
        .scheduler
        .run_job("waits", 0, Duration::from_secs(30), "")
        .await
        .unwrap();
    a.wait_running_locally(1).await;
    assert_eq!(b.scheduler.running_locally(), 0);

    b.scheduler.cancel_job(&uid).await.unwrap();

    let change = wait_for(&mut sub, &uid, is_terminal).await;
    assert_eq!(change.state, JobState::Failed);
    assert_eq!(change.failure, JOB_CANCELED);

    let job = a.store.find(&uid).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.run_by.is_empty());

    shutdown_a.cancel();
    shutdown_b.cancel();
    run_a.await.unwrap().unwrap();
    run_b.await.unwrap().unwrap();
}

#[tokio::test]
async fn job_completes_while_the_global_lock_is_unavailable() {
    let locks = Arc::new(InMemoryMutexManager::with_acquire_timeout(Duration::from_millis(100)));
    let h = Harness::with_locks("test-instance", 1, locks);
    let gate = Arc::new(Notify::new());
    {
        let gate = gate.clone();
        h.scheduler
            .register(
                "gated",
                handler_fn(move |_ctx, _data| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok("done".to_string())
                    }
                }),
            )
            .unwrap();
    }
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();
    h.wait_started().await;

    let uid = h
        .scheduler
        .run_job("gated", 0, Duration::from_secs(30), "")
        .await
        .unwrap();
    h.wait_running_locally(1).await;

    // The run loop may hold the lock for a moment; keep trying until it is ours.
    let held = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(mutex) = acquire_global(&*h.locks).await {
                return mutex;
            }
        }
    })
    .await
    .expect("could not take the global lock");

    gate.notify_one();

    let done = wait_for(&mut sub, &uid, is_terminal).await;
    assert_eq!(done.state, JobState::Finished);
    assert_eq!(done.result, "done");
    assert_eq!(h.store.find(&uid).await.unwrap().state, JobState::Finished);

    release(held).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_loop_survives_a_panicking_tick() {
    let store = InMemoryJobStore::arc();
    let flaky = Arc::new(PanicsOnFirstPoll {
        inner: store.clone(),
        armed: AtomicBool::new(true),
    });
    let scheduler = Scheduler::new(
        flaky.clone(),
        InMemoryMutexManager::arc(),
        Arc::new(InMemoryPubSub::new()),
        SchedulerConfig::default()
            .with_instance_id("test-instance")
            .with_max_running(1),
    );
    scheduler
        .register("echo", handler_fn(|_ctx, data| async move { Ok(format!("echo:{data}")) }))
        .unwrap();

    // Already due, so only the run loop can pick it up.
    let queued = definition("queued", "echo", "later").into_job(Utc::now()).unwrap();
    store.create(&queued).await.unwrap();

    let mut sub = scheduler.subscribe_state_changes().await.unwrap();
    let shutdown = CancellationToken::new();
    let run = {
        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    tokio::time::timeout(WAIT, async {
        while flaky.armed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first poll never happened");
    assert_eq!(store.find(&queued.uid).await.unwrap().state, JobState::Scheduled);

    scheduler.signal().reschedule(Some(Utc::now()));

    let done = wait_for(&mut sub, &queued.uid, is_terminal).await;
    assert_eq!(done.state, JobState::Finished);
    assert_eq!(done.result, "echo:later");

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn capacity_is_shared_between_instances() {
    let a = Harness::with_locks("instance-a", 1, InMemoryMutexManager::arc());
    let b = a.sibling("instance-b", 1);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for h in [&a, &b] {
        h.scheduler
            .register("slow", overlap_counter(active.clone(), peak.clone()))
            .unwrap();
    }

    let mut uids = Vec::new();
    let now = Utc::now();
    for i in 0..4 {
        let job = definition(&format!("shared-{i}"), "slow", "").into_job(now).unwrap();
        a.store.create(&job).await.unwrap();
        uids.push(job.uid);
    }

    let mut sub = a.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown_a, run_a) = a.start();
    let (shutdown_b, run_b) = b.start();

    let done = wait_all_terminal(&mut sub, &uids).await;
    assert!(done.values().all(|c| c.state == JobState::Finished));
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    shutdown_a.cancel();
    shutdown_b.cancel();
    run_a.await.unwrap().unwrap();
    run_b.await.unwrap().unwrap();
}

#[tokio::test]
async fn job_groups_run_report_and_purge_together() {
    let h = Harness::new(4);
    h.scheduler
        .register("echo", handler_fn(|_ctx, data| async move { Ok(format!("echo:{data}")) }))
        .unwrap();
    let mut sub = h.scheduler.subscribe_state_changes().await.unwrap();
    let (shutdown, run) = h.start();
    h.wait_started().await;

    let uids = h
        .scheduler
        .run_jobs(
            "nightly-batch",
            (0..3)
                .map(|i| definition(&format!("batch-{i}"), "echo", &i.to_string()))
                .collect(),
        )
        .await
        .unwrap();
    assert_eq!(uids.len(), 3);

    let done = wait_all_terminal(&mut sub, &uids).await;
    assert!(done.values().all(|c| c.state == JobState::Finished));

    let progress = h.scheduler.get_job_progress_for_group("nightly-batch").await.unwrap();
    assert_eq!(progress.len(), 3);
    for (uid, p) in &progress {
        let i = uid.as_str().trim_start_matches("batch-");
        assert_eq!(p.state, JobState::Finished);
        assert_eq!(p.result, format!("echo:{i}"));
    }

    assert_eq!(h.scheduler.purge_jobs_by_group_id("nightly-batch").await.unwrap(), 3);
    assert!(h.scheduler.get_job_progress_for_group("nightly-batch").await.unwrap().is_empty());
    assert!(h.store.find(&JobUid::from(JOB_UID_OVERDUE)).await.is_ok());

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn job_group_is_rejected_as_a_whole() {
    let h = Harness::new(1);

    let mut broken = definition("bad-2", "echo", "");
    broken.max_retries = -1;
    let rejected = h
        .scheduler
        .run_jobs("import", vec![definition("ok-1", "echo", ""), broken])
        .await;
    assert!(matches!(rejected, Err(SchedulerError::Domain(DomainError::Validation(_)))));

    let duplicated = h
        .scheduler
        .run_jobs("import", vec![definition("dup", "echo", ""), definition("dup", "echo", "")])
        .await;
    assert!(matches!(duplicated, Err(SchedulerError::Domain(_))));

    let ungrouped = h
        .scheduler
        .run_jobs("  ", vec![definition("ok-1", "echo", "")])
        .await;
    assert!(matches!(ungrouped, Err(SchedulerError::Domain(_))));
    assert!(h.scheduler.purge_jobs_by_group_id("").await.is_err());

    assert!(h.store.all().unwrap().is_empty());
    assert!(h.scheduler.run_jobs("import", Vec::new()).await.unwrap().is_empty());
}
