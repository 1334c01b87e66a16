//! Job definitions, the persisted job record, and the transitions applied
//! around every execution.
//!
//! ## Lifecycle
//!
//! ```text
//! Scheduled --dispatch--> Running --success--> Finished
//!     ^                      |----failure----> Failed
//!     |                      |
//!     +---retry / cron-------+
//! ```
//!
//! Both transitions are pure functions of the job and the current time so the
//! scheduler, the overdue reclaimer and tests all apply exactly the same rules.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronSchedule;
use crate::error::{DomainError, DomainResult};
use crate::id::JobUid;
use crate::progress::{JobProgress, JobStateChange, PROGRESS_MAX, PROGRESS_MIN};

/// Smallest accepted execution timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest accepted execution timeout (30 days).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Delay before a failed job with retries left runs again.
pub const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Execution state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            "finished" => Ok(JobState::Finished),
            "failed" => Ok(JobState::Failed),
            other => Err(DomainError::validation(format!("unknown job state: {other}"))),
        }
    }
}

/// Dispatch priority. `Elevated` is reserved for the engine's maintenance jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Normal,
    Elevated,
}

impl JobPriority {
    /// Numeric form used by persistent stores; higher runs first.
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Normal => 0,
            JobPriority::Elevated => 100,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        if value >= JobPriority::Elevated.as_i16() {
            JobPriority::Elevated
        } else {
            JobPriority::Normal
        }
    }
}

/// Caller-supplied description of a one-off job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub uid: JobUid,
    pub job_type: String,
    pub max_retries: i32,
    pub timeout: Duration,
    pub data: String,
}

impl Definition {
    pub fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        if self.uid.as_str().trim().is_empty() {
            return Err(DomainError::validation("job uid must not be empty"));
        }
        if self.max_retries < 0 {
            return Err(DomainError::validation(format!(
                "max retries must be >= 0, got {}",
                self.max_retries
            )));
        }
        if self.timeout < MIN_TIMEOUT {
            return Err(DomainError::validation(format!(
                "timeout must be at least {}s, got {:?}",
                MIN_TIMEOUT.as_secs(),
                self.timeout
            )));
        }
        validate_max_duration(self.timeout)
    }

    /// Turn the definition into a `Scheduled` job due at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> DomainResult<Job> {
        self.validate()?;

        Ok(Job {
            uid: self.uid,
            group_id: String::new(),
            created_at: now,
            updated_at: now,
            job_type: self.job_type,
            priority: JobPriority::Normal,
            data: self.data,
            result: String::new(),
            max_duration_seconds: duration_seconds(self.timeout),
            max_retries: self.max_retries,
            state: JobState::Scheduled,
            scheduled_at: now,
            total_executions: 0,
            run_by: String::new(),
            run_deadline: None,
            run_progress: PROGRESS_MIN,
            last_executed: None,
            is_recurring: false,
            recurring_cron: String::new(),
            consecutive_failures: 0,
            last_failure_error: String::new(),
        })
    }
}

/// Persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub uid: JobUid,
    /// Group the job was submitted with; empty for jobs submitted on their own.
    pub group_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub job_type: String,
    pub priority: JobPriority,
    pub data: String,
    pub result: String,
    pub max_duration_seconds: i64,
    pub max_retries: i32,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
    pub total_executions: i32,
    pub run_by: String,
    pub run_deadline: Option<DateTime<Utc>>,
    pub run_progress: u8,
    pub last_executed: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub recurring_cron: String,
    pub consecutive_failures: i32,
    pub last_failure_error: String,
}

impl Job {
    /// Build an elevated-priority recurring job, scheduled at the cron's next
    /// fire time after `now`.
    pub fn recurring(
        uid: impl Into<JobUid>,
        job_type: impl Into<String>,
        cron: &CronSchedule,
        max_duration: Duration,
        now: DateTime<Utc>,
    ) -> DomainResult<Job> {
        let uid = uid.into();
        let job_type = job_type.into();
        if uid.as_str().trim().is_empty() {
            return Err(DomainError::validation("job uid must not be empty"));
        }
        if job_type.trim().is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        validate_max_duration(max_duration)?;
        let scheduled_at = cron.require_next_after(now)?;

        Ok(Job {
            uid,
            group_id: String::new(),
            created_at: now,
            updated_at: now,
            job_type,
            priority: JobPriority::Elevated,
            data: String::new(),
            result: String::new(),
            max_duration_seconds: duration_seconds(max_duration),
            max_retries: 0,
            state: JobState::Scheduled,
            scheduled_at,
            total_executions: 0,
            run_by: String::new(),
            run_deadline: None,
            run_progress: PROGRESS_MIN,
            last_executed: None,
            is_recurring: true,
            recurring_cron: cron.expression().to_string(),
            consecutive_failures: 0,
            last_failure_error: String::new(),
        })
    }

    /// Execution window granted to a single run (never below one second).
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_seconds.max(1) as u64)
    }

    /// True when the stored definition of `self` differs from `other`.
    ///
    /// Execution fields (state, schedule, counters) are ignored; upserting an
    /// unchanged definition must not reset a job's schedule.
    pub fn definition_differs(&self, other: &Job) -> bool {
        self.job_type != other.job_type
            || self.group_id != other.group_id
            || self.priority != other.priority
            || self.data != other.data
            || self.max_duration_seconds != other.max_duration_seconds
            || self.max_retries != other.max_retries
            || self.is_recurring != other.is_recurring
            || self.recurring_cron != other.recurring_cron
    }

    /// Claim the job for execution on `instance_id`.
    ///
    /// A stored duration too large to represent saturates the deadline at the
    /// latest representable time.
    pub fn mark_running(&mut self, instance_id: &str, now: DateTime<Utc>) {
        if self.max_duration_seconds < 1 {
            self.max_duration_seconds = 1;
        }
        let deadline = chrono::Duration::try_seconds(self.max_duration_seconds)
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.updated_at = now;
        self.last_executed = Some(now);
        self.state = JobState::Running;
        self.run_deadline = Some(deadline);
        self.run_by = instance_id.to_string();
        self.run_progress = PROGRESS_MIN;
        self.total_executions += 1;
        self.result.clear();
        self.last_failure_error.clear();
    }

    /// Apply the outcome of an execution.
    ///
    /// Only a `Running` job is changed; the return value reports whether it was.
    pub fn apply_execution_result(
        &mut self,
        result: String,
        failure: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state != JobState::Running {
            return false;
        }

        self.updated_at = now;
        self.result = result;
        self.run_by.clear();

        let succeeded = failure.is_none();
        match failure {
            Some(message) => {
                self.consecutive_failures += 1;
                self.state = JobState::Failed;
                self.last_failure_error = message;
            }
            None => {
                self.state = JobState::Finished;
                self.run_progress = PROGRESS_MAX;
            }
        }

        if self.is_recurring {
            if succeeded {
                self.consecutive_failures = 0;
            }

            match CronSchedule::parse(&self.recurring_cron)
                .and_then(|cron| cron.require_next_after(now))
            {
                Ok(next) => {
                    self.state = JobState::Scheduled;
                    self.scheduled_at = next;
                }
                Err(err) => {
                    let mut message = format!("failed to parse cron string: {err}");
                    if !self.last_failure_error.is_empty() {
                        message.push_str("; ");
                        message.push_str(&self.last_failure_error);
                    }
                    self.state = JobState::Failed;
                    self.last_failure_error = message;
                }
            }

            return true;
        }

        if self.state == JobState::Failed && self.consecutive_failures <= self.max_retries {
            self.state = JobState::Scheduled;
            self.scheduled_at = now + chrono::Duration::seconds(RETRY_DELAY.as_secs() as i64);
            self.run_progress = PROGRESS_MIN;
        }

        true
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running && self.run_deadline.is_some_and(|deadline| deadline < now)
    }

    pub fn state_change(&self) -> JobStateChange {
        JobStateChange {
            uid: self.uid.clone(),
            state: self.state,
            progress: self.run_progress,
            result: self.result.clone(),
            failure: self.last_failure_error.clone(),
        }
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            state: self.state,
            progress: self.run_progress,
            result: self.result.clone(),
            failure: self.last_failure_error.clone(),
        }
    }
}

fn validate_max_duration(duration: Duration) -> DomainResult<()> {
    if duration > MAX_TIMEOUT {
        return Err(DomainError::validation(format!(
            "timeout must be at most {}s, got {:?}",
            MAX_TIMEOUT.as_secs(),
            duration
        )));
    }
    Ok(())
}

fn duration_seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
