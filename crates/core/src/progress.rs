//! Progress and state-change snapshots observed from outside the scheduler.

use serde::{Deserialize, Serialize};

use crate::id::JobUid;
use crate::job::JobState;

/// Lowest progress value; set when an execution starts.
pub const PROGRESS_MIN: u8 = 0;

/// Highest progress value; set when an execution finishes successfully.
pub const PROGRESS_MAX: u8 = 100;

/// Clamp a handler-reported progress value into `PROGRESS_MIN..=PROGRESS_MAX`.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(i64::from(PROGRESS_MIN), i64::from(PROGRESS_MAX)) as u8
}

/// Broadcast whenever a job's execution state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateChange {
    pub uid: JobUid,
    pub state: JobState,
    pub progress: u8,
    pub result: String,
    pub failure: String,
}

/// Point-in-time progress of a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub state: JobState,
    pub progress: u8,
    pub result: String,
    pub failure: String,
}
