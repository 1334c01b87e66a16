//! `jobforge-core`: domain model of the background job scheduler.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! job identifiers, job definitions, the persisted job record and the
//! deterministic state transitions applied around every execution.

pub mod cron;
pub mod error;
pub mod id;
pub mod job;
pub mod progress;

pub use cron::CronSchedule;
pub use error::{DomainError, DomainResult};
pub use id::JobUid;
pub use job::{Definition, Job, JobPriority, JobState, MAX_TIMEOUT, MIN_TIMEOUT, RETRY_DELAY};
pub use progress::{JobProgress, JobStateChange, PROGRESS_MAX, PROGRESS_MIN, clamp_progress};
