//! Scheduler configuration.
//!
//! Values come from the environment in deployed processes and from the
//! builder-style setters in tests.

use std::time::Duration;

use jobforge_core::JobUid;

/// Default number of jobs allowed to run concurrently across all instances.
pub const DEFAULT_MAX_RUNNING: usize = 10;

/// Default minimum age of a terminal job before the purge job removes it.
pub const DEFAULT_PURGE_MIN_OLD_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Recorded as the owning instance of every job this process runs.
    pub instance_id: String,
    /// Upper bound on jobs in the `Running` state (never below 1).
    pub max_running: usize,
    /// Terminal jobs last executed longer ago than this are purged.
    pub purge_min_old_age: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: JobUid::generate().into_inner(),
            max_running: DEFAULT_MAX_RUNNING,
            purge_min_old_age: DEFAULT_PURGE_MIN_OLD_AGE,
        }
    }
}

impl SchedulerConfig {
    /// Load from `JOBS_INSTANCE_ID`, `JOBS_MAX_RUNNING` and
    /// `JOBS_PURGE_MIN_OLD_AGE_SECS`; missing or malformed values fall back to
    /// the defaults with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let instance_id = pick_instance_id(
            std::env::var("JOBS_INSTANCE_ID").ok(),
            std::env::var("HOSTNAME").ok(),
        )
        .unwrap_or_else(|| {
            tracing::warn!(
                instance_id = %defaults.instance_id,
                "JOBS_INSTANCE_ID not set; using generated instance id"
            );
            defaults.instance_id.clone()
        });

        let max_running = match std::env::var("JOBS_MAX_RUNNING") {
            Ok(raw) => raw.trim().parse::<i64>().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "invalid JOBS_MAX_RUNNING; using default");
                DEFAULT_MAX_RUNNING as i64
            }),
            Err(_) => DEFAULT_MAX_RUNNING as i64,
        };

        let purge_secs = match std::env::var("JOBS_PURGE_MIN_OLD_AGE_SECS") {
            Ok(raw) => raw.trim().parse::<i64>().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "invalid JOBS_PURGE_MIN_OLD_AGE_SECS; using default");
                DEFAULT_PURGE_MIN_OLD_AGE.as_secs() as i64
            }),
            Err(_) => DEFAULT_PURGE_MIN_OLD_AGE.as_secs() as i64,
        };

        Self {
            instance_id,
            max_running: max_running.max(1) as usize,
            purge_min_old_age: Duration::from_secs(purge_secs.max(0) as u64),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_max_running(mut self, max_running: usize) -> Self {
        self.max_running = max_running.max(1);
        self
    }

    pub fn with_purge_min_old_age(mut self, age: Duration) -> Self {
        self.purge_min_old_age = age;
        self
    }
}

/// First non-blank of the explicit instance id and the host name.
fn pick_instance_id(explicit: Option<String>, hostname: Option<String>) -> Option<String> {
    non_blank(explicit).or_else(|| non_blank(hostname))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
