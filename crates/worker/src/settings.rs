//! Backend selection read from the environment.

/// Connection settings for the worker's backends.
///
/// Unset values select the in-memory implementation, which is only suitable
/// for a single process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Postgres connection string for the job store.
    pub database_url: Option<String>,
    /// Redis connection string for locks and pub/sub (`redis` feature).
    pub redis_url: Option<String>,
}

impl WorkerSettings {
    /// Read `DATABASE_URL` and `REDIS_URL`; blank values count as unset.
    pub fn from_env() -> Self {
        Self {
            database_url: non_blank(std::env::var("DATABASE_URL").ok()),
            redis_url: non_blank(std::env::var("REDIS_URL").ok()),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
