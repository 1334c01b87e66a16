//! Tracing and logging setup shared by scheduler processes.

pub use self::tracing::LogFormat;

/// Initialize process-wide logging.
///
/// The output format comes from `JOBS_LOG_FORMAT` (`json` or `pretty`,
/// default `json`). Safe to call multiple times; later calls are no-ops.
pub fn init() {
    self::tracing::init(LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;
