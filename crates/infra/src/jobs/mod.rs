//! Background job scheduling.
//!
//! ## Components
//!
//! - `JobStore`: persistence for jobs (in-memory or Postgres)
//! - `Executor`: registry routing a job type to its `Handler`
//! - `SchedulerTimer`: adaptive countdown driving the poll loop
//! - `Scheduler`: admission, dispatch, cancellation and completion
//! - `maintenance`: the overdue reclaimer and purge jobs every scheduler runs

pub mod executor;
pub mod maintenance;
pub mod postgres;
pub mod progress;
pub mod scheduler;
pub mod store;
pub mod timer;

pub use executor::{Executor, ExecutorError, FnHandler, Handler, HandlerError, JobContext, handler_fn};
pub use postgres::PostgresJobStore;
pub use progress::ProgressReporter;
pub use scheduler::{Scheduler, SchedulerError, SchedulerSignal};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use timer::SchedulerTimer;
