//! Infrastructure layer of the job scheduler: storage, distributed locking,
//! pub/sub transports, configuration and the scheduler engine itself.

pub mod config;
pub mod event_bus;
pub mod jobs;
pub mod lock;

pub use config::SchedulerConfig;
pub use jobs::{
    Executor, ExecutorError, Handler, HandlerError, InMemoryJobStore, JobContext, JobStore,
    JobStoreError, PostgresJobStore, ProgressReporter, Scheduler, SchedulerError, SchedulerSignal,
    handler_fn,
};
pub use lock::{DistributedMutex, GLOBAL_LOCK_NAME, InMemoryMutexManager, LockError, MutexManager};
