//! Distributed mutual exclusion.
//!
//! Every scheduler-wide mutation (capacity accounting + claiming jobs, creating
//! maintenance jobs, purging, reclaiming overdue jobs) runs under one named
//! lock, [`GLOBAL_LOCK_NAME`], shared by all scheduler instances.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let mutex = lock::acquire_global(&*locks).await?;
//! let outcome = do_work().await;
//! lock::release(mutex).await;
//! ```
//!
//! Releasing is explicit (there is no async drop); a failed release is logged
//! and left to the provider's expiry.

mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryMutexManager;

/// Name of the lock serializing all scheduler-wide state changes.
pub const GLOBAL_LOCK_NAME: &str = "jobs";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock {0:?}")]
    Timeout(String),

    #[error("lock {0:?} is not held")]
    NotHeld(String),

    #[error("lock provider error: {0}")]
    Provider(String),
}

/// A named mutex whose ownership may span processes.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    fn name(&self) -> &str;

    async fn lock(&mut self) -> Result<(), LockError>;

    async fn unlock(&mut self) -> Result<(), LockError>;
}

/// Factory of named mutexes.
pub trait MutexManager: Send + Sync {
    fn new_mutex(&self, name: &str) -> Box<dyn DistributedMutex>;
}

impl<M> MutexManager for Arc<M>
where
    M: MutexManager + ?Sized,
{
    fn new_mutex(&self, name: &str) -> Box<dyn DistributedMutex> {
        (**self).new_mutex(name)
    }
}

/// Acquire the scheduler-wide lock.
pub async fn acquire_global(
    manager: &dyn MutexManager,
) -> Result<Box<dyn DistributedMutex>, LockError> {
    let mut mutex = manager.new_mutex(GLOBAL_LOCK_NAME);
    mutex.lock().await?;
    Ok(mutex)
}

/// Release a lock obtained through [`acquire_global`], logging failures.
pub async fn release(mut mutex: Box<dyn DistributedMutex>) {
    if let Err(error) = mutex.unlock().await {
        tracing::warn!(lock = mutex.name(), %error, "failed to release lock");
    }
}
