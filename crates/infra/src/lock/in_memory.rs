//! Process-local lock provider for tests/dev and single-instance deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{DistributedMutex, LockError, MutexManager};

/// Default time to wait for a lock before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// In-memory lock provider.
///
/// Mutexes created with the same name share one underlying async mutex.
#[derive(Debug)]
pub struct InMemoryMutexManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    acquire_timeout: Duration,
}

impl InMemoryMutexManager {
    pub fn new() -> Self {
        Self::with_acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn with_acquire_timeout(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn shared(&self, name: &str) -> Arc<AsyncMutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => locks.entry(name.to_string()).or_default().clone(),
            // A poisoned registry still hands out a working, if unshared, lock.
            Err(_) => Arc::new(AsyncMutex::new(())),
        }
    }
}

impl Default for InMemoryMutexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexManager for InMemoryMutexManager {
    fn new_mutex(&self, name: &str) -> Box<dyn DistributedMutex> {
        Box::new(InMemoryMutex {
            name: name.to_string(),
            inner: self.shared(name),
            guard: None,
            acquire_timeout: self.acquire_timeout,
        })
    }
}

struct InMemoryMutex {
    name: String,
    inner: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    acquire_timeout: Duration,
}

#[async_trait]
impl DistributedMutex for InMemoryMutex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&mut self) -> Result<(), LockError> {
        if self.guard.is_some() {
            return Ok(());
        }
        let guard = tokio::time::timeout(self.acquire_timeout, self.inner.clone().lock_owned())
            .await
            .map_err(|_| LockError::Timeout(self.name.clone()))?;
        self.guard = Some(guard);
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), LockError> {
        self.guard
            .take()
            .map(drop)
            .ok_or_else(|| LockError::NotHeld(self.name.clone()))
    }
}
