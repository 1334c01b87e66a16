//! Redis-backed lock provider (optional).
//!
//! Classic single-node Redis lock: `SET key token NX PX ttl` to acquire, and a
//! compare-and-delete script to release so a holder never removes a lock that
//! already expired and was taken by someone else.

use std::time::Duration;

use async_trait::async_trait;
use jobforge_core::JobUid;

use super::{DistributedMutex, LockError, MutexManager};

const KEY_PREFIX: &str = "jobforge:lock:";
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisMutexManager {
    client: redis::Client,
    expiry: Duration,
    acquire_timeout: Duration,
}

impl RedisMutexManager {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Provider(e.to_string()))?;
        Ok(Self {
            client,
            expiry: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
        })
    }

    /// How long a lock survives a holder that never releases it.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl MutexManager for RedisMutexManager {
    fn new_mutex(&self, name: &str) -> Box<dyn DistributedMutex> {
        Box::new(RedisMutex {
            name: name.to_string(),
            key: format!("{KEY_PREFIX}{name}"),
            token: None,
            manager: self.clone(),
        })
    }
}

struct RedisMutex {
    name: String,
    key: String,
    token: Option<String>,
    manager: RedisMutexManager,
}

impl RedisMutex {
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        self.manager
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Provider(e.to_string()))
    }
}

#[async_trait]
impl DistributedMutex for RedisMutex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&mut self) -> Result<(), LockError> {
        if self.token.is_some() {
            return Ok(());
        }

        let mut conn = self.connection().await?;
        let token = JobUid::generate().into_inner();
        let expiry_ms = self.manager.expiry.as_millis() as u64;
        let deadline = tokio::time::Instant::now() + self.manager.acquire_timeout;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&self.key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(expiry_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Provider(e.to_string()))?;

            if acquired.is_some() {
                self.token = Some(token);
                return Ok(());
            }

            if tokio::time::Instant::now() + RETRY_INTERVAL > deadline {
                return Err(LockError::Timeout(self.name.clone()));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    async fn unlock(&mut self) -> Result<(), LockError> {
        let token = self
            .token
            .take()
            .ok_or_else(|| LockError::NotHeld(self.name.clone()))?;

        let mut conn = self.connection().await?;
        let deleted: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(&self.key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Provider(e.to_string()))?;

        if deleted == 0 {
            // Expired and possibly re-acquired by another holder.
            return Err(LockError::NotHeld(self.name.clone()));
        }
        Ok(())
    }
}
