//! Backend construction.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use jobforge_events::{InMemoryPubSub, PubSub};
use jobforge_infra::{
    InMemoryJobStore, InMemoryMutexManager, JobStore, MutexManager, PostgresJobStore, Scheduler,
    SchedulerConfig,
};

use crate::settings::WorkerSettings;

const MAX_DB_CONNECTIONS: u32 = 10;

/// The three shared backends a scheduler runs against.
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub locks: Arc<dyn MutexManager>,
    pub pubsub: Arc<dyn PubSub>,
}

impl Backends {
    /// Single-process backends.
    pub fn in_memory() -> Self {
        Self {
            store: InMemoryJobStore::arc(),
            locks: InMemoryMutexManager::arc(),
            pubsub: Arc::new(InMemoryPubSub::new()),
        }
    }

    /// Connect the backends selected by `settings`.
    pub async fn connect(settings: &WorkerSettings) -> anyhow::Result<Self> {
        let mut backends = Self::in_memory();

        match &settings.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(MAX_DB_CONNECTIONS)
                    .connect(url)
                    .await
                    .context("failed to connect to Postgres")?;
                let store = PostgresJobStore::new(pool);
                store
                    .ensure_schema()
                    .await
                    .context("failed to bootstrap job schema")?;
                tracing::info!("using Postgres job store");
                backends.store = Arc::new(store);
            }
            None => tracing::warn!("DATABASE_URL not set; using in-memory job store"),
        }

        backends.connect_redis(settings)?;
        Ok(backends)
    }

    #[cfg(feature = "redis")]
    fn connect_redis(&mut self, settings: &WorkerSettings) -> anyhow::Result<()> {
        use jobforge_infra::event_bus::RedisPubSub;
        use jobforge_infra::lock::redis::RedisMutexManager;

        let Some(url) = &settings.redis_url else {
            tracing::warn!("REDIS_URL not set; using in-memory locks and pub/sub");
            return Ok(());
        };

        self.locks = Arc::new(RedisMutexManager::new(url).context("invalid REDIS_URL")?);
        self.pubsub = Arc::new(RedisPubSub::new(url).context("invalid REDIS_URL")?);
        tracing::info!("using Redis locks and pub/sub");
        Ok(())
    }

    #[cfg(not(feature = "redis"))]
    fn connect_redis(&mut self, settings: &WorkerSettings) -> anyhow::Result<()> {
        if settings.redis_url.is_some() {
            tracing::warn!("REDIS_URL set but the redis feature is disabled; ignoring");
        }
        Ok(())
    }
}

/// Assemble a scheduler over `backends`.
pub fn build_scheduler(backends: Backends, config: SchedulerConfig) -> Scheduler {
    Scheduler::new(backends.store, backends.locks, backends.pubsub, config)
}
