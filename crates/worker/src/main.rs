use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use jobforge_infra::SchedulerConfig;
use jobforge_worker::{Backends, WorkerSettings, build_scheduler};

/// How long in-flight jobs may take to finish after a shutdown request.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = SchedulerConfig::from_env();
    let backends = Backends::connect(&WorkerSettings::from_env()).await?;
    let scheduler = build_scheduler(backends, config);

    let shutdown = CancellationToken::new();
    let mut run = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    let stopped = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
            shutdown.cancel();
            (&mut run).await
        }
        joined = &mut run => joined,
    };
    stopped
        .context("scheduler task failed")?
        .context("scheduler stopped with an error")?;

    let interrupt = CancellationToken::new();
    let timeout = tokio::spawn({
        let interrupt = interrupt.clone();
        async move {
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            interrupt.cancel();
        }
    });
    scheduler.wait_jobs_done(interrupt).await;
    timeout.abort();

    Ok(())
}
