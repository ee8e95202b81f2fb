//! The worker process lifecycle
//!
//! Startup order: store → cache (non-fatal) → supervisor → worker pool.
//! Teardown runs in reverse on SIGINT/SIGTERM, draining in-flight jobs
//! within the grace period. Exit code 0 on a clean drain, 1 on a forced
//! exit or fatal startup failure.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conveyor_core::jobs::{
    BatchLoader, CircuitBreaker, DlqStore, HandlerRegistry, JobStore, LockManager, QueueContext,
    RetryScheduler, Supervisor, WorkerPool,
};
use conveyor_core::{create_pool, Config, JobMetrics, Migrator, RedisPool};

use super::handlers;

pub async fn run(config: Config, skip_migrate: bool) -> anyhow::Result<i32> {
    info!(
        queue = %config.queue.name,
        workers = config.queue.workers,
        concurrency = config.queue.concurrency,
        "Starting conveyor worker"
    );

    // Store connection is fatal; there is no queue without it
    let pool = create_pool(&config.database).await?;

    if !skip_migrate {
        Migrator::new(pool.clone()).migrate().await?;
    }

    // Cache connection is not: the queue degrades to direct store polling
    let cache = if config.cache.enabled {
        match RedisPool::connect(config.cache.redis.clone()).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(error = %e, "Batch cache unavailable, starting in direct-store mode");
                None
            }
        }
    } else {
        info!("Batch cache disabled by configuration");
        None
    };

    let queue_config = Arc::new(config.queue);
    let store = JobStore::new(pool.clone());
    let dlq = DlqStore::new(pool);
    let metrics = Arc::new(JobMetrics::new());
    let breaker = Arc::new(CircuitBreaker::from_config(&queue_config));

    let registry = Arc::new(HandlerRegistry::new());
    handlers::register_builtin(&registry);
    info!(types = ?registry.types(), "Handlers registered");

    let loader = Arc::new(BatchLoader::new(
        store.clone(),
        cache.clone(),
        breaker.clone(),
        queue_config.clone(),
        metrics.clone(),
    ));
    let locks = Arc::new(LockManager::new(
        cache.clone(),
        breaker.clone(),
        &queue_config.name,
    ));
    let retry = Arc::new(RetryScheduler::new(
        store.clone(),
        dlq,
        queue_config.clone(),
        metrics.clone(),
    ));

    // The supervisor outlives the pool so it can keep reclaiming while
    // workers drain; separate tokens give the teardown its order.
    let supervisor_token = CancellationToken::new();
    let pool_token = CancellationToken::new();

    let supervisor = Supervisor::new(
        store.clone(),
        cache,
        breaker,
        loader.clone(),
        retry.clone(),
        metrics.clone(),
        queue_config.clone(),
        supervisor_token.clone(),
    );
    let supervisor_handle = tokio::spawn(supervisor.run());

    let ctx = QueueContext {
        store,
        loader,
        locks,
        registry,
        retry,
        metrics,
        config: queue_config,
    };
    let mut worker_pool = WorkerPool::new(ctx, pool_token);
    worker_pool.start();

    wait_for_shutdown_signal().await;
    info!("Termination signal received, shutting down");

    let clean = worker_pool.shutdown().await;

    supervisor_token.cancel();
    if let Err(e) = supervisor_handle.await {
        error!(error = %e, "Supervisor task failed");
    }

    if clean {
        info!("Shutdown complete");
        Ok(0)
    } else {
        Ok(1)
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
