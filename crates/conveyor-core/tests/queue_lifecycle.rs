//! End-to-end queue lifecycle tests
//!
//! These drive real workers against a local PostgreSQL instance and skip
//! silently when one is not reachable. Redis is deliberately absent: the
//! queue must behave identically in direct-store mode.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conveyor_core::config::DatabaseConfig;
use conveyor_core::db::migrate::Migrator;
use conveyor_core::jobs::{
    BatchLoader, CircuitBreaker, DlqFilter, DlqReason, DlqStore, HandlerContext, HandlerOutcome,
    HandlerRegistry, JobHandler, JobPriority, JobQueue, JobStatus, JobStore, LockManager,
    Pagination, QueueContext, RetryScheduler, SubmitOptions, Supervisor, WorkerPool,
};
use conveyor_core::{create_pool, JobMetrics, QueueConfig};

/// Handler that fails the first `failures` attempts, then succeeds
struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, payload: &Value, _job_id: Uuid, _ctx: HandlerContext) -> HandlerOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            HandlerOutcome::failure("tmp")
        } else {
            HandlerOutcome::success(Some(payload.clone()))
        }
    }
}

/// Handler that always fails the same way
struct FailingHandler {
    error: &'static str,
    fatal: bool,
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _payload: &Value, _job_id: Uuid, _ctx: HandlerContext) -> HandlerOutcome {
        if self.fatal {
            HandlerOutcome::fatal(self.error)
        } else {
            HandlerOutcome::failure(self.error)
        }
    }
}

/// Workers poll a shared table, so concurrently running tests could steal
/// each other's jobs (and dead-letter them for missing handlers). Each
/// test holds this for its full duration.
static LIFECYCLE_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

struct Harness {
    queue: JobQueue,
    store: JobStore,
    dlq: DlqStore,
    registry: Arc<HandlerRegistry>,
    ctx: QueueContext,
    shutdown: CancellationToken,
}

async fn harness(config: QueueConfig) -> Option<Harness> {
    let pool = create_pool(&DatabaseConfig::default()).await.ok()?;
    Migrator::new(pool.clone()).migrate().await.ok()?;

    let config = Arc::new(config);
    let store = JobStore::new(pool.clone());
    let dlq = DlqStore::new(pool);
    let metrics = Arc::new(JobMetrics::new());
    let breaker = Arc::new(CircuitBreaker::from_config(&config));
    let registry = Arc::new(HandlerRegistry::new());

    let loader = Arc::new(BatchLoader::new(
        store.clone(),
        None,
        breaker.clone(),
        config.clone(),
        metrics.clone(),
    ));
    let locks = Arc::new(LockManager::new(None, breaker, &config.name));
    let retry = Arc::new(RetryScheduler::new(
        store.clone(),
        dlq.clone(),
        config.clone(),
        metrics.clone(),
    ));

    let ctx = QueueContext {
        store: store.clone(),
        loader,
        locks,
        registry: registry.clone(),
        retry,
        metrics,
        config: config.clone(),
    };

    Some(Harness {
        queue: JobQueue::new(store.clone(), config),
        store,
        dlq,
        registry,
        ctx,
        shutdown: CancellationToken::new(),
    })
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        workers: 1,
        concurrency: 2,
        batch_size: 10,
        poll_interval_ms: 200,
        ..QueueConfig::default()
    }
}

/// Poll until the job reaches the given status or the deadline passes
async fn wait_for_status(store: &JobStore, job_id: Uuid, status: JobStatus, deadline: Duration) {
    let started = std::time::Instant::now();
    loop {
        let job = store.get_job(job_id).await.unwrap().unwrap();
        if job.status == status {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "job {} stuck in {:?}, expected {:?}",
            job_id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn e1_single_attempt_success() {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let Some(h) = harness(fast_config()).await else {
        return;
    };

    let job_type = format!("notify-{}", Uuid::new_v4());
    h.registry.register(
        &job_type,
        Arc::new(FlakyHandler {
            failures: 0,
            calls: AtomicU32::new(0),
        }),
    );

    let id = h
        .queue
        .submit(&job_type, serde_json::json!({"user": "u1"}), SubmitOptions::default())
        .await
        .unwrap();

    let mut pool = WorkerPool::new(h.ctx.clone(), h.shutdown.clone());
    pool.start();

    wait_for_status(&h.store, id, JobStatus::Completed, Duration::from_secs(10)).await;
    assert!(pool.shutdown().await);

    let job = h.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.result, Some(serde_json::json!({"user": "u1"})));
    assert!(job.locked_by.is_none());

    let filter = DlqFilter {
        job_type: Some(job_type),
        ..Default::default()
    };
    assert!(h.dlq.list(&filter, Pagination::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn e2_retry_then_success() {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let Some(h) = harness(fast_config()).await else {
        return;
    };

    let job_type = format!("flaky-{}", Uuid::new_v4());
    h.registry.register(
        &job_type,
        Arc::new(FlakyHandler {
            failures: 1,
            calls: AtomicU32::new(0),
        }),
    );

    let id = h
        .queue
        .submit(&job_type, serde_json::json!({}), SubmitOptions::default())
        .await
        .unwrap();

    let mut pool = WorkerPool::new(h.ctx.clone(), h.shutdown.clone());
    pool.start();

    // First attempt fails, the retry is due 2s later, second attempt wins
    wait_for_status(&h.store, id, JobStatus::Completed, Duration::from_secs(20)).await;
    assert!(pool.shutdown().await);

    let job = h.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error_history.0.len(), 1);
    assert_eq!(job.error_history.0[0].error, "tmp");
    assert_eq!(job.last_error.as_deref(), Some("tmp"));
}

#[tokio::test]
async fn e3_exhaustion_to_dlq() {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let Some(h) = harness(fast_config()).await else {
        return;
    };

    let job_type = format!("doomed-{}", Uuid::new_v4());
    h.registry.register(
        &job_type,
        Arc::new(FailingHandler {
            error: "boom",
            fatal: false,
        }),
    );

    let id = h
        .queue
        .submit(
            &job_type,
            serde_json::json!({}),
            SubmitOptions {
                max_attempts: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut pool = WorkerPool::new(h.ctx.clone(), h.shutdown.clone());
    pool.start();

    wait_for_status(&h.store, id, JobStatus::Failed, Duration::from_secs(20)).await;
    assert!(pool.shutdown().await);

    let job = h.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some("boom"));

    let filter = DlqFilter {
        job_type: Some(job_type),
        ..Default::default()
    };
    let records = h.dlq.list(&filter, Pagination::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DlqReason::MaxAttemptsExceeded);
    assert_eq!(records[0].total_attempts, 2);
    assert_eq!(records[0].error_history.0.len(), 2);
}

#[tokio::test]
async fn e4_fatal_short_circuit() {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let Some(h) = harness(fast_config()).await else {
        return;
    };

    let job_type = format!("fatal-{}", Uuid::new_v4());
    h.registry.register(
        &job_type,
        Arc::new(FailingHandler {
            error: "bad",
            fatal: true,
        }),
    );

    let id = h
        .queue
        .submit(
            &job_type,
            serde_json::json!({}),
            SubmitOptions {
                max_attempts: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut pool = WorkerPool::new(h.ctx.clone(), h.shutdown.clone());
    pool.start();

    wait_for_status(&h.store, id, JobStatus::Failed, Duration::from_secs(10)).await;
    assert!(pool.shutdown().await);

    let job = h.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);

    let filter = DlqFilter {
        job_type: Some(job_type),
        ..Default::default()
    };
    let records = h.dlq.list(&filter, Pagination::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DlqReason::FatalError);
}

#[tokio::test]
async fn e5_crash_recovery_via_supervisor() {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let Some(h) = harness(fast_config()).await else {
        return;
    };

    let job_type = format!("crashed-{}", Uuid::new_v4());
    let id = h
        .queue
        .submit(&job_type, serde_json::json!({}), SubmitOptions::default())
        .await
        .unwrap();

    // Simulate a worker that died mid-execution: lock taken, never resolved
    let dead_worker = Uuid::new_v4();
    let job = h.store.atomic_lock(id, dead_worker, 0).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 1);

    let supervisor = Supervisor::new(
        h.store.clone(),
        None,
        Arc::new(CircuitBreaker::from_config(&h.ctx.config)),
        h.ctx.loader.clone(),
        h.ctx.retry.clone(),
        h.ctx.metrics.clone(),
        h.ctx.config.clone(),
        h.shutdown.clone(),
    );
    supervisor.tick().await;

    let job = h.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.locked_by.is_none());

    // A surviving worker picks it up and counts the next attempt normally
    let survivor = Uuid::new_v4();
    let job = h.store.atomic_lock(id, survivor, 300).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);

    h.store.mark_completed(id, None).await.unwrap();
}

#[tokio::test]
async fn e5b_stranded_final_attempt_goes_to_dlq_as_timeout() {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let Some(h) = harness(fast_config()).await else {
        return;
    };

    let job_type = format!("stranded-{}", Uuid::new_v4());
    let id = h
        .queue
        .submit(
            &job_type,
            serde_json::json!({}),
            SubmitOptions {
                max_attempts: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The only attempt is taken and the worker dies
    let dead_worker = Uuid::new_v4();
    h.store.atomic_lock(id, dead_worker, 0).await.unwrap().unwrap();

    let supervisor = Supervisor::new(
        h.store.clone(),
        None,
        Arc::new(CircuitBreaker::from_config(&h.ctx.config)),
        h.ctx.loader.clone(),
        h.ctx.retry.clone(),
        h.ctx.metrics.clone(),
        h.ctx.config.clone(),
        h.shutdown.clone(),
    );
    supervisor.tick().await;

    let job = h.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let filter = DlqFilter {
        job_type: Some(job_type),
        ..Default::default()
    };
    let records = h.dlq.list(&filter, Pagination::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DlqReason::Timeout);
}

#[tokio::test]
async fn e6_priority_preemption() {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let Some(h) = harness(fast_config()).await else {
        return;
    };

    // A sea of normal work and one critical job, all due
    let normal_type = format!("normal-{}", Uuid::new_v4());
    let critical_type = format!("critical-{}", Uuid::new_v4());

    let mut normal_ids = Vec::new();
    for _ in 0..20 {
        normal_ids.push(
            h.queue
                .submit(&normal_type, serde_json::json!({}), SubmitOptions::default())
                .await
                .unwrap(),
        );
    }
    let critical_id = h
        .queue
        .submit(
            &critical_type,
            serde_json::json!({}),
            SubmitOptions {
                priority: JobPriority::Critical,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let batch = h.ctx.loader.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.priority, JobPriority::Critical);
    assert_eq!(batch.jobs.len(), 1);
    assert_eq!(batch.jobs[0].id, critical_id);

    // Critical work drains before any normal job is handed out
    h.store.delete_pending(critical_id).await.unwrap();
    h.ctx.loader.clear_if_current(batch.batch_id).await;

    let batch = h.ctx.loader.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.priority, JobPriority::Normal);

    // A new critical arrival invalidates the normal batch on the next cycle
    let late_critical = h
        .queue
        .submit(
            &critical_type,
            serde_json::json!({}),
            SubmitOptions {
                priority: JobPriority::Critical,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let batch = h.ctx.loader.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.priority, JobPriority::Critical);
    assert_eq!(batch.jobs[0].id, late_critical);

    // Cleanup
    h.store.delete_pending(late_critical).await.unwrap();
    for id in normal_ids {
        h.store.delete_pending(id).await.unwrap();
    }
}
