//! Worker pool: batch consumption, handler execution, state transitions
//!
//! Each worker owns a process-unique identity and processes up to
//! `concurrency` jobs in parallel. The persistent store drives every state
//! transition; the cache lock is only a cheap contention filter in front
//! of it. Workers never fail a job because infrastructure flaked during a
//! state write; they abandon the write and let the supervisor reclaim.

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::jobs::batch::BatchLoader;
use crate::jobs::job::{Job, JobId};
use crate::jobs::lock::LockManager;
use crate::jobs::metrics::JobMetrics;
use crate::jobs::registry::{HandlerContext, HandlerOutcome, HandlerRegistry};
use crate::jobs::retry::{FailureKind, JobFailure, RetryScheduler};
use crate::jobs::store::JobStore;
use crate::Result;

/// Unique worker identifier
pub type WorkerId = Uuid;

/// Everything a worker needs to operate, shared across the pool
#[derive(Clone)]
pub struct QueueContext {
    pub store: JobStore,
    pub loader: Arc<BatchLoader>,
    pub locks: Arc<LockManager>,
    pub registry: Arc<HandlerRegistry>,
    pub retry: Arc<RetryScheduler>,
    pub metrics: Arc<JobMetrics>,
    pub config: Arc<QueueConfig>,
}

/// A single worker identity with bounded in-flight concurrency
pub struct Worker {
    pub id: WorkerId,
    ctx: QueueContext,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<DashMap<JobId, Instant>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(ctx: QueueContext, shutdown: CancellationToken) -> Self {
        let concurrency = ctx.config.concurrency;
        Self {
            id: Uuid::new_v4(),
            ctx,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            in_flight: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Job ids currently being processed by this worker
    pub fn in_flight(&self) -> Vec<JobId> {
        self.in_flight.iter().map(|entry| *entry.key()).collect()
    }

    /// Main loop: pull batches, dispatch jobs, stop on shutdown
    pub async fn run(self: Arc<Self>) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let batch = match self.ctx.loader.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    if !self.idle_wait().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Batch load failed, backing off");
                    if !self.idle_wait().await {
                        break;
                    }
                    continue;
                }
            };

            let mut dispatched = 0usize;
            for job in batch.jobs.iter() {
                let permit = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    permit = self.semaphore.clone().acquire_owned() => {
                        match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        }
                    }
                };

                let worker = self.clone();
                let job = job.clone();
                tokio::spawn(async move {
                    worker.process_job(job).await;
                    drop(permit);
                });
                dispatched += 1;
            }

            // The batch has been fully dispatched; the next cycle loads
            // fresh work (jobs now processing are no longer pending).
            self.ctx.loader.clear_if_current(batch.batch_id).await;

            if dispatched == 0 && !self.idle_wait().await {
                break;
            }
        }

        self.drain().await;
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleep one poll interval, or return false on shutdown
    async fn idle_wait(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.ctx.config.poll_interval()) => true,
        }
    }

    /// Wait for all in-flight jobs to finish
    async fn drain(&self) {
        let concurrency = self.ctx.config.concurrency as u32;
        if let Ok(permits) = self.semaphore.acquire_many(concurrency).await {
            permits.forget();
        }
    }

    /// Take one job through lock → handler → state transition
    async fn process_job(&self, job: Job) {
        let ttl_s = self.ctx.config.lock_ttl_s;

        if let Err(violation) = job.check_invariants() {
            self.quarantine(&job, &violation).await;
            return;
        }

        // a. Cache-layer claim; losing it means another worker owns the job
        if !self.ctx.locks.try_acquire(job.id, self.id, ttl_s).await {
            self.ctx.metrics.incr_locks_contended();
            return;
        }

        // b. Persistent lock: checks state and counts the attempt
        let attempts = self.ctx.config.store_retry_attempts;
        let locked = match retry_infra(attempts, || self.ctx.store.atomic_lock(job.id, self.id, ttl_s)).await
        {
            Ok(Some(locked)) => locked,
            Ok(None) => {
                self.ctx.metrics.incr_locks_contended();
                self.ctx.locks.release(job.id, self.id).await;
                return;
            }
            Err(e) => {
                // Store unreachable; nothing was written, so just retreat
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Persistent lock failed");
                self.ctx.locks.release(job.id, self.id).await;
                return;
            }
        };

        self.in_flight.insert(locked.id, Instant::now());
        self.ctx.metrics.incr_processed();

        debug!(
            worker_id = %self.id,
            job_id = %locked.id,
            job_type = %locked.job_type,
            attempt = locked.attempts,
            max_attempts = locked.max_attempts,
            "Processing job"
        );

        let verdict = self.invoke_handler(&locked).await;
        self.finalize(&locked, verdict).await;

        self.in_flight.remove(&locked.id);
        // The persistent lock is cleared by the state transition itself
        self.ctx.locks.release(locked.id, self.id).await;
    }

    /// Resolve and run the handler under the lock-TTL timeout, translating
    /// panics and timeouts into failure data.
    async fn invoke_handler(&self, job: &Job) -> std::result::Result<HandlerOutcome, JobFailure> {
        let Some(handler) = self.ctx.registry.get(&job.job_type) else {
            return Err(JobFailure::new(
                FailureKind::InvalidData,
                format!("no handler registered for type '{}'", job.job_type),
            ));
        };

        let ctx = HandlerContext {
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            queued_at: job.created_at,
            processing_at: Utc::now(),
        };

        let started = Instant::now();
        let invocation = AssertUnwindSafe(handler.handle(&job.payload, job.id, ctx)).catch_unwind();

        match tokio::time::timeout(self.ctx.config.lock_ttl(), invocation).await {
            Ok(Ok(outcome)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                Ok(if outcome.processing_time_ms == 0 {
                    outcome.with_timing(elapsed)
                } else {
                    outcome
                })
            }
            Ok(Err(panic)) => Err(JobFailure::new(
                FailureKind::Transient,
                format!("handler panicked: {}", panic_message(panic)),
            )),
            Err(_) => Err(JobFailure::new(
                FailureKind::Timeout,
                format!("handler exceeded lock ttl of {}s", self.ctx.config.lock_ttl_s),
            )),
        }
    }

    /// Write the outcome through the state machine
    async fn finalize(&self, job: &Job, verdict: std::result::Result<HandlerOutcome, JobFailure>) {
        // A worker whose lock has lapsed must not write; a successor (or
        // the supervisor) owns the record now.
        if job.lock_expired(Utc::now()) {
            warn!(
                worker_id = %self.id,
                job_id = %job.id,
                "Own lock expired before finalize, abandoning result"
            );
            self.ctx.metrics.incr_failed();
            return;
        }

        match verdict {
            Ok(outcome) if outcome.success => {
                let attempts = self.ctx.config.store_retry_attempts;
                let result = retry_infra(attempts, || {
                    self.ctx.store.mark_completed(job.id, outcome.data.clone())
                })
                .await;

                match result {
                    Ok(_) => {
                        self.ctx.metrics.incr_succeeded();
                        debug!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            processing_time_ms = outcome.processing_time_ms,
                            "Job completed"
                        );
                    }
                    Err(e) => {
                        // Supervisor will reclaim; the attempt is simply lost
                        error!(worker_id = %self.id, job_id = %job.id, error = %e, "Completion write failed");
                    }
                }
            }
            Ok(outcome) => {
                let failure = failure_from_outcome(&outcome);
                self.hand_off_failure(job, failure).await;
            }
            Err(failure) => {
                self.hand_off_failure(job, failure).await;
            }
        }
    }

    async fn hand_off_failure(&self, job: &Job, failure: JobFailure) {
        self.ctx.metrics.incr_failed();
        if let Err(e) = self.ctx.retry.on_failure(job, failure).await {
            error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failure handoff failed");
        }
    }

    /// Archive a record that violates the state-machine invariants
    async fn quarantine(&self, job: &Job, violation: &str) {
        error!(job_id = %job.id, violation, "Corrupted job record");

        // Take it through the lock so the terminal transition is legal;
        // if it cannot be locked, skip and leave it for the supervisor.
        let ttl_s = self.ctx.config.lock_ttl_s;
        match self.ctx.store.atomic_lock(job.id, self.id, ttl_s).await {
            Ok(Some(locked)) => {
                let failure = JobFailure::new(
                    FailureKind::System,
                    format!("invariant violation: {}", violation),
                );
                self.hand_off_failure(&locked, failure).await;
            }
            Ok(None) => {
                debug!(job_id = %job.id, "Corrupted record not lockable, skipping");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to quarantine corrupted record");
            }
        }
    }
}

/// Map a failed handler outcome to the scheduler's failure shape
fn failure_from_outcome(outcome: &HandlerOutcome) -> JobFailure {
    let error = outcome
        .error
        .clone()
        .unwrap_or_else(|| "handler reported failure without an error message".to_string());

    let kind = if outcome.fatal {
        FailureKind::Fatal
    } else {
        FailureKind::Transient
    };

    JobFailure::new(kind, error)
}

/// Render a panic payload as a message
fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounded retry for store operations hit by infrastructure errors.
/// Validation and conflict errors surface immediately.
async fn retry_infra<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = Duration::from_millis(200);

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_infrastructure() && attempt < max_retries => {
                attempt += 1;
                warn!(attempt, error = %e, "Store operation failed, retrying");

                let jitter = {
                    use rand::Rng;
                    rand::thread_rng().gen_range(0..=(delay.as_millis() as u64 / 2))
                };
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}

/// A set of workers sharing one queue context
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    config: Arc<QueueConfig>,
}

impl WorkerPool {
    /// Build `config.workers` workers over the shared context
    pub fn new(ctx: QueueContext, shutdown: CancellationToken) -> Self {
        let config = ctx.config.clone();
        let workers = (0..config.workers.max(1))
            .map(|_| Arc::new(Worker::new(ctx.clone(), shutdown.clone())))
            .collect();

        Self {
            workers,
            handles: Vec::new(),
            shutdown,
            config,
        }
    }

    /// Spawn every worker loop
    pub fn start(&mut self) {
        for worker in &self.workers {
            self.handles.push(tokio::spawn(worker.clone().run()));
        }
        info!(workers = self.workers.len(), "Worker pool started");
    }

    /// Stop pulling new work and wait for in-flight jobs within the grace
    /// period. Returns true on a clean drain, false on a forced exit.
    pub async fn shutdown(mut self) -> bool {
        info!(
            grace_s = self.config.grace_shutdown_s,
            "Worker pool shutting down"
        );
        self.shutdown.cancel();

        let drain = futures::future::join_all(self.handles.drain(..));
        match tokio::time::timeout(self.config.grace_shutdown(), drain).await {
            Ok(_) => {
                info!("Worker pool drained cleanly");
                true
            }
            Err(_) => {
                error!("Grace period exceeded, forcing worker pool exit");
                false
            }
        }
    }
}
