//! Resilience supervisor
//!
//! Watches the batch cache, drives the circuit breaker that switches the
//! whole process between cache-accelerated and direct-store operation, and
//! recovers work abandoned by crashed workers.
//!
//! Cache health state machine:
//!
//! ```text
//! closed --[N consecutive failures]--> open
//! open --[open window elapsed]--> half_open
//! half_open --[ping ok]--> closed
//! half_open --[ping fail]--> open
//! ```

use chrono::Utc;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::RedisPool;
use crate::config::QueueConfig;
use crate::jobs::batch::BatchLoader;
use crate::jobs::job::ErrorEntry;
use crate::jobs::metrics::JobMetrics;
use crate::jobs::retry::RetryScheduler;
use crate::jobs::store::JobStore;
use crate::jobs::DlqReason;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Cache healthy, normal operation
    Closed,

    /// Cache considered down; all cache traffic bypassed
    Open,

    /// Open window elapsed; one probe may be attempted
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Three-state breaker over batch cache operations.
///
/// Process-global: the batch loader and the lock manager read the same
/// instance, so the system is always entirely in cache mode or entirely in
/// persistent mode, never mixed.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_for: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_for,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Build from queue configuration
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            Duration::from_secs(config.circuit_open_s),
        )
    }

    /// Current state, promoting `Open` to `HalfOpen` once the open window
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed() >= self.open_for)
                .unwrap_or(true);
            if elapsed {
                inner.state = CircuitState::HalfOpen;
                debug!("Circuit half-open, probe allowed");
            }
        }
        inner.state
    }

    /// True when cache operations may be used for regular traffic
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Record a successful cache operation or probe
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            info!("Cache circuit closed, resuming cache-accelerated mode");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed cache operation or probe
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;

        let should_open = inner.state == CircuitState::HalfOpen
            || (inner.state == CircuitState::Closed
                && inner.consecutive_failures >= self.failure_threshold);

        if should_open {
            if inner.state != CircuitState::Open {
                warn!(
                    failures = inner.consecutive_failures,
                    open_s = self.open_for.as_secs(),
                    "Cache circuit opened, degrading to direct store polling"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

/// Periodic supervisor task
pub struct Supervisor {
    store: JobStore,
    cache: Option<RedisPool>,
    breaker: Arc<CircuitBreaker>,
    loader: Arc<BatchLoader>,
    retry: Arc<RetryScheduler>,
    metrics: Arc<JobMetrics>,
    config: Arc<QueueConfig>,
    shutdown: CancellationToken,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: JobStore,
        cache: Option<RedisPool>,
        breaker: Arc<CircuitBreaker>,
        loader: Arc<BatchLoader>,
        retry: Arc<RetryScheduler>,
        metrics: Arc<JobMetrics>,
        config: Arc<QueueConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            breaker,
            loader,
            retry,
            metrics,
            config,
            shutdown,
        }
    }

    /// Run ticks until shutdown
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.supervisor_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            tick_s = self.config.supervisor_tick_s,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        info!("Supervisor stopped");
    }

    /// One supervision pass: probe the cache, reclaim expired locks,
    /// archive stranded final attempts, sweep stale batches.
    pub async fn tick(&self) {
        self.probe_cache().await;
        self.reclaim_expired().await;
        self.sweep_stranded().await;
        self.loader.sweep_stale().await;

        let snap = self.metrics.snapshot();
        debug!(
            processed = snap.processed,
            succeeded = snap.succeeded,
            retried = snap.retried,
            dead_lettered = snap.dead_lettered,
            degraded_polls = snap.degraded_polls,
            "Supervisor tick"
        );
    }

    /// Health-probe the batch cache and feed the breaker
    async fn probe_cache(&self) {
        let Some(pool) = &self.cache else {
            return;
        };

        // While open, wait out the window; state() flips to half-open when
        // a probe is due.
        if self.breaker.state() == CircuitState::Open {
            return;
        }

        match pool.ping().await {
            Ok(latency) => {
                debug!(latency_ms = latency.as_millis() as u64, "Cache ping ok");
                self.breaker.record_success();
            }
            Err(e) => {
                warn!(error = %e, "Cache ping failed");
                self.breaker.record_failure();
            }
        }
    }

    /// Return expired-lock jobs with budget remaining to pending
    async fn reclaim_expired(&self) {
        match self.store.release_expired_locks(Utc::now()).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Reclaimed jobs with expired locks"),
            Err(e) => error!(error = %e, "Lock reclamation failed"),
        }
    }

    /// Archive expired-lock jobs whose final attempt was lost to a crash.
    /// Reclaiming them would breach the attempt budget, so they go to the
    /// DLQ with reason `timeout`.
    async fn sweep_stranded(&self) {
        let stranded = match self
            .store
            .find_expired_exhausted(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Stranded-job scan failed");
                return;
            }
        };

        for job in stranded {
            let entry = ErrorEntry::new(
                job.attempts,
                "lock expired before handler completion",
                None,
            );
            if let Err(e) = self
                .retry
                .dead_letter(&job, entry, DlqReason::Timeout)
                .await
            {
                error!(job_id = %job.id, error = %e, "Failed to archive stranded job");
            }
        }
    }
}
