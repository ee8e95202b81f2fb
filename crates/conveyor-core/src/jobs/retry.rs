//! Retry scheduling and dead-letter handoff
//!
//! Every handler failure funnels through here exactly once. Failures with
//! attempts remaining re-enter the queue on the exponential schedule;
//! exhausted or non-retryable failures are archived, with the terminal
//! transition and the DLQ insert committed in one transaction.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::jobs::dead_letter::{self, DlqReason, DlqStore};
use crate::jobs::job::{ErrorEntry, Job};
use crate::jobs::metrics::JobMetrics;
use crate::jobs::store::{self, JobStore};
use crate::Result;

/// How a handler attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Ordinary failure; retried while budget remains
    Transient,

    /// Handler declared the job unprocessable; no retry
    Fatal,

    /// Lock expired before the handler returned
    Timeout,

    /// Unknown type or handler-rejected payload; no retry
    InvalidData,

    /// Corrupted record or unclassifiable infrastructure failure
    System,
}

impl FailureKind {
    /// Kinds that skip remaining attempts and go straight to the archive
    pub fn short_circuits(&self) -> bool {
        matches!(
            self,
            FailureKind::Fatal | FailureKind::InvalidData | FailureKind::System
        )
    }
}

/// A single failed attempt, as handed to the scheduler
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub error: String,
    pub stack: Option<String>,
}

impl JobFailure {
    pub fn new(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }
}

/// What the scheduler did with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued; due again at the given instant
    Retried { next_attempt_at: DateTime<Utc> },

    /// Archived with the given reason
    DeadLettered { reason: DlqReason },
}

/// Retry delay for a completed attempt count: `2^attempt` seconds, capped.
pub fn backoff_delay(attempt: i32, max_delay_s: u64) -> Duration {
    let attempt = attempt.max(0) as u32;
    // 2^a saturates well before the i64 range runs out
    let raw_s = if attempt >= 63 {
        i64::MAX
    } else {
        1i64 << attempt
    };
    Duration::seconds(raw_s.min(max_delay_s as i64))
}

/// Map a failure to its archive reason
pub fn classify(kind: FailureKind) -> DlqReason {
    match kind {
        FailureKind::Fatal => DlqReason::FatalError,
        FailureKind::Timeout => DlqReason::Timeout,
        FailureKind::InvalidData => DlqReason::InvalidData,
        FailureKind::System => DlqReason::SystemError,
        FailureKind::Transient => DlqReason::MaxAttemptsExceeded,
    }
}

/// Drives the failure side of the job state machine
pub struct RetryScheduler {
    store: JobStore,
    dlq: DlqStore,
    config: Arc<QueueConfig>,
    metrics: Arc<JobMetrics>,
}

impl RetryScheduler {
    pub fn new(
        store: JobStore,
        dlq: DlqStore,
        config: Arc<QueueConfig>,
        metrics: Arc<JobMetrics>,
    ) -> Self {
        Self {
            store,
            dlq,
            config,
            metrics,
        }
    }

    /// Handle one failed attempt for a job currently in `processing`.
    ///
    /// `job` must be the record as returned by `atomic_lock`, so
    /// `job.attempts` already counts the attempt that just failed.
    pub async fn on_failure(&self, job: &Job, failure: JobFailure) -> Result<FailureDisposition> {
        let entry = ErrorEntry::new(job.attempts, failure.error.clone(), failure.stack.clone());

        let exhausted = job.attempts >= job.max_attempts;
        if failure.kind.short_circuits() || exhausted {
            let reason = if failure.kind == FailureKind::Transient && exhausted {
                DlqReason::MaxAttemptsExceeded
            } else if failure.kind == FailureKind::Timeout && exhausted {
                DlqReason::Timeout
            } else {
                classify(failure.kind)
            };
            return self.dead_letter(job, entry, reason).await;
        }

        let delay = backoff_delay(job.attempts, self.config.max_retry_delay_s);
        let next_attempt_at = Utc::now() + delay;

        self.store
            .mark_failed_retry(job.id, &entry, next_attempt_at)
            .await?;
        self.metrics.incr_retried();

        info!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_s = delay.num_seconds(),
            error = %failure.error,
            "Job requeued for retry"
        );

        Ok(FailureDisposition::Retried { next_attempt_at })
    }

    /// Archive a job and flip it terminal in one transaction, so no
    /// observer sees a failed job without its audit record or vice versa.
    pub async fn dead_letter(
        &self,
        job: &Job,
        entry: ErrorEntry,
        reason: DlqReason,
    ) -> Result<FailureDisposition> {
        let mut history = job.error_history.0.clone();
        history.push(entry.clone());

        let mut tx = self.store.pool().begin().await?;
        dead_letter::insert_exec(&mut *tx, job, reason, &entry.error, &history).await?;
        store::mark_failed_terminal_exec(&mut *tx, job.id, &entry).await?;
        tx.commit().await?;

        self.metrics.incr_dead_lettered();

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            reason = %reason,
            error = %entry.error,
            "Job archived to dead-letter queue"
        );

        Ok(FailureDisposition::DeadLettered { reason })
    }
}
