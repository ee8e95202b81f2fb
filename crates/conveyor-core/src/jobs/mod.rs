//! Durable background job processing
//!
//! A two-tier queue: PostgreSQL holds every job record and drives the
//! state machine; Redis carries pre-loaded batches and short-lived worker
//! locks for high-throughput dispatch. Every accepted job is processed to
//! completion, retried with bounded attempts on failure, and archived to
//! the dead-letter queue when its budget runs out, across worker
//! crashes, cache outages, and restarts.
//!
//! ## Architecture
//!
//! - [`store::JobStore`]: durable records and atomic state transitions
//! - [`dead_letter::DlqStore`]: terminal-failure archive and reprocessing
//! - [`batch::BatchLoader`]: strict-priority batch materialization
//! - [`lock::LockManager`]: two-layer exclusive job locking
//! - [`worker::WorkerPool`]: bounded-concurrency handler execution
//! - [`retry::RetryScheduler`]: exponential backoff and DLQ handoff
//! - [`supervisor::Supervisor`]: circuit breaker, lock reclamation,
//!   degraded-mode switching
//!
//! The store is the single authority. The cache is a best-effort
//! accelerator whose outage degrades throughput, never correctness.

pub mod batch;
pub mod dead_letter;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod worker;

// Re-export main types
pub use batch::{Batch, BatchLoader};
pub use dead_letter::{DeadLetter, DlqFilter, DlqReason, DlqStore, Pagination};
pub use job::{ErrorEntry, Job, JobId, JobPriority, JobStatus, NewJob};
pub use lock::{LockManager, LockMode};
pub use metrics::{JobMetrics, MetricsSummary};
pub use registry::{HandlerContext, HandlerOutcome, HandlerRegistry, JobHandler};
pub use retry::{backoff_delay, FailureDisposition, FailureKind, JobFailure, RetryScheduler};
pub use store::{JobStore, QueueStats};
pub use supervisor::{CircuitBreaker, CircuitState, Supervisor};
pub use worker::{QueueContext, Worker, WorkerId, WorkerPool};

use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::QueueConfig;

/// Job processing result type
pub type JobProcessingResult<T> = Result<T, JobError>;

/// Error types for job submission and processing
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job data: {0}")]
    InvalidData(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Job not found: {0}")]
    NotFound(Uuid),
}

impl From<crate::Error> for JobError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Validation(msg) => JobError::InvalidData(msg),
            crate::Error::Cache(msg) => JobError::Cache(msg),
            other => JobError::Store(other.to_string()),
        }
    }
}

impl From<crate::cache::CacheError> for JobError {
    fn from(err: crate::cache::CacheError) -> Self {
        JobError::Cache(err.to_string())
    }
}

/// Submission options accepted by the producer API
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub priority: JobPriority,
    pub max_attempts: i32,
    pub delay_ms: u64,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            max_attempts: 3,
            delay_ms: 0,
        }
    }
}

/// Producer-facing queue handle.
///
/// Validates submissions synchronously; an invalid submission never
/// creates a record.
pub struct JobQueue {
    store: JobStore,
    config: Arc<QueueConfig>,
    registry: Option<Arc<HandlerRegistry>>,
}

impl JobQueue {
    pub fn new(store: JobStore, config: Arc<QueueConfig>) -> Self {
        Self {
            store,
            config,
            registry: None,
        }
    }

    /// Attach a handler registry so unknown types are rejected at submit
    /// time. Producers in other processes submit without one; unknown
    /// types then fail at dispatch instead.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Submit a job. Returns its id.
    pub async fn submit(
        &self,
        job_type: &str,
        payload: Value,
        options: SubmitOptions,
    ) -> JobProcessingResult<Uuid> {
        if job_type.is_empty() {
            return Err(JobError::InvalidData("job type must not be empty".to_string()));
        }

        if let Some(registry) = &self.registry {
            if !registry.contains(job_type) {
                return Err(JobError::InvalidData(format!(
                    "unrecognized job type '{}'",
                    job_type
                )));
            }
        }

        if !(1..=10).contains(&options.max_attempts) {
            return Err(JobError::InvalidData(format!(
                "max_attempts must be between 1 and 10, got {}",
                options.max_attempts
            )));
        }

        let size = serde_json::to_vec(&payload)
            .map_err(|e| JobError::InvalidData(format!("unserializable payload: {}", e)))?
            .len();
        if size > self.config.max_payload_bytes {
            return Err(JobError::InvalidData(format!(
                "payload of {} bytes exceeds the {} byte bound",
                size, self.config.max_payload_bytes
            )));
        }

        let scheduled_for = Utc::now() + Duration::milliseconds(options.delay_ms as i64);
        let job = self
            .store
            .create_job(
                NewJob::new(job_type, payload)
                    .with_priority(options.priority)
                    .with_max_attempts(options.max_attempts)
                    .scheduled_for(scheduled_for),
            )
            .await?;

        Ok(job.id)
    }

    /// Fetch a job by id
    pub async fn get_job(&self, job_id: Uuid) -> JobProcessingResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Queue totals by status
    pub async fn stats(&self) -> JobProcessingResult<QueueStats> {
        Ok(self.store.stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{create_pool, migrate::Migrator};

    async fn test_queue() -> Option<JobQueue> {
        // Requires a local Postgres; tests skip silently when unavailable
        let pool = create_pool(&DatabaseConfig::default()).await.ok()?;
        Migrator::new(pool.clone()).migrate().await.ok()?;
        Some(JobQueue::new(
            JobStore::new(pool),
            Arc::new(QueueConfig::default()),
        ))
    }

    #[test]
    fn test_submit_options_defaults() {
        let options = SubmitOptions::default();
        assert_eq!(options.priority, JobPriority::Normal);
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.delay_ms, 0);
    }

    #[tokio::test]
    async fn test_submit_validation_creates_no_record() {
        let Some(queue) = test_queue().await else {
            return;
        };

        let job_type = format!("rejected-{}", Uuid::new_v4());

        let err = queue
            .submit(
                &job_type,
                serde_json::json!({}),
                SubmitOptions {
                    max_attempts: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidData(_)));

        let err = queue
            .submit("", serde_json::json!({}), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidData(_)));

        // No record was created for the rejected submissions
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE job_type = $1")
            .bind(&job_type)
            .fetch_one(queue.store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_unregistered_type_with_registry() {
        let Some(queue) = test_queue().await else {
            return;
        };

        let registry = Arc::new(HandlerRegistry::new());
        let queue = queue.with_registry(registry);

        let err = queue
            .submit("unknown", serde_json::json!({}), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_submit_with_delay_is_not_yet_due() {
        let Some(queue) = test_queue().await else {
            return;
        };

        let id = queue
            .submit(
                "notify",
                serde_json::json!({"user": "u1"}),
                SubmitOptions {
                    delay_ms: 60_000,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.scheduled_for > Utc::now());
    }
}
