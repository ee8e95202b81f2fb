//! Durable job record store backed by PostgreSQL
//!
//! All queue state transitions flow through this store as single
//! conditional UPDATE statements, so concurrent workers can never observe
//! or produce an illegal transition. The batch cache accelerates reads;
//! this store is the only authority.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::jobs::job::{ErrorEntry, Job, JobId, JobPriority, NewJob};
use crate::{Error, Result};

/// Queue totals by status
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    /// Total records
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// PostgreSQL-backed job record store
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    /// Create a new store over a connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool (for cross-store transactions)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a fresh pending job
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        if !(1..=10).contains(&new_job.max_attempts) {
            return Err(Error::validation(format!(
                "max_attempts must be between 1 and 10, got {}",
                new_job.max_attempts
            )));
        }

        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, job_type, payload, priority, max_attempts, scheduled_for)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_job.job_type)
        .bind(&new_job.payload)
        .bind(new_job.priority)
        .bind(new_job.max_attempts)
        .bind(new_job.scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        debug!(job_id = %job.id, job_type = %job.job_type, priority = %job.priority, "Job created");

        Ok(job)
    }

    /// Fetch a job by id
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Due pending jobs of one priority class, fairest first.
    ///
    /// Read-only; claiming happens through `atomic_lock`.
    pub async fn find_due_pending(&self, priority: JobPriority, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'pending'
              AND priority = $1
              AND scheduled_for <= NOW()
            ORDER BY scheduled_for ASC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(priority)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// True when a due pending job exists strictly above the given class.
    /// Drives batch preemption.
    pub async fn has_due_pending_above(&self, priority: JobPriority) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE status = 'pending'
                  AND priority > $1
                  AND scheduled_for <= NOW()
            )
            "#,
        )
        .bind(priority)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Acquire the persistent exclusive lock, transitioning the record to
    /// `processing` and counting the attempt.
    ///
    /// Succeeds for a pending job, an expired `processing` job, or a
    /// re-acquire by the current holder (which refreshes the expiry without
    /// a second attempt increment). Returns `None` on contention.
    pub async fn atomic_lock(
        &self,
        job_id: JobId,
        worker_id: Uuid,
        ttl_s: u64,
    ) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = 'processing',
                locked_by = $2,
                locked_until = NOW() + make_interval(secs => $3),
                attempts = CASE
                    WHEN status = 'processing' AND locked_by = $2 AND locked_until > NOW()
                    THEN attempts
                    ELSE attempts + 1
                END,
                updated_at = NOW()
            WHERE id = $1
              AND (
                    (status = 'pending' AND attempts < max_attempts)
                 OR (status = 'processing' AND locked_until < NOW() AND attempts < max_attempts)
                 OR (status = 'processing' AND locked_by = $2 AND locked_until > NOW())
              )
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(ttl_s as f64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Record terminal success. Legal only from `processing`.
    pub async fn mark_completed(&self, job_id: JobId, result: Option<Value>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = 'completed',
                result = $2,
                locked_by = NULL,
                locked_until = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(result)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| Error::conflict(format!("job {} is not processing", job_id)))
    }

    /// Record a retryable failure: append the error, reset to `pending`
    /// with a later due time, release the lock. Legal only from
    /// `processing` with attempts remaining.
    pub async fn mark_failed_retry(
        &self,
        job_id: JobId,
        entry: &ErrorEntry,
        next_scheduled_for: DateTime<Utc>,
    ) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = 'pending',
                locked_by = NULL,
                locked_until = NULL,
                scheduled_for = $2,
                last_error = $3,
                error_history = error_history || $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND attempts < max_attempts
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(next_scheduled_for)
        .bind(&entry.error)
        .bind(Json(entry))
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| {
            Error::conflict(format!(
                "job {} is not processing or has no attempts left",
                job_id
            ))
        })
    }

    /// Record terminal failure. Legal only from `processing`. The caller
    /// pairs this with a DLQ insert in the same transaction.
    pub async fn mark_failed_terminal(&self, job_id: JobId, entry: &ErrorEntry) -> Result<Job> {
        mark_failed_terminal_exec(&self.pool, job_id, entry).await
    }

    /// Return every expired `processing` job with attempts remaining to
    /// `pending`. Idempotent; repeated calls move nothing past `pending`.
    pub async fn release_expired_locks(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'pending',
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE status = 'processing'
              AND locked_until < $1
              AND attempts < max_attempts
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Expired `processing` jobs whose attempt budget is spent. Their final
    /// attempt was lost to a crash; the supervisor archives them with
    /// reason `timeout` instead of reclaiming.
    pub async fn find_expired_exhausted(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'processing'
              AND locked_until < $1
              AND attempts >= max_attempts
            ORDER BY locked_until ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Administrative delete of a pending job (pre-execution cancel).
    pub async fn delete_pending(&self, job_id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status = 'pending'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Queue totals by status
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(crate::jobs::job::JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            use crate::jobs::job::JobStatus::*;
            match status {
                Pending => stats.pending = count,
                Processing => stats.processing = count,
                Completed => stats.completed = count,
                Failed => stats.failed = count,
            }
        }

        Ok(stats)
    }
}

/// Terminal-failure transition against any executor, so the retry
/// scheduler can run it inside the DLQ transaction.
pub(crate) async fn mark_failed_terminal_exec<'e, E>(
    executor: E,
    job_id: JobId,
    entry: &ErrorEntry,
) -> Result<Job>
where
    E: sqlx::PgExecutor<'e>,
{
    let job = sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs SET
            status = 'failed',
            locked_by = NULL,
            locked_until = NULL,
            last_error = $2,
            error_history = error_history || $3,
            failed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        RETURNING *
        "#,
    )
    .bind(job_id)
    .bind(&entry.error)
    .bind(Json(entry))
    .fetch_optional(executor)
    .await?;

    job.ok_or_else(|| Error::conflict(format!("job {} is not processing", job_id)))
}
