//! Dead-letter archive for jobs that can no longer be processed
//!
//! Kept in its own table so failure analytics and audits never compete
//! with hot-path queue reads. Records are immutable except for the
//! reprocessing link written when an operator requeues one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use std::fmt;
use tracing::info;
use uuid::Uuid;

use crate::jobs::job::{ErrorEntry, Job, JobPriority, NewJob};
use crate::jobs::store::JobStore;
use crate::{Error, Result};

/// Why a job was archived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dlq_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    /// Attempt budget spent on transient failures
    MaxAttemptsExceeded,

    /// Handler declared the failure fatal
    FatalError,

    /// Lock expired before the handler returned
    Timeout,

    /// Unknown type or handler-rejected payload
    InvalidData,

    /// Corrupted record or unclassifiable failure
    SystemError,
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DlqReason::MaxAttemptsExceeded => write!(f, "max_attempts_exceeded"),
            DlqReason::FatalError => write!(f, "fatal_error"),
            DlqReason::Timeout => write!(f, "timeout"),
            DlqReason::InvalidData => write!(f, "invalid_data"),
            DlqReason::SystemError => write!(f, "system_error"),
        }
    }
}

/// One archived job with its complete failure trail
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: Uuid,

    /// The original job
    pub job_id: Uuid,

    /// Copied at insertion time; the live record may later be pruned
    pub job_type: String,
    pub priority: JobPriority,
    pub payload: Value,

    pub final_error: String,
    pub error_history: Json<Vec<ErrorEntry>>,
    pub total_attempts: i32,
    pub reason: DlqReason,
    pub failed_at: DateTime<Utc>,

    /// Manual requeue tracking
    pub reprocessed: bool,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub reprocessing_job_id: Option<Uuid>,
}

/// Filter for DLQ listings
#[derive(Debug, Default, Clone)]
pub struct DlqFilter {
    pub reason: Option<DlqReason>,
    pub job_type: Option<String>,
}

/// Offset pagination for DLQ listings
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// PostgreSQL-backed dead-letter store
#[derive(Clone)]
pub struct DlqStore {
    pool: PgPool,
}

impl DlqStore {
    /// Create a new store over a connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Archive a job. The final error entry must already be part of
    /// `history`; `job` carries the state at terminal failure.
    pub async fn insert(
        &self,
        job: &Job,
        reason: DlqReason,
        final_error: &str,
        history: &[ErrorEntry],
    ) -> Result<DeadLetter> {
        insert_exec(&self.pool, job, reason, final_error, history).await
    }

    /// Fetch one record
    pub async fn get(&self, dlq_id: Uuid) -> Result<Option<DeadLetter>> {
        let record = sqlx::query_as::<_, DeadLetter>("SELECT * FROM dead_letters WHERE id = $1")
            .bind(dlq_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// List records, newest failures first
    pub async fn list(&self, filter: &DlqFilter, page: Pagination) -> Result<Vec<DeadLetter>> {
        let records = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT * FROM dead_letters
            WHERE ($1::dlq_reason IS NULL OR reason = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY failed_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.reason)
        .bind(filter.job_type.as_deref())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Counts grouped by failure reason
    pub async fn stats_by_reason(&self) -> Result<Vec<(DlqReason, i64)>> {
        let rows = sqlx::query_as(
            "SELECT reason, COUNT(*) FROM dead_letters GROUP BY reason ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Counts grouped by job type
    pub async fn stats_by_type(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as(
            "SELECT job_type, COUNT(*) FROM dead_letters GROUP BY job_type ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Total archived records
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Requeue an archived job as a fresh pending job with a reset attempt
    /// budget. The archive record is retained for audit and linked to the
    /// replacement. Fails if the record was already reprocessed.
    pub async fn reprocess(
        &self,
        store: &JobStore,
        dlq_id: Uuid,
        override_payload: Option<Value>,
    ) -> Result<Uuid> {
        let record = self
            .get(dlq_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("dead letter {}", dlq_id)))?;

        if record.reprocessed {
            return Err(Error::conflict(format!(
                "dead letter {} was already reprocessed",
                dlq_id
            )));
        }

        let payload = override_payload.unwrap_or_else(|| record.payload.clone());
        let new_job = store
            .create_job(
                NewJob::new(record.job_type.clone(), payload).with_priority(record.priority),
            )
            .await?;

        let updated = sqlx::query(
            r#"
            UPDATE dead_letters SET
                reprocessed = TRUE,
                reprocessed_at = NOW(),
                reprocessing_job_id = $2
            WHERE id = $1 AND NOT reprocessed
            "#,
        )
        .bind(dlq_id)
        .bind(new_job.id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Lost a race with another operator; withdraw the duplicate
            store.delete_pending(new_job.id).await?;
            return Err(Error::conflict(format!(
                "dead letter {} was already reprocessed",
                dlq_id
            )));
        }

        info!(dlq_id = %dlq_id, new_job_id = %new_job.id, "Dead letter reprocessed");

        Ok(new_job.id)
    }

    /// Remove records older than the given instant. Returns removed count.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE failed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Insert against any executor, so the retry scheduler can pair the DLQ
/// insert with the terminal transition in one transaction.
pub(crate) async fn insert_exec<'e, E>(
    executor: E,
    job: &Job,
    reason: DlqReason,
    final_error: &str,
    history: &[ErrorEntry],
) -> Result<DeadLetter>
where
    E: sqlx::PgExecutor<'e>,
{
    let record = sqlx::query_as::<_, DeadLetter>(
        r#"
        INSERT INTO dead_letters (
            id, job_id, job_type, priority, payload,
            final_error, error_history, total_attempts, reason
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(job.id)
    .bind(&job.job_type)
    .bind(job.priority)
    .bind(&job.payload)
    .bind(final_error)
    .bind(Json(history))
    .bind(job.attempts)
    .bind(reason)
    .fetch_one(executor)
    .await?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{create_pool, migrate::Migrator};
    use crate::jobs::job::JobStatus;

    async fn test_stores() -> Option<(JobStore, DlqStore)> {
        // Requires a local Postgres; tests skip silently when unavailable
        let pool = create_pool(&DatabaseConfig::default()).await.ok()?;
        Migrator::new(pool.clone()).migrate().await.ok()?;
        Some((JobStore::new(pool.clone()), DlqStore::new(pool)))
    }

    #[test]
    fn test_reason_wire_format() {
        assert_eq!(DlqReason::MaxAttemptsExceeded.to_string(), "max_attempts_exceeded");
        assert_eq!(DlqReason::FatalError.to_string(), "fatal_error");
        assert_eq!(
            serde_json::to_string(&DlqReason::InvalidData).unwrap(),
            "\"invalid_data\""
        );
    }

    #[tokio::test]
    async fn test_insert_and_filtered_list() {
        let Some((store, dlq)) = test_stores().await else {
            return;
        };

        let job_type = format!("dlq-test-{}", Uuid::new_v4());
        let job = store
            .create_job(NewJob::new(&job_type, serde_json::json!({"n": 1})).with_max_attempts(1))
            .await
            .unwrap();
        let worker = Uuid::new_v4();
        let job = store.atomic_lock(job.id, worker, 300).await.unwrap().unwrap();

        let entry = ErrorEntry::new(1, "boom", None);
        let job = store.mark_failed_terminal(job.id, &entry).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let record = dlq
            .insert(&job, DlqReason::MaxAttemptsExceeded, "boom", &job.error_history.0)
            .await
            .unwrap();
        assert_eq!(record.job_id, job.id);
        assert_eq!(record.total_attempts, 1);
        assert!(!record.reprocessed);

        let filter = DlqFilter {
            job_type: Some(job_type.clone()),
            ..Default::default()
        };
        let listed = dlq.list(&filter, Pagination::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].final_error, "boom");
    }

    #[tokio::test]
    async fn test_reprocess_links_and_resets() {
        let Some((store, dlq)) = test_stores().await else {
            return;
        };

        let job_type = format!("dlq-reproc-{}", Uuid::new_v4());
        let job = store
            .create_job(NewJob::new(&job_type, serde_json::json!({})).with_max_attempts(1))
            .await
            .unwrap();
        let worker = Uuid::new_v4();
        let job = store.atomic_lock(job.id, worker, 300).await.unwrap().unwrap();
        let entry = ErrorEntry::new(1, "bad", None);
        let job = store.mark_failed_terminal(job.id, &entry).await.unwrap();

        let record = dlq
            .insert(&job, DlqReason::FatalError, "bad", &job.error_history.0)
            .await
            .unwrap();

        let new_id = dlq.reprocess(&store, record.id, None).await.unwrap();

        let fresh = store.get_job(new_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Pending);
        assert_eq!(fresh.attempts, 0);
        assert_eq!(fresh.job_type, job_type);

        let record = dlq.get(record.id).await.unwrap().unwrap();
        assert!(record.reprocessed);
        assert_eq!(record.reprocessing_job_id, Some(new_id));

        // Double reprocess is rejected
        assert!(dlq.reprocess(&store, record.id, None).await.is_err());

        store.delete_pending(new_id).await.unwrap();
    }
}
