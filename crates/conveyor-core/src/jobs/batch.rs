//! Priority batch loading
//!
//! Materializes the next slice of due work into memory (and, when the
//! cache is healthy, into Redis) in strict priority order. Lower classes
//! are only consulted when every higher class is empty at that instant;
//! fairness within a class comes from `(scheduled_for, created_at)`
//! ordering in the store.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{QueueKeys, RedisPool};
use crate::config::QueueConfig;
use crate::jobs::job::{Job, JobPriority};
use crate::jobs::metrics::JobMetrics;
use crate::jobs::store::JobStore;
use crate::jobs::supervisor::CircuitBreaker;
use crate::Result;

/// A group of jobs at one priority from a single load cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Random identifier
    pub batch_id: Uuid,

    /// Jobs in dispatch order
    pub jobs: Vec<Job>,

    /// The class every job in this batch shares
    pub priority: JobPriority,

    /// When the batch was loaded
    pub loaded_at: DateTime<Utc>,

    /// Validity window in seconds
    pub ttl_s: u64,
}

impl Batch {
    /// Assemble a fresh batch
    pub fn new(jobs: Vec<Job>, priority: JobPriority, ttl: Duration) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            jobs,
            priority,
            loaded_at: Utc::now(),
            ttl_s: ttl.as_secs(),
        }
    }

    /// A batch is consumable only inside its validity window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.loaded_at >= chrono::Duration::seconds(self.ttl_s as i64)
    }
}

/// Loads batches from the store and publishes them to the cache
pub struct BatchLoader {
    store: JobStore,
    cache: Option<RedisPool>,
    breaker: Arc<CircuitBreaker>,
    config: Arc<QueueConfig>,
    keys: QueueKeys,
    current: ArcSwapOption<Batch>,
    metrics: Arc<JobMetrics>,
}

impl BatchLoader {
    pub fn new(
        store: JobStore,
        cache: Option<RedisPool>,
        breaker: Arc<CircuitBreaker>,
        config: Arc<QueueConfig>,
        metrics: Arc<JobMetrics>,
    ) -> Self {
        let keys = QueueKeys::new(config.name.clone());
        Self {
            store,
            cache,
            breaker,
            config,
            keys,
            current: ArcSwapOption::const_empty(),
            metrics,
        }
    }

    /// Produce the next consumable batch, or `None` when no work is due.
    ///
    /// Reuses the current batch while it is valid; otherwise scans the
    /// priority classes highest-first and publishes the first non-empty
    /// result. A due job above the current batch's class discards the
    /// current batch before reuse is considered.
    pub async fn next_batch(&self) -> Result<Option<Arc<Batch>>> {
        self.invalidate_if_preempted().await?;

        let now = Utc::now();
        if let Some(current) = self.current.load_full() {
            if !current.is_expired(now) && !current.jobs.is_empty() {
                return Ok(Some(current));
            }
            self.discard(&current).await;
        }

        for priority in JobPriority::descending() {
            let jobs = self
                .store
                .find_due_pending(priority, self.config.batch_size)
                .await?;

            if jobs.is_empty() {
                continue;
            }

            let batch = Arc::new(Batch::new(jobs, priority, self.config.batch_ttl()));
            self.publish(&batch).await;
            self.current.store(Some(batch.clone()));
            self.metrics.incr_batches_loaded();

            info!(
                batch_id = %batch.batch_id,
                priority = %batch.priority,
                jobs = batch.jobs.len(),
                "Batch loaded"
            );

            return Ok(Some(batch));
        }

        Ok(None)
    }

    /// Discard the current batch when a strictly higher class has due
    /// work. Workers executing jobs from the old batch are unaffected;
    /// the lock and the store, not the batch, are the source of truth.
    pub async fn invalidate_if_preempted(&self) -> Result<()> {
        let Some(current) = self.current.load_full() else {
            return Ok(());
        };

        if current.priority == JobPriority::Critical {
            return Ok(());
        }

        if self.store.has_due_pending_above(current.priority).await? {
            debug!(
                batch_id = %current.batch_id,
                priority = %current.priority,
                "Higher-priority work arrived, discarding current batch"
            );
            self.discard(&current).await;
        }

        Ok(())
    }

    /// Drop the current batch if the given one is still current. Called by
    /// workers after a dispatch pass so the next cycle loads fresh work.
    pub async fn clear_if_current(&self, batch_id: Uuid) {
        if let Some(current) = self.current.load_full() {
            if current.batch_id == batch_id {
                self.discard(&current).await;
            }
        }
    }

    /// Drop an expired current batch
    pub async fn sweep_stale(&self) {
        if let Some(current) = self.current.load_full() {
            if current.is_expired(Utc::now()) {
                debug!(batch_id = %current.batch_id, "Sweeping stale batch");
                self.discard(&current).await;
            }
        }
    }

    /// Publish a batch snapshot to the cache, best effort. Skipped
    /// entirely while the circuit is not closed.
    async fn publish(&self, batch: &Batch) {
        let Some(pool) = &self.cache else {
            self.metrics.incr_degraded_polls();
            return;
        };

        if !self.breaker.is_closed() {
            self.metrics.incr_degraded_polls();
            return;
        }

        let payload = match serde_json::to_vec(batch) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize batch for cache");
                return;
            }
        };

        let key = self.keys.batch(batch.batch_id);
        let result = async {
            let mut conn = pool.get().await?;
            conn.set_ex(&key, &payload, batch.ttl_s).await
        }
        .await;

        match result {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                warn!(error = %e, "Failed to publish batch to cache");
                self.breaker.record_failure();
            }
        }
    }

    async fn discard(&self, batch: &Batch) {
        self.current.store(None);

        // Remove the cache snapshot, best effort
        if let Some(pool) = &self.cache {
            if self.breaker.is_closed() {
                let key = self.keys.batch(batch.batch_id);
                if let Ok(mut conn) = pool.get().await {
                    let _ = conn.del(&key).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    fn job_at(priority: JobPriority) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            job_type: "notify".to_string(),
            payload: serde_json::json!({}),
            priority,
            status: crate::jobs::job::JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            scheduled_for: now,
            locked_by: None,
            locked_until: None,
            last_error: None,
            error_history: Json(vec![]),
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
        }
    }

    #[test]
    fn test_batch_expiry_window() {
        let batch = Batch::new(vec![job_at(JobPriority::Normal)], JobPriority::Normal, Duration::from_secs(1800));

        let now = Utc::now();
        assert!(!batch.is_expired(now));
        assert!(batch.is_expired(now + chrono::Duration::seconds(1800)));
        assert!(batch.is_expired(now + chrono::Duration::seconds(3600)));
    }

    #[test]
    fn test_batch_serialization_roundtrip() {
        let batch = Batch::new(vec![job_at(JobPriority::Critical)], JobPriority::Critical, Duration::from_secs(60));

        let bytes = serde_json::to_vec(&batch).unwrap();
        let decoded: Batch = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.batch_id, batch.batch_id);
        assert_eq!(decoded.priority, JobPriority::Critical);
        assert_eq!(decoded.jobs.len(), 1);
        assert_eq!(decoded.jobs[0].id, batch.jobs[0].id);
    }

    #[test]
    fn test_zero_ttl_batch_is_immediately_stale() {
        let batch = Batch::new(vec![], JobPriority::Low, Duration::ZERO);
        assert!(batch.is_expired(Utc::now()));
    }
}
