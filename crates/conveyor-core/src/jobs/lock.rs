//! Two-layer job locking
//!
//! The primary layer is a Redis `SET NX EX` claim that cheaply filters
//! contention between workers. The persistent layer, `atomic_lock` on the
//! job store, is always taken afterwards and is the actual mutual
//! exclusion guarantee, so a cache outage (or a lost cache lock) can never
//! let two workers finalize the same job.
//!
//! Which layer fronts the store is a process-global decision made by the
//! supervisor's circuit breaker; mixed-mode operation cannot occur.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{QueueKeys, RedisPool};
use crate::jobs::supervisor::CircuitBreaker;

/// Which lock layer fronts the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Redis claims filter contention before the store lock
    Cache,

    /// Store locks only (cache missing or circuit open)
    Persistent,
}

/// Serialized claim stored under `queue:<name>:locks:<job_id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockClaim {
    pub worker_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub ttl_s: u64,
}

/// Issues and releases short-lived exclusive claims over job ids
pub struct LockManager {
    cache: Option<RedisPool>,
    breaker: Arc<CircuitBreaker>,
    keys: QueueKeys,
}

impl LockManager {
    pub fn new(cache: Option<RedisPool>, breaker: Arc<CircuitBreaker>, queue_name: &str) -> Self {
        Self {
            cache,
            breaker,
            keys: QueueKeys::new(queue_name),
        }
    }

    /// The lock layer currently in force
    pub fn mode(&self) -> LockMode {
        match &self.cache {
            Some(_) if self.breaker.is_closed() => LockMode::Cache,
            _ => LockMode::Persistent,
        }
    }

    /// Try to claim a job for a worker. Returns true when the caller may
    /// proceed to the persistent lock.
    ///
    /// In persistent mode there is no cache-side claim and every caller
    /// proceeds; the store's `atomic_lock` arbitrates. A cache error is
    /// reported to the breaker and treated the same way.
    pub async fn try_acquire(&self, job_id: Uuid, worker_id: Uuid, ttl_s: u64) -> bool {
        let pool = match (&self.cache, self.mode()) {
            (Some(pool), LockMode::Cache) => pool,
            _ => return true,
        };

        let claim = LockClaim {
            worker_id,
            acquired_at: Utc::now(),
            ttl_s,
        };
        let value = match serde_json::to_vec(&claim) {
            Ok(bytes) => bytes,
            Err(_) => return true,
        };

        let key = self.keys.lock(job_id);
        let result = async {
            let mut conn = pool.get().await?;
            conn.set_nx_ex(&key, &value, ttl_s).await
        }
        .await;

        match result {
            Ok(acquired) => {
                self.breaker.record_success();
                if !acquired {
                    debug!(job_id = %job_id, "Cache lock held elsewhere");
                }
                acquired
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Cache lock acquire failed, falling through");
                self.breaker.record_failure();
                true
            }
        }
    }

    /// Release a claim, only if this worker still owns it. A successor's
    /// claim under the same key is left untouched.
    pub async fn release(&self, job_id: Uuid, worker_id: Uuid) {
        let pool = match (&self.cache, self.mode()) {
            (Some(pool), LockMode::Cache) => pool,
            _ => return,
        };

        let key = self.keys.lock(job_id);
        let result: crate::cache::CacheResult<()> = async {
            let mut conn = pool.get().await?;

            let Some(raw) = conn.get(&key).await? else {
                return Ok(());
            };

            match serde_json::from_slice::<LockClaim>(&raw) {
                Ok(claim) if claim.worker_id == worker_id => {
                    conn.del(&key).await?;
                }
                Ok(_) => {
                    debug!(job_id = %job_id, "Lock now owned by a successor, leaving it");
                }
                Err(_) => {
                    // Unparseable claim; remove it rather than wedge the key
                    conn.del(&key).await?;
                }
            }

            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "Cache lock release failed");
            self.breaker.record_failure();
        }
    }
}
