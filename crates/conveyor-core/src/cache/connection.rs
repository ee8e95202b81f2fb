//! Redis connection management

use crate::cache::{CacheError, CacheResult, RedisConfig};
use redis::{aio::ConnectionManager, Client as RedisClient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Redis connection pool
///
/// Holds one multiplexed `ConnectionManager`; handles to it are cheap
/// clones. Reconnects with bounded retries when the connection drops.
#[derive(Clone)]
pub struct RedisPool {
    /// Redis client
    client: RedisClient,

    /// Connection manager for async operations
    manager: Arc<RwLock<Option<ConnectionManager>>>,

    /// Configuration
    config: Arc<RedisConfig>,
}

impl RedisPool {
    /// Create a new Redis connection pool and validate it with a PING
    pub async fn connect(config: RedisConfig) -> CacheResult<Self> {
        let client = RedisClient::open(&config.url[..])
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        let pool = Self {
            client,
            manager: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
        };

        pool.reconnect().await?;

        info!(url = %pool.config.url, "Redis pool connected");

        Ok(pool)
    }

    /// Get a connection handle
    pub async fn get(&self) -> CacheResult<RedisConnection> {
        {
            let manager_opt = self.manager.read().await;
            if let Some(manager) = manager_opt.as_ref() {
                return Ok(RedisConnection {
                    manager: manager.clone(),
                });
            }
        }

        // No live manager, attempt to (re)connect once
        self.reconnect().await?;

        let manager_opt = self.manager.read().await;
        match manager_opt.as_ref() {
            Some(manager) => Ok(RedisConnection {
                manager: manager.clone(),
            }),
            None => Err(CacheError::ConnectionError(
                "No connection available".to_string(),
            )),
        }
    }

    /// Reconnect to Redis with bounded retries
    pub async fn reconnect(&self) -> CacheResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(attempt, "Redis connect attempt");

            match self.attempt_connect().await {
                Ok(manager) => {
                    *self.manager.write().await = Some(manager);
                    if attempt > 1 {
                        info!(attempt, "Redis reconnected");
                    }
                    return Ok(());
                }
                Err(e) => {
                    error!(attempt, error = %e, "Redis connection attempt failed");

                    if attempt >= self.config.max_retries {
                        *self.manager.write().await = None;
                        return Err(CacheError::ConnectionError(format!(
                            "Failed to connect after {} attempts: {}",
                            attempt, e
                        )));
                    }

                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }

    /// Attempt a single connection and validate with PING
    async fn attempt_connect(&self) -> CacheResult<ConnectionManager> {
        let connect = ConnectionManager::new(self.client.clone());
        let mut manager = tokio::time::timeout(self.config.connect_timeout(), connect)
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        if pong != "PONG" {
            return Err(CacheError::ConnectionError(
                "Redis PING failed".to_string(),
            ));
        }

        Ok(manager)
    }

    /// Bounded-timeout health probe. Returns the round-trip latency.
    pub async fn ping(&self) -> CacheResult<Duration> {
        let mut conn = self.get().await?;
        let started = Instant::now();

        let result = tokio::time::timeout(self.config.ping_timeout(), async {
            redis::cmd("PING")
                .query_async::<String>(&mut conn.manager)
                .await
        })
        .await;

        match result {
            Ok(Ok(pong)) if pong == "PONG" => Ok(started.elapsed()),
            Ok(Ok(other)) => Err(CacheError::OperationError(format!(
                "unexpected PING reply: {}",
                other
            ))),
            Ok(Err(e)) => Err(CacheError::OperationError(e.to_string())),
            Err(_) => Err(CacheError::Timeout),
        }
    }
}

/// Single Redis connection handle
pub struct RedisConnection {
    /// Multiplexed connection (cheap clone)
    manager: ConnectionManager,
}

impl RedisConnection {
    /// Set a key with TTL
    pub async fn set_ex(&mut self, key: &str, value: &[u8], ttl_s: u64) -> CacheResult<()> {
        let reply: String = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_s)
            .query_async(&mut self.manager)
            .await
            .map_err(|e| CacheError::OperationError(e.to_string()))?;

        if reply != "OK" {
            return Err(CacheError::OperationError("SET failed".to_string()));
        }

        Ok(())
    }

    /// Set a key with TTL only if absent. Returns true on a fresh set.
    pub async fn set_nx_ex(&mut self, key: &str, value: &[u8], ttl_s: u64) -> CacheResult<bool> {
        // SET .. NX replies OK on success and nil when the key exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_s)
            .query_async(&mut self.manager)
            .await
            .map_err(|e| CacheError::OperationError(e.to_string()))?;

        Ok(reply.is_some())
    }

    /// Get a key
    pub async fn get(&mut self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.manager)
            .await
            .map_err(|e| CacheError::OperationError(e.to_string()))
    }

    /// Delete a key. Returns true when a key was removed.
    pub async fn del(&mut self, key: &str) -> CacheResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.manager)
            .await
            .map_err(|e| CacheError::OperationError(e.to_string()))?;

        Ok(removed > 0)
    }

    /// Set key expiration
    pub async fn expire(&mut self, key: &str, ttl_s: u64) -> CacheResult<bool> {
        let set: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_s)
            .query_async(&mut self.manager)
            .await
            .map_err(|e| CacheError::OperationError(e.to_string()))?;

        Ok(set > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let config = RedisConfig::development();

        // Requires a local Redis; skipped silently when unavailable
        if let Ok(pool) = RedisPool::connect(config).await {
            let latency = pool.ping().await.unwrap();
            assert!(latency < Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_set_nx_semantics() {
        let config = RedisConfig::development();

        if let Ok(pool) = RedisPool::connect(config).await {
            let mut conn = pool.get().await.unwrap();
            let key = format!("conveyor:test:{}", uuid::Uuid::new_v4());

            assert!(conn.set_nx_ex(&key, b"a", 10).await.unwrap());
            // Second setter must lose
            assert!(!conn.set_nx_ex(&key, b"b", 10).await.unwrap());
            assert_eq!(conn.get(&key).await.unwrap(), Some(b"a".to_vec()));

            assert!(conn.del(&key).await.unwrap());
            assert_eq!(conn.get(&key).await.unwrap(), None);
        }
    }
}
