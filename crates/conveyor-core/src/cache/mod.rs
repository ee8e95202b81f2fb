//! Redis batch cache layer
//!
//! This module wraps the Redis connection used for the two ephemeral
//! structures the queue keeps in memory-speed storage:
//! - pre-loaded job batches (`queue:<name>:batch:<batch_id>`)
//! - per-job worker locks (`queue:<name>:locks:<job_id>`)
//!
//! The cache is a best-effort accelerator. Every operation here can fail
//! without affecting correctness; the resilience supervisor opens a circuit
//! over it and the queue falls back to direct store polling.

pub mod config;
pub mod connection;

// Re-export main types
pub use config::RedisConfig;
pub use connection::{RedisConnection, RedisPool};

/// Cache result type alias
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Operation failed: {0}")]
    OperationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Timeout waiting for cache")]
    Timeout,
}

impl From<CacheError> for crate::Error {
    fn from(err: CacheError) -> Self {
        crate::Error::Cache(err.to_string())
    }
}

/// Key namespacing for one named queue
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    /// Create keys for a queue name
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            prefix: format!("queue:{}", queue_name.into()),
        }
    }

    /// Key holding a serialized batch
    pub fn batch(&self, batch_id: impl std::fmt::Display) -> String {
        format!("{}:batch:{}", self.prefix, batch_id)
    }

    /// Key holding a job lock claim
    pub fn lock(&self, job_id: impl std::fmt::Display) -> String {
        format!("{}:locks:{}", self.prefix, job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("default");
        assert_eq!(keys.batch("b1"), "queue:default:batch:b1");
        assert_eq!(keys.lock("j1"), "queue:default:locks:j1");
    }
}
