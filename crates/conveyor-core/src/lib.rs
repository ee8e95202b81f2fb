pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;

// Re-export commonly used types
pub use cache::{CacheError, RedisConfig, RedisPool};
pub use config::{Config, DatabaseConfig, LoggingConfig, QueueConfig};
pub use db::{create_pool, migrate::Migrator};
pub use error::{Error, Result};
pub use jobs::{
    Batch, BatchLoader, CircuitBreaker, CircuitState, DeadLetter, DlqFilter, DlqReason, DlqStore,
    HandlerContext, HandlerOutcome, HandlerRegistry, Job, JobHandler, JobId, JobMetrics,
    JobPriority, JobQueue, JobStatus, JobStore, LockManager, QueueContext, QueueStats,
    RetryScheduler, SubmitOptions, Supervisor, WorkerPool,
};

/// Current version of conveyor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
