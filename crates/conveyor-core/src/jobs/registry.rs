//! Handler contract and type registry
//!
//! The set of job types is open: handlers are registered under a type name
//! at worker startup and looked up per job. Unknown types fail fast to the
//! dead-letter queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Per-invocation context passed to handlers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Attempt number, 1-indexed
    pub attempt: i32,

    /// Attempt budget
    pub max_attempts: i32,

    /// When the job was created
    pub queued_at: DateTime<Utc>,

    /// When this attempt started
    pub processing_at: DateTime<Utc>,
}

impl HandlerContext {
    /// Check if this is the final attempt in the budget
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome returned by a handler. Failures travel as data, never as
/// process-terminating panics; the worker translates panics to this form
/// before touching the state machine.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,

    /// A fatal failure skips remaining attempts and goes straight to the
    /// dead-letter queue
    pub fatal: bool,

    pub processing_time_ms: u64,
}

impl HandlerOutcome {
    /// Successful outcome with optional result data
    pub fn success(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            fatal: false,
            processing_time_ms: 0,
        }
    }

    /// Retryable failure
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            fatal: false,
            processing_time_ms: 0,
        }
    }

    /// Non-retryable failure
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            fatal: true,
            processing_time_ms: 0,
        }
    }

    /// Attach the measured processing time
    pub fn with_timing(mut self, processing_time_ms: u64) -> Self {
        self.processing_time_ms = processing_time_ms;
        self
    }
}

/// A job handler. Implementations must be re-entrant across retries and
/// tolerate at-least-once execution.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &Value, job_id: Uuid, ctx: HandlerContext) -> HandlerOutcome;
}

/// Type name → handler mapping, populated at startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a type name, replacing any previous one
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Resolve the handler for a type
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|entry| entry.value().clone())
    }

    /// Check whether a type is registered
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered type names
    pub fn types(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(
            &self,
            payload: &Value,
            _job_id: Uuid,
            _ctx: HandlerContext,
        ) -> HandlerOutcome {
            HandlerOutcome::success(Some(payload.clone()))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register("echo", Arc::new(EchoHandler));
        assert!(registry.contains("echo"));
        assert!(!registry.contains("unknown"));
        assert!(registry.get("echo").is_some());
        assert_eq!(registry.types(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));

        let handler = registry.get("echo").unwrap();
        let payload = serde_json::json!({"user": "u1"});
        let ctx = HandlerContext {
            attempt: 1,
            max_attempts: 3,
            queued_at: Utc::now(),
            processing_at: Utc::now(),
        };

        let outcome = handler.handle(&payload, Uuid::new_v4(), ctx).await;
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(payload));
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = HandlerOutcome::success(None).with_timing(12);
        assert!(ok.success);
        assert_eq!(ok.processing_time_ms, 12);

        let err = HandlerOutcome::failure("tmp");
        assert!(!err.success);
        assert!(!err.fatal);

        let fatal = HandlerOutcome::fatal("bad");
        assert!(fatal.fatal);
    }

    #[test]
    fn test_last_attempt() {
        let ctx = HandlerContext {
            attempt: 3,
            max_attempts: 3,
            queued_at: Utc::now(),
            processing_at: Utc::now(),
        };
        assert!(ctx.is_last_attempt());
    }
}
