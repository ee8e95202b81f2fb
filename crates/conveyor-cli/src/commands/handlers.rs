//! Built-in demonstration handlers
//!
//! Real deployments embed `conveyor_core::WorkerPool` and register their
//! own handlers; the standalone worker binary ships these two so a fresh
//! install can be exercised end to end.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use conveyor_core::{HandlerContext, HandlerOutcome, HandlerRegistry, JobHandler};

/// Returns its payload as the job result
struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, payload: &Value, _job_id: Uuid, _ctx: HandlerContext) -> HandlerOutcome {
        HandlerOutcome::success(Some(payload.clone()))
    }
}

/// Sleeps for `{"ms": n}` milliseconds, useful for exercising concurrency
/// bounds and lock timeouts
struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn handle(&self, payload: &Value, _job_id: Uuid, _ctx: HandlerContext) -> HandlerOutcome {
        let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        HandlerOutcome::success(Some(serde_json::json!({ "slept_ms": ms })))
    }
}

/// Register the built-in handlers
pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("sleep", Arc::new(SleepHandler));
}
