//! Submit, stats, and migration commands

use colored::Colorize;
use prettytable::{row, Table};
use std::sync::Arc;

use conveyor_core::jobs::{DlqStore, JobQueue, JobStore, SubmitOptions};
use conveyor_core::{create_pool, Config, Migrator};

use crate::parse_priority;

pub async fn submit(
    config: Config,
    job_type: &str,
    payload: &str,
    priority: &str,
    max_attempts: i32,
    delay_ms: u64,
) -> anyhow::Result<i32> {
    let priority = parse_priority(priority)?;
    let payload: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {}", e))?;

    let pool = create_pool(&config.database).await?;
    let queue = JobQueue::new(JobStore::new(pool), Arc::new(config.queue));

    let job_id = queue
        .submit(
            job_type,
            payload,
            SubmitOptions {
                priority,
                max_attempts,
                delay_ms,
            },
        )
        .await?;

    println!("{} {}", "Submitted job".green(), job_id);

    Ok(0)
}

pub async fn stats(config: Config) -> anyhow::Result<i32> {
    let pool = create_pool(&config.database).await?;
    let store = JobStore::new(pool.clone());
    let dlq = DlqStore::new(pool);

    let totals = store.stats().await?;
    let dead = dlq.count().await?;

    let mut table = Table::new();
    table.add_row(row!["STATUS", "COUNT"]);
    table.add_row(row!["pending", totals.pending]);
    table.add_row(row!["processing", totals.processing]);
    table.add_row(row!["completed", totals.completed]);
    table.add_row(row!["failed", totals.failed]);
    table.add_row(row!["dead letters", dead]);
    table.printstd();

    Ok(0)
}

pub async fn migrate(config: Config) -> anyhow::Result<i32> {
    let pool = create_pool(&config.database).await?;
    Migrator::new(pool).migrate().await?;
    println!("{}", "Migrations applied".green());

    Ok(0)
}
