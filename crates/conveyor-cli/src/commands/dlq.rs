//! Dead-letter queue inspection and reprocessing

use chrono::{Duration, Utc};
use colored::Colorize;
use dialoguer::Confirm;
use prettytable::{row, Table};

use conveyor_core::jobs::{DlqFilter, DlqReason, DlqStore, JobStore, Pagination};
use conveyor_core::{create_pool, Config};

use crate::DlqCommands;

pub async fn run(config: Config, command: &DlqCommands) -> anyhow::Result<i32> {
    let pool = create_pool(&config.database).await?;
    let store = JobStore::new(pool.clone());
    let dlq = DlqStore::new(pool);

    match command {
        DlqCommands::List {
            reason,
            job_type,
            limit,
            offset,
        } => {
            let reason = reason.as_deref().map(parse_reason).transpose()?;
            let filter = DlqFilter {
                reason,
                job_type: job_type.clone(),
            };
            let page = Pagination {
                limit: *limit,
                offset: *offset,
            };

            let records = dlq.list(&filter, page).await?;
            if records.is_empty() {
                println!("No dead letters match");
                return Ok(0);
            }

            let mut table = Table::new();
            table.add_row(row!["ID", "JOB", "TYPE", "REASON", "ATTEMPTS", "FAILED AT", "ERROR"]);
            for record in records {
                table.add_row(row![
                    record.id,
                    record.job_id,
                    record.job_type,
                    record.reason,
                    record.total_attempts,
                    record.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&record.final_error, 48),
                ]);
            }
            table.printstd();
        }

        DlqCommands::Stats => {
            let by_reason = dlq.stats_by_reason().await?;
            let by_type = dlq.stats_by_type().await?;

            let mut table = Table::new();
            table.add_row(row!["REASON", "COUNT"]);
            for (reason, count) in by_reason {
                table.add_row(row![reason, count]);
            }
            table.printstd();

            let mut table = Table::new();
            table.add_row(row!["TYPE", "COUNT"]);
            for (job_type, count) in by_type {
                table.add_row(row![job_type, count]);
            }
            table.printstd();
        }

        DlqCommands::Reprocess { dlq_id, payload } => {
            let override_payload = payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {}", e))?;

            let new_job_id = dlq.reprocess(&store, *dlq_id, override_payload).await?;
            println!("{} {}", "Requeued as job".green(), new_job_id);
        }

        DlqCommands::Cleanup {
            older_than_days,
            yes,
        } => {
            let cutoff = Utc::now() - Duration::days(*older_than_days);

            if !yes {
                let prompt = format!(
                    "Delete all dead letters older than {} days ({})?",
                    older_than_days,
                    cutoff.format("%Y-%m-%d")
                );
                if !Confirm::new().with_prompt(prompt).default(false).interact()? {
                    println!("Aborted");
                    return Ok(0);
                }
            }

            let removed = dlq.cleanup(cutoff).await?;
            println!("{} {}", "Removed records:".yellow(), removed);
        }
    }

    Ok(0)
}

fn parse_reason(s: &str) -> anyhow::Result<DlqReason> {
    match s {
        "max_attempts_exceeded" => Ok(DlqReason::MaxAttemptsExceeded),
        "fatal_error" => Ok(DlqReason::FatalError),
        "timeout" => Ok(DlqReason::Timeout),
        "invalid_data" => Ok(DlqReason::InvalidData),
        "system_error" => Ok(DlqReason::SystemError),
        other => Err(anyhow::anyhow!("unknown reason '{}'", other)),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}
