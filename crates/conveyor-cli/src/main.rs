use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conveyor_core::{Config, JobPriority};

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor durable background job queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a worker process
    Worker {
        #[arg(long, help = "Skip automatic database migration on startup")]
        skip_migrate: bool,
    },

    /// Submit a job
    Submit {
        #[arg(short = 't', long, help = "Job type")]
        job_type: String,

        #[arg(short, long, help = "JSON payload", default_value = "{}")]
        payload: String,

        #[arg(long, help = "Priority class (low|normal|high|critical)", default_value = "normal")]
        priority: String,

        #[arg(long, help = "Attempt budget (1-10)", default_value_t = 3)]
        max_attempts: i32,

        #[arg(long, help = "Delay before the job becomes due, in milliseconds", default_value_t = 0)]
        delay_ms: u64,
    },

    /// Show queue totals and process counters
    Stats,

    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List archived jobs
    List {
        #[arg(long, help = "Filter by failure reason")]
        reason: Option<String>,

        #[arg(long, help = "Filter by job type")]
        job_type: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Show counts by reason and by type
    Stats,

    /// Requeue an archived job as a fresh pending job
    Reprocess {
        #[arg(help = "Dead letter record id")]
        dlq_id: uuid::Uuid,

        #[arg(long, help = "Replace the payload with this JSON")]
        payload: Option<String>,
    },

    /// Delete archived records older than the given number of days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,

        #[arg(long, help = "Skip the confirmation prompt")]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

async fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(&path.display().to_string()).await?,
        None => Config::from_env().await?,
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    Ok(config)
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub(crate) fn parse_priority(s: &str) -> anyhow::Result<JobPriority> {
    JobPriority::parse(s)
        .ok_or_else(|| anyhow::anyhow!("unknown priority '{}', expected low|normal|high|critical", s))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    let result = match cli.command {
        Commands::Worker { skip_migrate } => commands::worker::run(config, skip_migrate).await,
        Commands::Submit {
            ref job_type,
            ref payload,
            ref priority,
            max_attempts,
            delay_ms,
        } => commands::queue::submit(config, job_type, payload, priority, max_attempts, delay_ms).await,
        Commands::Stats => commands::queue::stats(config).await,
        Commands::Dlq { ref command } => commands::dlq::run(config, command).await,
        Commands::Db { command: DbCommands::Migrate } => commands::queue::migrate(config).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
