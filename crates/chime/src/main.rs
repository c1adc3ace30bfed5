//! Chime: durable timer/job scheduling service.
//!
//! Main binary with subcommands:
//! - `service`: run the scheduling service (lease keeper, scheduler loop,
//!   window controller, HTTP callback delivery)

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chime_scheduler::SchedulerConfig;

mod callback;
mod daemon;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "chime")]
#[command(about = "Durable timer/job scheduling service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling service
    Service {
        /// Path to the SQLite database file. Omit for a non-durable
        /// in-memory store.
        #[arg(long, env = "CHIME_DB_PATH")]
        db_path: Option<PathBuf>,

        /// Identity of this service instance in the lease record.
        /// Generated when omitted.
        #[arg(long, env = "CHIME_INSTANCE_ID")]
        instance_id: Option<String>,

        /// Delay between retry attempts in milliseconds
        #[arg(long, default_value = "1000")]
        backoff_retry_millis: u64,

        /// Total retry window since a job's original due time in milliseconds
        #[arg(long, default_value = "60000")]
        max_interval_limit_to_retry_millis: u64,

        /// Width of the in-memory scheduling window in minutes
        #[arg(long, default_value = "10")]
        scheduler_chunk_in_minutes: u64,

        /// Execute jobs whose fire time already passed instead of
        /// rejecting them.
        #[arg(long, env = "CHIME_FORCE_EXECUTE_EXPIRED_JOBS", value_parser = parse_bool_env, default_value = "false")]
        force_execute_expired_jobs: bool,

        /// Lease heartbeat refresh period in milliseconds
        #[arg(long, default_value = "1000")]
        heartbeat_interval_millis: u64,

        /// Lease staleness threshold in milliseconds
        #[arg(long, default_value = "10000")]
        heartbeat_expiration_millis: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chime=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Service {
            db_path,
            instance_id,
            backoff_retry_millis,
            max_interval_limit_to_retry_millis,
            scheduler_chunk_in_minutes,
            force_execute_expired_jobs,
            heartbeat_interval_millis,
            heartbeat_expiration_millis,
        } => {
            let scheduler = SchedulerConfig {
                backoff_retry_millis,
                max_interval_limit_to_retry_millis,
                scheduler_chunk_in_minutes,
                force_execute_expired_jobs,
                heartbeat_interval_millis,
                heartbeat_expiration_millis,
                ..Default::default()
            };
            daemon::run_service(daemon::ServiceConfig {
                db_path,
                instance_id,
                scheduler,
            })
            .await
        }
    }
}
