use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pickly_scheduler::{ScheduleOptions, DEFAULT_SCHEDULE, SCHEDULE_HELP};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pickly")]
#[command(about = "Pickly housing announcement fetcher and scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch LH announcements once and print the JSON outcome.
    Fetch,
    /// Serve the fetch trigger over HTTP.
    Serve,
    /// Run collect and transform on a cron schedule.
    #[command(after_help = SCHEDULE_HELP)]
    Schedule {
        /// Log what would run without spawning anything.
        #[arg(long)]
        dry_run: bool,
        /// Run the job once immediately and exit.
        #[arg(long)]
        now: bool,
        /// Cron expression (5 fields, or 6 with leading seconds).
        #[arg(long, default_value = DEFAULT_SCHEDULE)]
        schedule: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn fetch() -> Result<ExitCode> {
    let pipeline = pickly_sync::pipeline_from_env()?;
    let outcome = pipeline.invoke().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("encoding fetch outcome")?
    );
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn schedule(options: ScheduleOptions) -> ExitCode {
    match pickly_scheduler::run_from_env(options).await {
        Ok(exit) => ExitCode::from(exit.exit_code()),
        Err(err) => {
            eprintln!("FATAL: {err}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Fetch) {
        Commands::Fetch => fetch().await,
        Commands::Serve => {
            pickly_web::serve_from_env().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule {
            dry_run,
            now,
            schedule: expr,
        } => Ok(schedule(ScheduleOptions {
            schedule: expr,
            dry_run,
            now,
        })
        .await),
    }
}
