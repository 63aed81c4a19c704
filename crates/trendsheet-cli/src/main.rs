use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trendsheet_sync::IngestConfig;

#[derive(Debug, Parser)]
#[command(name = "trendsheet-cli")]
#[command(about = "Trend sheet ingest: hourly sheet snapshots into CSV and SQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the hourly scheduler until interrupted.
    Run,
    /// Run a single ingest cycle and print its report as JSON.
    Once,
    /// Create the stock_data table if it does not exist.
    Migrate,
    /// Summarize recent snapshots as markdown.
    Report {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn setup_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .compact()
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logger();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => match trendsheet_sync::run_forever_from_env().await? {},
        Commands::Once => {
            let report = trendsheet_sync::run_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            trendsheet_storage::ensure_schema(&config.store, config.store_timeout)
                .await
                .context("creating stock_data table")?;
            info!(table = trendsheet_storage::STOCK_DATA_TABLE, "schema ready");
        }
        Commands::Report { dir, runs } => {
            let dir = dir.unwrap_or_else(|| IngestConfig::from_env().snapshot_dir);
            println!("{}", trendsheet_sync::report_snapshots_markdown(&dir, runs)?);
        }
    }

    Ok(())
}
