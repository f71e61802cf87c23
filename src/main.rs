mod config;
mod deals;
mod enrich;
mod error;
mod models;
mod pipeline;
mod scheduler;
mod scrapers;
mod session;
mod store;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::models::RunStatus;
use crate::scheduler::Scheduler;

/// Foreclosure case pipeline for the county court roster.
#[derive(Parser, Debug)]
#[command(name = "foreclosure-scout", version, about)]
struct Cli {
    /// Run a single pipeline pass and exit.
    #[arg(long)]
    once: bool,

    /// Export format for run artifacts.
    #[arg(long, value_parser = ["csv", "xlsx", "json"])]
    format: Option<String>,

    /// Override the schedule interval, in days.
    #[arg(long)]
    interval: Option<u64>,

    /// Wait for the first interval instead of running at startup.
    #[arg(long)]
    no_immediate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(days) = cli.interval {
        config.schedule_interval_days = days;
    }
    if let Some(format) = cli.format {
        config.storage.export_format = format;
    }

    info!("🏚️  Foreclosure Scout");
    info!("=====================");
    info!(portal = %config.county.base_url, "roster source");
    info!(
        zips = config.enrich.target_zip_codes.len(),
        format = %config.storage.export_format,
        "targeting"
    );

    let scheduler = Scheduler::new(config)?;

    if cli.once {
        let run = scheduler.run_once().await?;
        println!(
            "Run finished: {} seen, {} new, {} updated, {} anomalies",
            run.records_seen, run.records_new, run.records_updated, run.anomalies
        );
        if run.status == RunStatus::Failed {
            anyhow::bail!("pipeline run failed; see log for the failing stage");
        }
    } else {
        scheduler.run_forever(!cli.no_immediate).await?;
    }

    Ok(())
}
