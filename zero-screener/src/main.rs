//! Zero Screener - one-shot surge screen for the Zero ecosystem.
//!
//! Loads the shared config, screens the configured market from the local
//! snapshot, records discoveries, and prints the report as JSON on stdout.
//! Logs go to stderr. An optional first argument sets the run date
//! (`YYYY-MM-DD`, default today).

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use zero_common::config::Config;
use zero_common::logging::init_logging_with_exclusions;
use zero_screener::{ScreenerConfig, ScreenerService};

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_and_validate().context("Failed to load configuration")?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Zero Screener v{}", env!("CARGO_PKG_VERSION"));

    let run_date = match std::env::args().nth(1) {
        Some(arg) => NaiveDate::parse_from_str(&arg, "%Y-%m-%d")
            .with_context(|| format!("Invalid run date: {}", arg))?,
        None => Local::now().date_naive(),
    };

    let screener_config = ScreenerConfig::from_config(&config)?;
    let service = ScreenerService::new(screener_config)?;

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        run_date = %run_date,
        "Service initialized in {:?}",
        startup_duration
    );

    let cancel = service.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let report = service.run_once(run_date).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
