//! Weather model archiver.
//!
//! One invocation runs one pipeline pass: resolve the static elevation
//! field, download the raw per-timestep grids the upstream currently
//! serves, then reassemble them into the time-oriented store. Every
//! unit of work checks for its output first, so an aborted run is simply
//! re-invoked.

mod forecast;
mod reanalysis;
mod strip_sea;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "archiver")]
#[command(about = "Download weather model output and maintain the time-series archive")]
struct Args {
    /// Root directory for downloads, stores and archives
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the reanalysis archive and convert it
    Reanalysis(reanalysis::ReanalysisArgs),
    /// Download one forecast model run and convert it
    Forecast(forecast::ForecastArgs),
    /// Rewrite yearly archives with sea and polar locations blanked
    StripSea(strip_sea::StripSeaArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Reanalysis(cmd) => reanalysis::run(cmd, &args.data_dir).await?,
        Command::Forecast(cmd) => forecast::run(cmd, &args.data_dir).await?,
        Command::StripSea(cmd) => strip_sea::run(cmd, &args.data_dir)?,
    }
    Ok(())
}
