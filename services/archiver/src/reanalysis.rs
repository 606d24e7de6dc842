//! The reanalysis command: CDS download, hourly conversion, and the
//! yearly archive mode.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use chunk_store::StoreSplitter;
use clap::Args;
use tracing::info;

use ingestion::assembler::{assemble_long_file, convert_variable, AssemblePlan, RawSource};
use ingestion::decode::EccodesDecode;
use ingestion::domain::{raw_reanalysis_path, Domain};
use ingestion::elevation::ElevationResolver;
use ingestion::fetch::Deadline;
use ingestion::fetcher::ReanalysisFetcher;
use ingestion::{CdsClient, IngestError, TimeRange, Variable, VariableRegistry};

/// Location rows per producer call when assembling yearly files.
const YEARLY_CHUNK_LOCATIONS: usize = 600;

/// Typical publication delay is a few days; two weeks of lookback means
/// a daily cron job converges on its own.
const DEFAULT_LOOKBACK_DAYS: i64 = 14;

#[derive(Args, Debug)]
pub struct ReanalysisArgs {
    /// Time interval to download, e.g. 20220101-20220131
    #[arg(long, short = 't')]
    timeinterval: Option<String>,

    /// Download and archive one full year
    #[arg(long, short = 'y')]
    year: Option<i32>,

    /// CDS credential, UID:KEY
    #[arg(long, short = 'k', env = "CDS_API_KEY")]
    cdskey: Option<String>,

    /// Resume at hourly instead of daily granularity
    #[arg(long)]
    hourlyfiles: bool,

    /// Convert the requested interval even when nothing new downloaded
    #[arg(long, short = 'f')]
    force: bool,
}

pub async fn run(args: ReanalysisArgs, data_dir: &Path) -> Result<()> {
    let registry = VariableRegistry::load()?;
    let domain = Domain::Cerra;
    let variables = registry.for_domain(domain);

    let cdskey = args
        .cdskey
        .ok_or(IngestError::MissingCredential("CDS_API_KEY"))?;
    let deadline = Deadline::hours(domain.deadline_hours());
    let client = CdsClient::new(cdskey, deadline)?;
    let decode = EccodesDecode;

    ElevationResolver::new(&decode)
        .resolve_reanalysis(&client, domain, data_dir)
        .await?;

    let fetcher =
        ReanalysisFetcher::for_domain(&client, &decode, variables.clone(), data_dir);

    if let Some(year) = args.year {
        let days = TimeRange::year(year, 86_400);
        fetcher.download_range(&days).await?;
        return assemble_year(&variables, domain, year, data_dir);
    }

    let step = if args.hourlyfiles { 3_600 } else { 86_400 };
    let requested = match &args.timeinterval {
        Some(interval) => TimeRange::parse_interval(interval, step)?,
        None => TimeRange::last_days(DEFAULT_LOOKBACK_DAYS, step, Utc::now()),
    };

    let downloaded = fetcher.download_range(&requested).await?;
    let effective = if args.force {
        requested
    } else {
        downloaded.effective()
    };
    if effective.is_empty() {
        info!("No new timesteps could be downloaded, nothing to do");
        return Ok(());
    }
    convert_range(&variables, domain, &effective, data_dir)
}

/// Merge the effective range into the time-oriented store, hourly.
fn convert_range(
    variables: &[&Variable],
    domain: Domain,
    effective: &TimeRange,
    data_dir: &Path,
) -> Result<()> {
    let hours = effective.with_step(3_600);
    info!(range = %hours.pretty(), "Converting timerange");
    let grid = domain.grid();
    let download_dir = domain.download_dir(data_dir);
    let splitter = StoreSplitter::new(
        domain.store_dir(data_dir),
        grid.count(),
        domain.n_time_per_file(),
        None,
    );

    for &variable in variables {
        let sources = hours
            .iter()
            .enumerate()
            .map(|(t, timestamp)| RawSource {
                t,
                member: 0,
                path: raw_reanalysis_path(&download_dir, variable.id, timestamp),
            })
            .collect();
        let plan = AssemblePlan {
            variable,
            time: hours,
            n_locations: grid.count(),
            n_members: 1,
            sources,
            // the hourly axis is natively covered; nothing to interpolate
            native_steps: (0..hours.count()).collect(),
            deaccumulate: false,
            skip_first: 0,
        };
        convert_variable(&plan, &splitter)
            .with_context(|| format!("converting {}", variable.id))?;
    }
    Ok(())
}

/// Assemble one long file per variable covering a whole year.
fn assemble_year(
    variables: &[&Variable],
    domain: Domain,
    year: i32,
    data_dir: &Path,
) -> Result<()> {
    let hours = TimeRange::year(year, 3_600);
    let grid = domain.grid();
    let download_dir = domain.download_dir(data_dir);
    let yearly_dir = domain.yearly_dir(data_dir);

    for &variable in variables {
        info!(variable = variable.id, year, "Assembling yearly archive");
        let sources = hours
            .iter()
            .enumerate()
            .map(|(t, timestamp)| RawSource {
                t,
                member: 0,
                path: raw_reanalysis_path(&download_dir, variable.id, timestamp),
            })
            .collect();
        let plan = AssemblePlan {
            variable,
            time: hours,
            n_locations: grid.count(),
            n_members: 1,
            sources,
            native_steps: (0..hours.count()).collect(),
            deaccumulate: false,
            skip_first: 0,
        };
        let out = yearly_dir.join(format!("{}_{year}.cst", variable.id));
        assemble_long_file(&plan, &out, YEARLY_CHUNK_LOCATIONS)
            .with_context(|| format!("assembling {}", variable.id))?;
    }
    Ok(())
}
