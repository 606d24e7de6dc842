//! The forecast command: download one model run from the direct feed
//! and merge it into the time-oriented store.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use chunk_store::StoreSplitter;
use clap::Args;
use tracing::info;

use ingestion::assembler::{convert_variable, AssemblePlan, RawSource};
use ingestion::decode::EccodesDecode;
use ingestion::domain::{raw_forecast_path, Domain};
use ingestion::elevation::ElevationResolver;
use ingestion::fetcher::ForecastFetcher;
use ingestion::{Deadline, HttpFetcher, IngestError, TimeRange, Variable, VariableRegistry};

#[derive(Args, Debug)]
pub struct ForecastArgs {
    /// Domain to download: gem_global, gem_regional, gem_hrdps or
    /// gem_ensemble
    domain: String,

    /// Run to process, YYYYMMDDHH; latest published when omitted
    #[arg(long)]
    run: Option<String>,

    /// Leave already-downloaded raw files alone
    #[arg(long)]
    skip_existing: bool,

    /// Restrict to a comma-separated variable list
    #[arg(long)]
    only_variables: Option<String>,
}

pub async fn run(args: ForecastArgs, data_dir: &Path) -> Result<()> {
    let registry = VariableRegistry::load()?;
    let domain: Domain = args.domain.parse()?;
    if domain == Domain::Cerra {
        bail!("the reanalysis domain is served by the `reanalysis` command");
    }

    let run = match &args.run {
        Some(s) => parse_run(s)?,
        None => domain.last_run(Utc::now()),
    };
    let variables = match &args.only_variables {
        Some(list) => registry.parse_list(list)?,
        None => registry.for_domain(domain),
    };
    info!(domain = domain.id(), run = %run.format("%Y-%m-%d %HZ"), "Downloading domain run");

    let deadline = Deadline::hours(domain.deadline_hours());
    let http = HttpFetcher::new(deadline)?;
    let decode = EccodesDecode;

    ElevationResolver::new(&decode)
        .resolve_forecast(&http, domain, run, data_dir)
        .await?;

    ForecastFetcher::for_domain(
        &http,
        &decode,
        domain,
        variables.clone(),
        run,
        data_dir,
        args.skip_existing,
    )
    .download_run()
    .await?;
    http.print_statistics();

    convert_run(&variables, domain, run, data_dir)
}

/// Merge one run into the store: all members, full lead range, with
/// interpolation over the coarse tail and de-accumulation where the
/// variable calls for it.
fn convert_run(
    variables: &[&Variable],
    domain: Domain,
    run: DateTime<Utc>,
    data_dir: &Path,
) -> Result<()> {
    let grid = domain.grid();
    let members = domain.ensemble_members();
    let dt = domain.dt_seconds();
    let dt_hours = domain.dt_hours() as u32;
    let hours = domain.forecast_hours();
    let n_time = (*hours.last().unwrap() / dt_hours + 1) as usize;
    let time = TimeRange::new(run, run + Duration::seconds(n_time as i64 * dt), dt);
    let download_dir = domain.download_dir(data_dir);

    let splitter = StoreSplitter::new(
        domain.store_dir(data_dir),
        grid.count() * members,
        domain.n_time_per_file(),
        Some(chunk_for(members, n_time)),
    );

    for &variable in variables {
        if variable.grib_name(domain).is_none() {
            continue;
        }
        // hours a raw file is expected for; hour 0 is dropped for
        // variables the model does not define there
        let expected_hours: Vec<u32> = hours
            .iter()
            .copied()
            .filter(|&h| !(h == 0 && variable.skip_hour0))
            .filter(|&h| variable.included_for(h, domain))
            .collect();
        // natively published slots; interpolation only fills the slots
        // outside this set, so a merely absent file stays missing
        let native_steps: Vec<usize> = hours
            .iter()
            .copied()
            .filter(|&h| variable.included_for(h, domain))
            .map(|h| (h / dt_hours) as usize)
            .collect();
        let dir: &Path = &download_dir;
        let sources = expected_hours
            .iter()
            .flat_map(|&h| {
                (0..members).map(move |member| RawSource {
                    t: (h / dt_hours) as usize,
                    member,
                    path: raw_forecast_path(dir, variable.id, h, member),
                })
            })
            .collect();
        let plan = AssemblePlan {
            variable,
            time,
            n_locations: grid.count(),
            n_members: members,
            sources,
            native_steps,
            deaccumulate: variable.accumulated,
            skip_first: usize::from(variable.skip_hour0),
        };
        convert_variable(&plan, &splitter)
            .with_context(|| format!("converting {}", variable.id))?;
    }
    Ok(())
}

/// Flattened (location x member) rows per producer call, sized to keep
/// one block at a few megabytes and aligned to the member interleave.
fn chunk_for(members: usize, n_time: usize) -> usize {
    let budget_values = 4 * 1024 * 1024;
    let locations = (budget_values / (n_time.max(1) * members)).max(1);
    locations * members
}

fn parse_run(s: &str) -> Result<DateTime<Utc>> {
    if s.len() == 10 {
        if let Ok(t) = NaiveDateTime::parse_from_str(&format!("{s}00"), "%Y%m%d%H%M") {
            return Ok(t.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y%m%d") {
        return Ok(d.and_hms_opt(0, 0, 0).unwrap().and_utc());
    }
    Err(IngestError::InvalidTimeInterval(s.to_string()).into())
}
