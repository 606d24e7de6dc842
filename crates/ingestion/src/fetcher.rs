//! Per-timestep download: the reanalysis day loop and the direct-feed
//! hour loop.
//!
//! Both paths share the same discipline: check for the destination file
//! before any network call (re-runs and resumed jobs only redo missing
//! work), normalize exactly once after decoding, and write one raw file
//! per (variable, timestep[, member]).

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use chunk_store::StoreWriter;
use tracing::info;

use crate::cds::{CdsRequest, ReanalysisApi, RetrieveOutcome};
use crate::decode::MessageDecode;
use crate::domain::{raw_forecast_path, raw_reanalysis_path, Domain, Grid};
use crate::elevation::{load_grid, reanalysis_dataset};
use crate::error::{IngestError, Result};
use crate::fetch::GridFetch;
use crate::normalize::{multiply_add, shift_longitude_180};
use crate::time::TimeRange;
use crate::variables::Variable;

/// Column chunking of raw per-timestep files.
const RAW_FILE_CHUNK: usize = 600;

/// The effective range actually obtained from the archive; a strict
/// sub-range of the request when upstream has not published the tail yet.
#[derive(Debug, Clone, Copy)]
pub struct DownloadedRange {
    requested: TimeRange,
    end: DateTime<Utc>,
}

impl DownloadedRange {
    pub fn new(requested: TimeRange) -> Self {
        Self {
            requested,
            end: requested.end(),
        }
    }

    /// Shrink the upper bound to `at`; only the fetcher calls this, on
    /// the distinguished "not yet available" condition.
    pub fn truncate(&mut self, at: DateTime<Utc>) {
        self.end = self.end.min(at);
    }

    pub fn is_truncated(&self) -> bool {
        self.end < self.requested.end()
    }

    /// What the caller should convert.
    pub fn effective(&self) -> TimeRange {
        self.requested.truncated_at(self.end)
    }
}

/// Write one normalized grid as a raw per-timestep file.
fn write_raw(path: &std::path::Path, variable: &Variable, data: &[f32]) -> Result<()> {
    StoreWriter::new(1, data.len(), 1, RAW_FILE_CHUNK.min(data.len())).write_all(
        path,
        variable.compression(),
        variable.scale_factor,
        data,
    )?;
    Ok(())
}

/// Day-loop fetcher for the reanalysis archive.
///
/// Fields are public so tests can assemble one over a toy grid.
pub struct ReanalysisFetcher<'a, A: ReanalysisApi, D: MessageDecode> {
    pub api: &'a A,
    pub decode: &'a D,
    pub dataset: String,
    pub variables: Vec<&'a Variable>,
    pub grid: Grid,
    pub download_dir: PathBuf,
}

impl<'a, A: ReanalysisApi, D: MessageDecode> ReanalysisFetcher<'a, A, D> {
    pub fn for_domain(
        api: &'a A,
        decode: &'a D,
        variables: Vec<&'a Variable>,
        data_dir: &std::path::Path,
    ) -> Self {
        let domain = Domain::Cerra;
        Self {
            api,
            decode,
            dataset: reanalysis_dataset().to_string(),
            variables,
            grid: domain.grid(),
            download_dir: domain.download_dir(data_dir),
        }
    }

    /// Download raw hourly files for every step of `range`, as far as
    /// the archive serves them. A daily range requests whole days (all
    /// analysis cycles plus the short leads covering the gaps); an
    /// hourly range requests single timestamps and resumes at hourly
    /// granularity. A step the archive reports as not yet valid
    /// truncates the effective range and ends the loop cleanly; any
    /// other failure aborts.
    pub async fn download_range(&self, range: &TimeRange) -> Result<DownloadedRange> {
        info!(range = %range.pretty(), "Downloading reanalysis range");
        std::fs::create_dir_all(&self.download_dir)?;
        let mut downloaded = DownloadedRange::new(*range);
        let daily = range.step_seconds() >= 86_400;

        'steps: for t in range.iter() {
            // resumable skip: the step's first output stands in for the
            // whole unit of work
            let marker = raw_reanalysis_path(&self.download_dir, self.variables[0].id, t);
            if marker.exists() {
                continue;
            }
            info!(timestep = %t.format("%Y-%m-%d %H:%MZ"), "Downloading timestep");

            // unique per run; concurrent invocations cannot collide
            let payload = tempfile::Builder::new()
                .prefix("retrieve-")
                .suffix(".grib")
                .tempfile_in(&self.download_dir)?;

            for (product_type, times, leadtime_hours) in products_for(t, daily) {
                let request = CdsRequest {
                    dataset: self.dataset.clone(),
                    product_type,
                    variables: self.variables.iter().map(|v| v.cds_name.to_string()).collect(),
                    date: t.date_naive(),
                    times,
                    leadtime_hours,
                };
                match self.api.retrieve(&request, payload.path()).await? {
                    RetrieveOutcome::Completed => {
                        self.convert_payload(payload.path(), t.date_naive())?;
                    }
                    RetrieveOutcome::NotAvailable => {
                        info!(
                            timestep = %t.format("%Y-%m-%d %H:%MZ"),
                            "Timestep not available upstream yet, stopping here"
                        );
                        downloaded.truncate(t);
                        break 'steps;
                    }
                }
            }
        }
        Ok(downloaded)
    }

    /// Decode one multi-message payload: messages arrive in request
    /// order, cycling through the variable list; the slot hour comes
    /// from the per-message validity attribute.
    fn convert_payload(&self, payload: &std::path::Path, date: chrono::NaiveDate) -> Result<()> {
        let midnight = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let mut index = 0usize;
        self.decode.iterate_file(payload, &mut |message| {
            let variable = self.variables[index % self.variables.len()];
            index += 1;

            let validity = message.attribute("validityTime").ok_or_else(|| {
                IngestError::Decode("message carries no validityTime".into())
            })?;
            let hour: u32 = validity
                .parse::<u32>()
                .map_err(|_| IngestError::Decode(format!("bad validityTime '{validity}'")))?
                / 100;

            let mut data = load_grid(message, self.grid.nx, self.grid.ny)?;
            let (offset, scale) = variable.unit_conversion(Domain::Cerra);
            multiply_add(&mut data, scale, offset);

            let t = midnight + Duration::hours(hour as i64);
            let path = raw_reanalysis_path(&self.download_dir, variable.id, t);
            write_raw(&path, variable, &data)
        })
    }
}

/// The product requests covering one range step. Whole days need the
/// full analysis cycle plus lead hours 1 and 2 to fill the hourly axis;
/// a single hour maps to either an analysis time or a short lead off
/// the previous cycle.
fn products_for(
    t: DateTime<Utc>,
    daily: bool,
) -> Vec<(&'static str, Vec<String>, Vec<u32>)> {
    use chrono::Timelike;
    if daily {
        return vec![
            ("analysis", CdsRequest::analysis_times(), Vec::new()),
            ("forecast", CdsRequest::analysis_times(), vec![1, 2]),
        ];
    }
    let hour = t.hour();
    let lead = hour % 3;
    let cycle = vec![format!("{:02}:00", hour - lead)];
    if lead == 0 {
        vec![("analysis", cycle, Vec::new())]
    } else {
        vec![("forecast", cycle, vec![lead])]
    }
}

/// Hour-loop fetcher for a direct forecast feed.
pub struct ForecastFetcher<'a, F: GridFetch, D: MessageDecode> {
    pub fetch: &'a F,
    pub decode: &'a D,
    pub domain: Domain,
    pub grid: Grid,
    pub variables: Vec<&'a Variable>,
    /// Published lead hours to fetch.
    pub hours: Vec<u32>,
    pub run: DateTime<Utc>,
    pub download_dir: PathBuf,
    pub skip_existing: bool,
}

impl<'a, F: GridFetch, D: MessageDecode> ForecastFetcher<'a, F, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn for_domain(
        fetch: &'a F,
        decode: &'a D,
        domain: Domain,
        variables: Vec<&'a Variable>,
        run: DateTime<Utc>,
        data_dir: &std::path::Path,
        skip_existing: bool,
    ) -> Self {
        Self {
            fetch,
            decode,
            domain,
            grid: domain.grid(),
            variables,
            hours: domain.forecast_hours(),
            run,
            download_dir: domain.download_dir(data_dir),
            skip_existing,
        }
    }

    /// Download every (hour, variable) grid the domain publishes for
    /// this run. Ensemble feeds carry all members in one response; the
    /// member index comes from the per-message perturbation attribute,
    /// its absence meaning the control member.
    pub async fn download_run(&self) -> Result<()> {
        info!(
            domain = self.domain.id(),
            run = %self.run.format("%Y-%m-%d %HZ"),
            "Downloading run"
        );
        std::fs::create_dir_all(&self.download_dir)?;

        for &hour in &self.hours {
            info!(hour, "Downloading hour");
            for variable in &self.variables {
                let Some(grib_name) = variable.grib_name(self.domain) else {
                    continue;
                };
                if hour == 0 && variable.skip_hour0 {
                    continue;
                }
                if !variable.included_for(hour, self.domain) {
                    continue;
                }
                let control = raw_forecast_path(&self.download_dir, variable.id, hour, 0);
                if self.skip_existing && control.exists() {
                    continue;
                }

                let url = self.domain.grib_url(self.run, hour, grib_name);
                let body = self.fetch.fetch(&url).await?;
                self.decode.iterate_bytes(body, &mut |message| {
                    let member = member_of(message.attribute("perturbationNumber"));
                    let mut data = load_grid(message, self.grid.nx, self.grid.ny)?;
                    if self.domain.is_longitude_shifted() {
                        shift_longitude_180(&mut data, self.grid.nx);
                    }
                    let (offset, scale) = variable.unit_conversion(self.domain);
                    multiply_add(&mut data, scale, offset);

                    let path =
                        raw_forecast_path(&self.download_dir, variable.id, hour, member);
                    write_raw(&path, variable, &data)
                })?;
            }
        }
        Ok(())
    }
}

/// Member 0 is the control; deterministic feeds never set the attribute.
fn member_of(perturbation_number: Option<String>) -> usize {
    perturbation_number
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::{FakeDecode, FakeMessage};
    use crate::fetch::testing::FakeFetch;
    use crate::variables::VariableRegistry;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{NaiveDate, TimeZone};
    use chunk_store::StoreReader;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Completes every day before `unavailable_from`, reports the rest
    /// as not yet published. Payload contents are the decode fake's key.
    struct FakeApi {
        unavailable_from: Option<NaiveDate>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl ReanalysisApi for FakeApi {
        async fn retrieve(
            &self,
            request: &CdsRequest,
            dest: &std::path::Path,
        ) -> Result<RetrieveOutcome> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Some(cutoff) = self.unavailable_from {
                if request.date >= cutoff {
                    return Ok(RetrieveOutcome::NotAvailable);
                }
            }
            std::fs::write(dest, format!("{}-{}", request.product_type, request.date))?;
            Ok(RetrieveOutcome::Completed)
        }
    }

    /// Fake analysis/forecast payloads: variables cycling fastest, the
    /// validity hour carried per message.
    fn payload_messages(
        variables: &[&Variable],
        hours: &[u32],
        nx: usize,
        ny: usize,
        value: f32,
    ) -> Vec<FakeMessage> {
        let mut messages = Vec::new();
        for &hour in hours {
            for _ in variables {
                messages.push(
                    FakeMessage::filled(nx, ny, value)
                        .with_attribute("validityTime", hour * 100),
                );
            }
        }
        messages
    }

    fn reanalysis_fetcher<'a>(
        api: &'a FakeApi,
        decode: &'a FakeDecode,
        variables: Vec<&'a Variable>,
        dir: &std::path::Path,
    ) -> ReanalysisFetcher<'a, FakeApi, FakeDecode> {
        ReanalysisFetcher {
            api,
            decode,
            dataset: reanalysis_dataset().to_string(),
            variables,
            grid: Grid::new(3, 2, 0.0, 0.0, 1.0, 1.0),
            download_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn truncates_at_first_unavailable_day() {
        let registry = VariableRegistry::load().unwrap();
        let variables = vec![
            registry.get("temperature_2m").unwrap(),
            registry.get("pressure_msl").unwrap(),
        ];
        let dir = tempfile::tempdir().unwrap();

        let api = FakeApi {
            unavailable_from: Some(NaiveDate::from_ymd_opt(2022, 1, 6).unwrap()),
            calls: AtomicU64::new(0),
        };
        let mut decode = FakeDecode::default();
        for day in 1..=5u32 {
            for product in ["analysis", "forecast"] {
                let hours: &[u32] = if product == "analysis" {
                    &[0, 3, 6, 9, 12, 15, 18, 21]
                } else {
                    &[1, 2, 4, 5]
                };
                decode.by_key.insert(
                    format!("{product}-2022-01-{day:02}"),
                    payload_messages(&variables, hours, 3, 2, day as f32),
                );
            }
        }

        let fetcher = reanalysis_fetcher(&api, &decode, variables, dir.path());
        let days = TimeRange::parse_interval("20220101-20220110", 86_400).unwrap();
        let downloaded = fetcher.download_range(&days).await.unwrap();

        // upper bound is day 6's start; days 1..=5 went through cleanly
        assert!(downloaded.is_truncated());
        assert_eq!(
            downloaded.effective().end(),
            Utc.with_ymd_and_hms(2022, 1, 6, 0, 0, 0).unwrap()
        );
        assert_eq!(downloaded.effective().count(), 5);

        let jan3_09 = Utc.with_ymd_and_hms(2022, 1, 3, 9, 0, 0).unwrap();
        let path = raw_reanalysis_path(dir.path(), "temperature_2m", jan3_09);
        let reader = StoreReader::open(&path).unwrap();
        // raw 3.0 through the Kelvin conversion
        let values = reader.read_all().unwrap();
        assert!((values[0] - (3.0 - 273.15)).abs() < 0.05);
    }

    #[tokio::test]
    async fn resumed_run_performs_zero_api_calls() {
        let registry = VariableRegistry::load().unwrap();
        let variables = vec![registry.get("temperature_2m").unwrap()];
        let dir = tempfile::tempdir().unwrap();

        let days = TimeRange::parse_interval("20220101-20220103", 86_400).unwrap();
        for day in days.iter() {
            let marker = raw_reanalysis_path(dir.path(), "temperature_2m", day);
            std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
            std::fs::write(&marker, b"done").unwrap();
        }

        let api = FakeApi {
            unavailable_from: None,
            calls: AtomicU64::new(0),
        };
        let decode = FakeDecode::default();
        let fetcher = reanalysis_fetcher(&api, &decode, variables, dir.path());
        let downloaded = fetcher.download_range(&days).await.unwrap();

        assert_eq!(api.calls.load(Ordering::Relaxed), 0);
        assert!(!downloaded.is_truncated());
        assert_eq!(downloaded.effective().count(), 3);
    }

    #[tokio::test]
    async fn forecast_skip_existing_avoids_all_network_calls() {
        let registry = VariableRegistry::load().unwrap();
        let variables = vec![registry.get("temperature_2m").unwrap()];
        let dir = tempfile::tempdir().unwrap();
        let run = Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap();

        for hour in [0u32, 3, 6] {
            let dest = raw_forecast_path(dir.path(), "temperature_2m", hour, 0);
            std::fs::write(&dest, b"done").unwrap();
        }

        let fetch = FakeFetch::default();
        let decode = FakeDecode::default();
        let fetcher = ForecastFetcher {
            fetch: &fetch,
            decode: &decode,
            domain: Domain::GemGlobal,
            grid: Grid::new(4, 2, 0.0, 0.0, 1.0, 1.0),
            variables,
            hours: vec![0, 3, 6],
            run,
            download_dir: dir.path().to_path_buf(),
            skip_existing: true,
        };
        fetcher.download_run().await.unwrap();
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn ensemble_members_split_into_separate_raw_files() {
        let registry = VariableRegistry::load().unwrap();
        let variables = vec![registry.get("temperature_2m").unwrap()];
        let dir = tempfile::tempdir().unwrap();
        let run = Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap();
        let domain = Domain::GemEnsemble;
        let (nx, ny) = (4, 2);

        let grib_name = variables[0].grib_name(domain).unwrap();
        let url = domain.grib_url(run, 3, grib_name);
        let mut fetch = FakeFetch::default();
        fetch.by_url.insert(url, Bytes::from("t2m-members"));

        let mut decode = FakeDecode::default();
        decode.by_key.insert(
            "t2m-members".to_string(),
            vec![
                // control member carries no perturbation attribute
                FakeMessage::filled(nx, ny, 280.15),
                FakeMessage::filled(nx, ny, 281.15).with_attribute("perturbationNumber", 1),
                FakeMessage::filled(nx, ny, 282.15).with_attribute("perturbationNumber", 2),
            ],
        );

        let fetcher = ForecastFetcher {
            fetch: &fetch,
            decode: &decode,
            domain,
            grid: Grid::new(nx, ny, 0.0, 0.0, 1.0, 1.0),
            variables,
            hours: vec![3],
            run,
            download_dir: dir.path().to_path_buf(),
            skip_existing: false,
        };
        fetcher.download_run().await.unwrap();

        for (member, kelvin) in [(0usize, 280.15f32), (1, 281.15), (2, 282.15)] {
            let path = raw_forecast_path(dir.path(), "temperature_2m", 3, member);
            let values = StoreReader::open(&path).unwrap().read_all().unwrap();
            assert!(
                (values[0] - (kelvin - 273.15)).abs() < 0.05,
                "member {member}: {}",
                values[0]
            );
        }
    }

    #[tokio::test]
    async fn wrong_grid_dimensions_are_fatal() {
        let registry = VariableRegistry::load().unwrap();
        let variables = vec![registry.get("temperature_2m").unwrap()];
        let dir = tempfile::tempdir().unwrap();
        let run = Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap();
        let domain = Domain::GemGlobal;

        let grib_name = variables[0].grib_name(domain).unwrap();
        let url = domain.grib_url(run, 0, grib_name);
        let mut fetch = FakeFetch::default();
        fetch.by_url.insert(url, Bytes::from("t2m"));
        let mut decode = FakeDecode::default();
        decode
            .by_key
            .insert("t2m".to_string(), vec![FakeMessage::filled(7, 7, 280.0)]);

        let fetcher = ForecastFetcher {
            fetch: &fetch,
            decode: &decode,
            domain,
            grid: Grid::new(4, 2, 0.0, 0.0, 1.0, 1.0),
            variables,
            hours: vec![0],
            run,
            download_dir: dir.path().to_path_buf(),
            skip_existing: false,
        };
        assert!(matches!(
            fetcher.download_run().await,
            Err(IngestError::MalformedGrid { .. })
        ));
    }

    #[test]
    fn hourly_granularity_maps_to_cycle_and_lead() {
        let t = Utc.with_ymd_and_hms(2022, 1, 1, 14, 0, 0).unwrap();
        let products = products_for(t, false);
        assert_eq!(products.len(), 1);
        let (product, times, leads) = &products[0];
        assert_eq!(*product, "forecast");
        assert_eq!(times, &vec!["12:00".to_string()]);
        assert_eq!(leads, &vec![2]);

        let t = Utc.with_ymd_and_hms(2022, 1, 1, 9, 0, 0).unwrap();
        let (product, times, leads) = &products_for(t, false)[0];
        assert_eq!(*product, "analysis");
        assert_eq!(times, &vec!["09:00".to_string()]);
        assert!(leads.is_empty());
    }

    #[test]
    fn member_detection_defaults_to_control() {
        assert_eq!(member_of(None), 0);
        assert_eq!(member_of(Some("4".into())), 4);
        assert_eq!(member_of(Some("garbage".into())), 0);
    }
}
