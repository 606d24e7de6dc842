//! Model domains: grid geometry, publication schedule, URL layout and
//! on-disk locations of raw and assembled files.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::error::IngestError;

/// Regular lat/lon projection descriptor for one domain.
///
/// `coordinates` is the implicit mapping from a flattened location index
/// to geographic position; row-major, longitude fastest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub nx: usize,
    pub ny: usize,
    pub lat_min: f32,
    pub lon_min: f32,
    pub dlat: f32,
    pub dlon: f32,
}

impl Grid {
    pub const fn new(nx: usize, ny: usize, lat_min: f32, lon_min: f32, dlat: f32, dlon: f32) -> Self {
        Self {
            nx,
            ny,
            lat_min,
            lon_min,
            dlat,
            dlon,
        }
    }

    /// Total number of locations.
    pub fn count(&self) -> usize {
        self.nx * self.ny
    }

    /// (latitude, longitude) of a flattened location index.
    pub fn coordinates(&self, gridpoint: usize) -> (f32, f32) {
        let y = gridpoint / self.nx;
        let x = gridpoint % self.nx;
        (
            self.lat_min + y as f32 * self.dlat,
            self.lon_min + x as f32 * self.dlon,
        )
    }
}

/// The supported model domains.
///
/// `Cerra` is fed through the reanalysis API; the GEM family is fetched
/// directly from the public feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Copernicus European regional reanalysis.
    Cerra,
    /// GEM global deterministic, 15 km.
    GemGlobal,
    /// GEM regional deterministic, 10 km.
    GemRegional,
    /// HRDPS continental, 2.5 km. Serves no terrain field.
    GemHrdps,
    /// GEM global ensemble, 0.5 deg, 21 members, grid shifted by 180 deg.
    GemEnsemble,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Cerra,
        Domain::GemGlobal,
        Domain::GemRegional,
        Domain::GemHrdps,
        Domain::GemEnsemble,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Domain::Cerra => "cerra",
            Domain::GemGlobal => "gem_global",
            Domain::GemRegional => "gem_regional",
            Domain::GemHrdps => "gem_hrdps",
            Domain::GemEnsemble => "gem_ensemble",
        }
    }

    pub fn grid(&self) -> Grid {
        match self {
            Domain::Cerra => Grid::new(1069, 1069, 20.29, -58.0, 0.05, 0.12),
            Domain::GemGlobal => Grid::new(2400, 1201, -90.0, -180.0, 0.15, 0.15),
            Domain::GemRegional => Grid::new(935, 824, 18.14, -142.0, 0.09, 0.09),
            Domain::GemHrdps => Grid::new(2540, 1290, 27.28, -152.8, 0.0225, 0.0225),
            Domain::GemEnsemble => Grid::new(720, 361, -90.0, -180.0, 0.5, 0.5),
        }
    }

    /// Output time step of the assembled series.
    pub fn dt_seconds(&self) -> i64 {
        match self {
            Domain::Cerra => 3_600,
            Domain::GemGlobal | Domain::GemEnsemble => 10_800,
            Domain::GemRegional | Domain::GemHrdps => 3_600,
        }
    }

    pub fn dt_hours(&self) -> i64 {
        self.dt_seconds() / 3_600
    }

    pub fn ensemble_members(&self) -> usize {
        match self {
            Domain::GemEnsemble => 21,
            _ => 1,
        }
    }

    /// The ensemble grid is published with longitude 0..360 and must be
    /// rotated into -180..180 once per decoded field.
    pub fn is_longitude_shifted(&self) -> bool {
        matches!(self, Domain::GemEnsemble)
    }

    /// Whether the feed serves a direct terrain height field.
    pub fn has_terrain_field(&self) -> bool {
        !matches!(self, Domain::GemHrdps)
    }

    /// Whether sea points are masked out of the elevation field. The
    /// ensemble follows a different convention and keeps sea heights.
    pub fn uses_landmask(&self) -> bool {
        !matches!(self, Domain::GemEnsemble)
    }

    /// Model run hours per day.
    pub fn cycles(&self) -> &'static [u32] {
        match self {
            Domain::Cerra => &[0],
            Domain::GemGlobal | Domain::GemEnsemble => &[0, 12],
            Domain::GemRegional | Domain::GemHrdps => &[0, 6, 12, 18],
        }
    }

    /// Published forecast lead hours for one run.
    pub fn forecast_hours(&self) -> Vec<u32> {
        match self {
            Domain::Cerra => Vec::new(),
            Domain::GemGlobal => (0..=240).step_by(3).collect(),
            Domain::GemRegional => (0..=84).collect(),
            Domain::GemHrdps => (0..=48).collect(),
            Domain::GemEnsemble => {
                // 3-hourly to 192 h, 6-hourly beyond; the assembler fills
                // the odd 3 h slots by interpolation
                let mut hours: Vec<u32> = (0..=192).step_by(3).collect();
                hours.extend((198..=384).step_by(6));
                hours
            }
        }
    }

    /// Wall-clock budget for one fetch session.
    pub fn deadline_hours(&self) -> f64 {
        match self {
            Domain::Cerra => 24.0,
            Domain::GemEnsemble => 10.0,
            _ => 5.0,
        }
    }

    /// Steps per archive window file.
    pub fn n_time_per_file(&self) -> usize {
        match self {
            Domain::Cerra => 336,
            Domain::GemGlobal => 128,
            Domain::GemRegional => 128,
            Domain::GemHrdps => 64,
            Domain::GemEnsemble => 192,
        }
    }

    /// Most recent run that is plausibly complete upstream.
    pub fn last_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        // typical publication delay before a run is fully mirrored
        let t = now - Duration::hours(4);
        let hour = self
            .cycles()
            .iter()
            .copied()
            .filter(|&c| c <= t.hour())
            .max()
            .unwrap_or_else(|| *self.cycles().last().unwrap());
        let date = if self.cycles().iter().all(|&c| c > t.hour()) {
            t.date_naive() - Duration::days(1)
        } else {
            t.date_naive()
        };
        date.and_hms_opt(hour, 0, 0)
            .unwrap()
            .and_utc()
    }

    /// Download URL of one (run, lead hour, field) on the direct feed.
    pub fn grib_url(&self, run: DateTime<Utc>, hour: u32, grib_name: &str) -> String {
        let date = run.format("%Y%m%d");
        let rr = run.hour();
        match self {
            Domain::Cerra => unreachable!("reanalysis data is fetched through the CDS API"),
            Domain::GemGlobal => format!(
                "https://dd.weather.gc.ca/model_gem_global/15km/grib2/lat_lon/{rr:02}/{hour:03}/CMC_glb_{grib_name}_latlon.15x.15_{date}{rr:02}_P{hour:03}.grib2"
            ),
            Domain::GemRegional => format!(
                "https://dd.weather.gc.ca/model_gem_regional/10km/grib2/{rr:02}/{hour:03}/CMC_reg_{grib_name}_ps10km_{date}{rr:02}_P{hour:03}.grib2"
            ),
            Domain::GemHrdps => format!(
                "https://dd.weather.gc.ca/model_hrdps/continental/2.5km/{rr:02}/{hour:03}/{date}T{rr:02}Z_MSC_HRDPS_{grib_name}_RLatLon0.0225_PT{hour:03}H.grib2"
            ),
            Domain::GemEnsemble => format!(
                "https://dd.weather.gc.ca/ensemble/geps/grib2/raw/{rr:02}/{hour:03}/CMC_geps-raw_{grib_name}_latlon0p5x0p5_{date}{rr:02}_P{hour:03}_allmbrs.grib2"
            ),
        }
    }

    /// Directory for raw per-timestep files.
    pub fn download_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.id()).join("download")
    }

    /// Directory for the time-oriented archive windows.
    pub fn store_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.id()).join("store")
    }

    /// Directory for yearly one-file-per-variable archives.
    pub fn yearly_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.id()).join("yearly")
    }

    /// The static elevation/landmask field.
    pub fn elevation_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.id()).join("static").join("elevation.cst")
    }
}

impl FromStr for Domain {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.id() == s)
            .ok_or_else(|| IngestError::UnknownDomain(s.to_string()))
    }
}

/// Raw file for one (variable, forecast hour, member) on a forecast feed.
/// Member 0 (control) carries no suffix; the naming is the resume marker
/// and must stay stable.
pub fn raw_forecast_path(download_dir: &Path, variable: &str, hour: u32, member: usize) -> PathBuf {
    if member == 0 {
        download_dir.join(format!("{variable}_{hour:03}.cst"))
    } else {
        download_dir.join(format!("{variable}_{hour:03}_{member}.cst"))
    }
}

/// Raw file for one (variable, timestamp) of the reanalysis feed,
/// grouped into one directory per day.
pub fn raw_reanalysis_path(download_dir: &Path, variable: &str, t: DateTime<Utc>) -> PathBuf {
    download_dir
        .join(t.format("%Y%m%d").to_string())
        .join(format!("{variable}_{}.cst", t.format("%Y%m%d%H")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_domain_ids() {
        assert_eq!("gem_global".parse::<Domain>().unwrap(), Domain::GemGlobal);
        assert!(matches!(
            "mystery".parse::<Domain>(),
            Err(IngestError::UnknownDomain(_))
        ));
    }

    #[test]
    fn ensemble_hours_switch_to_six_hourly() {
        let hours = Domain::GemEnsemble.forecast_hours();
        assert!(hours.contains(&3));
        assert!(hours.contains(&192));
        assert!(!hours.contains(&195));
        assert!(hours.contains(&198));
        assert_eq!(*hours.last().unwrap(), 384);
    }

    #[test]
    fn last_run_rolls_back_before_first_cycle() {
        // 02:30 UTC minus delay lands the previous day for a 00/12 model
        let now = Utc.with_ymd_and_hms(2023, 5, 2, 2, 30, 0).unwrap();
        let run = Domain::GemGlobal.last_run(now);
        assert_eq!(run, Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn raw_paths_are_stable() {
        let dir = PathBuf::from("/data/gem_ensemble/download");
        assert_eq!(
            raw_forecast_path(&dir, "precipitation", 6, 0),
            dir.join("precipitation_006.cst")
        );
        assert_eq!(
            raw_forecast_path(&dir, "precipitation", 6, 3),
            dir.join("precipitation_006_3.cst")
        );

        let t = Utc.with_ymd_and_hms(2022, 1, 5, 9, 0, 0).unwrap();
        assert_eq!(
            raw_reanalysis_path(Path::new("/data/cerra/download"), "temperature_2m", t),
            PathBuf::from("/data/cerra/download/20220105/temperature_2m_2022010509.cst")
        );
    }

    #[test]
    fn grid_coordinates_follow_row_major_layout() {
        let grid = Grid::new(10, 5, 40.0, -10.0, 1.0, 2.0);
        assert_eq!(grid.count(), 50);
        assert_eq!(grid.coordinates(0), (40.0, -10.0));
        assert_eq!(grid.coordinates(12), (41.0, -6.0));
    }
}
