//! Static elevation and landmask resolution.
//!
//! Produces, once per domain, the grid-shaped height field with sea
//! points at the exclusion sentinel. Domains that serve a terrain field
//! use it directly; HRDPS serves none, so height is derived from
//! co-located 2 m temperature, surface pressure and sea-level pressure
//! via the hypsometric equation.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use chunk_store::{Compression, StoreWriter};
use tracing::info;

use crate::cds::{CdsRequest, ReanalysisApi, RetrieveOutcome};
use crate::decode::{GribMessage, MessageDecode};
use crate::domain::Domain;
use crate::error::{IngestError, Result};
use crate::fetch::GridFetch;
use crate::normalize::{multiply_add, shift_longitude_180};

/// Height value marking excluded (sea) locations.
pub const ELEVATION_SENTINEL: f32 = -999.0;

/// Specific gas constant of dry air, J kg-1 K-1.
const R_DRY: f32 = 287.053;
/// Standard gravity, m s-2.
const G: f32 = 9.806_65;

/// Hypsometric elevation from sea-level pressure, surface pressure (same
/// unit, e.g. hPa) and 2 m temperature in Celsius.
pub fn barometric_elevation(sea_level_pressure: f32, surface_pressure: f32, temperature_2m: f32) -> f32 {
    let t_kelvin = temperature_2m + 273.15;
    (R_DRY * t_kelvin / G) * (sea_level_pressure / surface_pressure).ln()
}

pub struct ElevationResolver<'a, D: MessageDecode> {
    pub decode: &'a D,
}

impl<'a, D: MessageDecode> ElevationResolver<'a, D> {
    pub fn new(decode: &'a D) -> Self {
        Self { decode }
    }

    /// Resolve a forecast domain's elevation from its direct feed.
    /// Skips entirely when the output already exists.
    pub async fn resolve_forecast<F: GridFetch>(
        &self,
        fetch: &F,
        domain: Domain,
        run: DateTime<Utc>,
        data_dir: &Path,
    ) -> Result<()> {
        let out = domain.elevation_path(data_dir);
        if out.exists() {
            return Ok(());
        }
        info!(domain = domain.id(), "Downloading height and landmask data");
        let grid = domain.grid();

        let mut height = if domain.has_terrain_field() {
            let name = match domain {
                Domain::GemHrdps => unreachable!(),
                _ => "HGT_SFC_0",
            };
            let mut field = self.single_field(fetch, domain, run, name).await?;
            if domain.is_longitude_shifted() {
                shift_longitude_180(&mut field, grid.nx);
            }
            field
        } else {
            // no terrain field on this feed; derive height barometrically
            let mut temperature = self
                .single_field(fetch, domain, run, "TMP_AGL-2m")
                .await?;
            multiply_add(&mut temperature, 1.0, -273.15);
            let mut surface_pressure = self
                .single_field(fetch, domain, run, "PRES_Sfc")
                .await?;
            multiply_add(&mut surface_pressure, 1.0 / 100.0, 0.0);
            let mut sea_level_pressure = self
                .single_field(fetch, domain, run, "PRMSL_MSL-0m")
                .await?;
            multiply_add(&mut sea_level_pressure, 1.0 / 100.0, 0.0);

            sea_level_pressure
                .iter()
                .zip(&surface_pressure)
                .zip(&temperature)
                .map(|((&slp, &sp), &t2m)| barometric_elevation(slp, sp, t2m))
                .collect()
        };

        if domain.uses_landmask() {
            let name = match domain {
                Domain::GemHrdps => "LAND_Sfc",
                _ => "LAND_SFC_0",
            };
            let landmask = self.single_field(fetch, domain, run, name).await?;
            apply_landmask(&mut height, &landmask);
        }

        self.write(&out, domain, &height)
    }

    /// Resolve the reanalysis domain's elevation through the archive
    /// API: one request for orography and land-sea mask.
    pub async fn resolve_reanalysis<A: ReanalysisApi>(
        &self,
        api: &A,
        domain: Domain,
        data_dir: &Path,
    ) -> Result<()> {
        let out = domain.elevation_path(data_dir);
        if out.exists() {
            return Ok(());
        }
        info!(domain = domain.id(), "Downloading orography and landmask");
        let grid = domain.grid();

        let download_dir = domain.download_dir(data_dir);
        std::fs::create_dir_all(&download_dir)?;
        let payload = tempfile::Builder::new()
            .prefix("elevation-")
            .suffix(".grib")
            .tempfile_in(&download_dir)?;

        let request = CdsRequest {
            dataset: reanalysis_dataset().to_string(),
            product_type: "analysis",
            variables: vec!["orography".to_string(), "land_sea_mask".to_string()],
            // any published date will do for static fields
            date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            times: vec!["00:00".to_string()],
            leadtime_hours: Vec::new(),
        };
        match api.retrieve(&request, payload.path()).await? {
            RetrieveOutcome::Completed => {}
            RetrieveOutcome::NotAvailable => {
                return Err(IngestError::Api(
                    "archive rejected the static orography request".into(),
                ));
            }
        }

        // messages arrive in request order: orography, then landmask
        let mut fields: Vec<Vec<f32>> = Vec::with_capacity(2);
        self.decode.iterate_file(payload.path(), &mut |message| {
            fields.push(load_grid(message, grid.nx, grid.ny)?);
            Ok(())
        })?;
        if fields.len() != 2 {
            return Err(IngestError::Decode(format!(
                "expected orography and landmask, got {} messages",
                fields.len()
            )));
        }
        let landmask = fields.pop().unwrap();
        let mut height = fields.pop().unwrap();
        // geopotential to meters
        multiply_add(&mut height, 1.0 / G, 0.0);
        apply_landmask(&mut height, &landmask);

        self.write(&out, domain, &height)
    }

    async fn single_field<F: GridFetch>(
        &self,
        fetch: &F,
        domain: Domain,
        run: DateTime<Utc>,
        grib_name: &str,
    ) -> Result<Vec<f32>> {
        let grid = domain.grid();
        let url = domain.grib_url(run, 0, grib_name);
        let body = fetch.fetch(&url).await?;
        let mut field = None;
        self.decode.iterate_bytes(body, &mut |message| {
            if field.is_none() {
                field = Some(load_grid(message, grid.nx, grid.ny)?);
            }
            Ok(())
        })?;
        field.ok_or_else(|| IngestError::Decode(format!("empty payload for {grib_name}")))
    }

    fn write(&self, out: &Path, domain: Domain, height: &[f32]) -> Result<()> {
        let grid = domain.grid();
        StoreWriter::new(grid.ny, grid.nx, 20, 20).write_all(
            out,
            Compression::ScaledInt16,
            1.0,
            height,
        )?;
        info!(domain = domain.id(), path = %out.display(), "Wrote elevation file");
        Ok(())
    }
}

/// Dataset name of the reanalysis archive.
pub fn reanalysis_dataset() -> &'static str {
    "reanalysis-cerra-single-levels"
}

/// Decode one message and verify it matches the domain grid.
pub fn load_grid(message: &dyn GribMessage, nx: usize, ny: usize) -> Result<Vec<f32>> {
    let (actual_nx, actual_ny) = message.grid_shape()?;
    if actual_nx != nx || actual_ny != ny {
        return Err(IngestError::MalformedGrid {
            expected_nx: nx,
            expected_ny: ny,
            actual_nx,
            actual_ny,
        });
    }
    message.values()
}

/// 0 = sea, 1 = land; sea heights become the exclusion sentinel.
fn apply_landmask(height: &mut [f32], landmask: &[f32]) {
    for (h, &mask) in height.iter_mut().zip(landmask) {
        if mask < 0.5 {
            *h = ELEVATION_SENTINEL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::{FakeDecode, FakeMessage};
    use crate::fetch::testing::FakeFetch;
    use bytes::Bytes;
    use chrono::TimeZone;
    use chunk_store::StoreReader;

    #[test]
    fn hypsometric_equation_matches_reference_value() {
        // 1013 hPa at sea level, 900 hPa at the surface, 15 C
        let h = barometric_elevation(1013.0, 900.0, 15.0);
        assert!((h - 998.1).abs() < 1.0, "got {h}");
    }

    #[test]
    fn sea_level_surface_is_at_zero() {
        let h = barometric_elevation(1000.0, 1000.0, 10.0);
        assert_eq!(h, 0.0);
    }

    #[test]
    fn landmask_marks_sea_with_sentinel() {
        let mut height = vec![120.0, 30.0, 4.0];
        apply_landmask(&mut height, &[1.0, 0.0, 0.6]);
        assert_eq!(height, vec![120.0, ELEVATION_SENTINEL, 4.0]);
    }

    #[test]
    fn load_grid_rejects_mismatched_dimensions() {
        let message = FakeMessage::filled(4, 4, 1.0);
        assert!(matches!(
            load_grid(&message, 5, 4),
            Err(IngestError::MalformedGrid { .. })
        ));
    }

    #[tokio::test]
    async fn forecast_resolution_skips_existing_output() {
        let data_dir = tempfile::tempdir().unwrap();
        let domain = Domain::GemGlobal;
        let out = domain.elevation_path(data_dir.path());
        std::fs::create_dir_all(out.parent().unwrap()).unwrap();
        std::fs::write(&out, b"present").unwrap();

        // no payloads registered: any fetch would fail
        let fetch = FakeFetch::default();
        let decode = FakeDecode::default();
        let resolver = ElevationResolver::new(&decode);
        let run = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        resolver
            .resolve_forecast(&fetch, domain, run, data_dir.path())
            .await
            .unwrap();
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn barometric_fallback_without_terrain_field() {
        let data_dir = tempfile::tempdir().unwrap();
        let domain = Domain::GemHrdps;
        let grid = domain.grid();
        let run = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

        let mut fetch = FakeFetch::default();
        let mut decode = FakeDecode::default();
        for (name, value) in [
            ("TMP_AGL-2m", 288.15f32), // 15 C in Kelvin
            ("PRES_Sfc", 90_000.0),    // Pa
            ("PRMSL_MSL-0m", 101_300.0),
            ("LAND_Sfc", 1.0),
        ] {
            let url = domain.grib_url(run, 0, name);
            fetch.by_url.insert(url, Bytes::from(name));
            decode.by_key.insert(
                name.to_string(),
                vec![FakeMessage::filled(grid.nx, grid.ny, value)],
            );
        }

        let resolver = ElevationResolver::new(&decode);
        resolver
            .resolve_forecast(&fetch, domain, run, data_dir.path())
            .await
            .unwrap();

        let reader = StoreReader::open(&domain.elevation_path(data_dir.path())).unwrap();
        let values = reader.read(0..1, 0..1).unwrap();
        assert!((values[0] - 998.0).abs() < 2.0, "got {}", values[0]);
    }
}
