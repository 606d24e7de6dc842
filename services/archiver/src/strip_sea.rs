//! The strip-sea command: rewrite yearly archives with the time series
//! of excluded locations blanked out, streaming one location chunk at a
//! time through the writer protocol.

use std::path::Path;

use anyhow::{Context, Result};
use chunk_store::{StoreReader, StoreWriter};
use clap::Args;
use tracing::{info, warn};

use ingestion::domain::Domain;
use ingestion::elevation::ELEVATION_SENTINEL;
use ingestion::{IngestError, VariableRegistry};

#[derive(Args, Debug)]
pub struct StripSeaArgs {
    /// Year of the archives to strip
    #[arg(long, short = 'y')]
    year: i32,
}

pub fn run(args: StripSeaArgs, data_dir: &Path) -> Result<()> {
    let registry = VariableRegistry::load()?;
    let domain = Domain::Cerra;
    let grid = domain.grid();

    info!("Reading elevation");
    let elevation = StoreReader::open(&domain.elevation_path(data_dir))
        .context("elevation file missing, run the reanalysis command first")?
        .read_all()?;

    let yearly_dir = domain.yearly_dir(data_dir);
    let out_dir = data_dir.join(domain.id()).join("yearly-no-sea");

    for variable in registry.for_domain(domain) {
        info!(variable = variable.id, "Stripping variable");
        let src = yearly_dir.join(format!("{}_{}.cst", variable.id, args.year));
        if !src.exists() {
            warn!(variable = variable.id, "No yearly archive, skipping");
            continue;
        }
        let dst = out_dir.join(format!("{}_{}.cst", variable.id, args.year));
        if dst.exists() {
            continue;
        }
        strip_file(&src, &dst, &grid, &elevation)
            .with_context(|| format!("stripping {}", variable.id))?;
    }
    Ok(())
}

/// Locations with no archive value: open sea, high latitudes, and the
/// sparsely inhabited polar sectors.
fn is_excluded(elevation: f32, lat: f32, lon: f32) -> bool {
    let north_russia = lon >= 43.0 && lat > 63.0;
    let north_canada_greenland_alaska = lat > 66.0 && lon < -26.0;
    let antarctica = lat < -56.0;
    elevation <= ELEVATION_SENTINEL || lat > 72.0 || north_russia || north_canada_greenland_alaska || antarctica
}

fn strip_file(
    src: &Path,
    dst: &Path,
    grid: &ingestion::Grid,
    elevation: &[f32],
) -> Result<()> {
    let reader = StoreReader::open(src)?;
    let n_locations = reader.dim0();
    let n_time = reader.dim1();
    // a few megabytes of values per pass
    let chunk = (4 * 1024 * 1024 / n_time.max(1)).clamp(1, n_locations);
    let writer = StoreWriter::new(n_locations, n_time, reader.chunk0(), reader.chunk1());

    let mut percent = 0u32;
    writer.write(
        dst,
        reader.compression(),
        reader.scale_factor(),
        |offset| {
            let ratio = (offset as f64 / n_locations as f64 * 100.0) as u32;
            if ratio != percent {
                info!(percent = ratio, "progress");
                percent = ratio;
            }

            let rows = chunk.min(n_locations - offset);
            reader.prefetch(offset..offset + rows, 0..n_time);
            let mut data = reader.read(offset..offset + rows, 0..n_time)?;
            for location in offset..offset + rows {
                let (lat, lon) = grid.coordinates(location);
                if is_excluded(elevation[location], lat, lon) {
                    let row = (location - offset) * n_time;
                    data[row..row + n_time].fill(f32::NAN);
                }
            }
            Ok::<_, IngestError>(data)
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_rules() {
        // sea sentinel
        assert!(is_excluded(ELEVATION_SENTINEL, 50.0, 10.0));
        // polar latitude
        assert!(is_excluded(100.0, 73.0, 10.0));
        // northern russia sector
        assert!(is_excluded(100.0, 64.0, 50.0));
        // central europe stays
        assert!(!is_excluded(300.0, 48.0, 11.0));
    }
}
