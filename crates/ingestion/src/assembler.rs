//! Chunked time-series assembly.
//!
//! Takes the scattered raw per-timestep files of one variable and
//! produces a dense, time-ordered representation of the full range,
//! streamed to the store in location-chunk increments. Peak memory is
//! `chunk locations x members x time steps`, independent of grid size
//! and range length.

use std::path::PathBuf;

use chunk_store::{StoreReader, StoreSplitter, StoreWriter};
use tracing::{info, warn};

use crate::error::{IngestError, Result};
use crate::progress::ProgressTracker;
use crate::time::TimeRange;
use crate::variables::{Interpolation, Variable};

/// Dense (location x member x time) buffer, location-major, member next,
/// time fastest. Every cell is either a normalized value or NaN.
pub struct Block3d {
    n_locations: usize,
    n_members: usize,
    n_time: usize,
    data: Vec<f32>,
}

impl Block3d {
    pub fn new(n_locations: usize, n_members: usize, n_time: usize) -> Self {
        Self {
            n_locations,
            n_members,
            n_time,
            data: vec![f32::NAN; n_locations * n_members * n_time],
        }
    }

    pub fn n_locations(&self) -> usize {
        self.n_locations
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Shrink or grow to `n_locations` rows and reset every cell to the
    /// missing sentinel. Keeps the allocation across chunks.
    pub fn reset(&mut self, n_locations: usize) {
        self.n_locations = n_locations;
        let len = n_locations * self.n_members * self.n_time;
        self.data.clear();
        self.data.resize(len, f32::NAN);
    }

    #[inline]
    fn index(&self, location: usize, member: usize, t: usize) -> usize {
        (location * self.n_members + member) * self.n_time + t
    }

    pub fn get(&self, location: usize, member: usize, t: usize) -> f32 {
        self.data[self.index(location, member, t)]
    }

    pub fn set(&mut self, location: usize, member: usize, t: usize, value: f32) {
        let i = self.index(location, member, t);
        self.data[i] = value;
    }

    /// Copy one per-location slice into the given (member, t) slot.
    pub fn set_time_slice(&mut self, member: usize, t: usize, values: &[f32]) {
        debug_assert_eq!(values.len(), self.n_locations);
        for (location, &v) in values.iter().enumerate() {
            let i = self.index(location, member, t);
            self.data[i] = v;
        }
    }

    /// Fill output slots not covered by a native step from their
    /// immediately bracketing native slots (window of one step each
    /// side). Native slots are never touched.
    pub fn interpolate_gaps(&mut self, policy: Interpolation, native: &[bool]) {
        debug_assert_eq!(native.len(), self.n_time);
        for t in 0..self.n_time {
            if native[t] {
                continue;
            }
            let prev = (t > 0 && native[t - 1]).then(|| t - 1);
            let next = (t + 1 < self.n_time && native[t + 1]).then(|| t + 1);
            for location in 0..self.n_locations {
                for member in 0..self.n_members {
                    let a = prev.map(|p| self.get(location, member, p)).filter(|v| !v.is_nan());
                    let b = next.map(|n| self.get(location, member, n)).filter(|v| !v.is_nan());
                    let value = match (policy, a, b) {
                        (Interpolation::Nearest, Some(a), _) => a,
                        (Interpolation::Nearest, None, Some(b)) => b,
                        (_, Some(a), Some(b)) => {
                            let v = (a + b) / 2.0;
                            if policy == Interpolation::SolarRadiation {
                                v.max(0.0)
                            } else {
                                v
                            }
                        }
                        (_, Some(v), None) | (_, None, Some(v)) => v,
                        (_, None, None) => continue,
                    };
                    self.set(location, member, t, value);
                }
            }
        }
    }

    /// Convert a cumulative-since-start series to per-step deltas in
    /// place. The first slot keeps the raw cumulative value, and so does
    /// any slot whose predecessor is missing (its value still is the
    /// accumulation since the sequence start).
    pub fn deaccumulate(&mut self) {
        for series in self.data.chunks_exact_mut(self.n_time) {
            for t in (1..series.len()).rev() {
                let prev = series[t - 1];
                if !prev.is_nan() {
                    series[t] -= prev;
                }
            }
        }
    }
}

/// One raw per-timestep input of the assembly.
#[derive(Debug, Clone)]
pub struct RawSource {
    /// Index on the output time axis.
    pub t: usize,
    pub member: usize,
    pub path: PathBuf,
}

/// Everything needed to convert one variable.
pub struct AssemblePlan<'a> {
    pub variable: &'a Variable,
    /// Output time axis of the assembled series.
    pub time: TimeRange,
    pub n_locations: usize,
    pub n_members: usize,
    /// Expected raw inputs; files that do not exist leave their slots at
    /// the missing sentinel.
    pub sources: Vec<RawSource>,
    /// Output slots directly covered by a natively published step.
    pub native_steps: Vec<usize>,
    /// Apply de-accumulation (cumulative forecast feeds only).
    pub deaccumulate: bool,
    /// Leading output steps never persisted (undefined at hour 0).
    pub skip_first: usize,
}

impl AssemblePlan<'_> {
    fn open_sources(&self) -> Result<Vec<(usize, usize, StoreReader)>> {
        let mut readers = Vec::with_capacity(self.sources.len());
        let mut missing = 0usize;
        for source in &self.sources {
            if !source.path.exists() {
                missing += 1;
                continue;
            }
            let reader = StoreReader::open(&source.path)?;
            if reader.dim0() != 1 || reader.dim1() != self.n_locations {
                return Err(IngestError::MalformedGrid {
                    expected_nx: self.n_locations,
                    expected_ny: 1,
                    actual_nx: reader.dim1(),
                    actual_ny: reader.dim0(),
                });
            }
            readers.push((source.t, source.member, reader));
        }
        if missing > 0 {
            // once per variable, not per file
            warn!(
                variable = self.variable.id,
                missing,
                expected = self.sources.len(),
                "Raw inputs missing, slots stay at the missing sentinel"
            );
        }
        Ok(readers)
    }

    fn native_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.time.count()];
        for &t in &self.native_steps {
            if t < mask.len() {
                mask[t] = true;
            }
        }
        mask
    }

    fn has_gaps(&self, mask: &[bool]) -> bool {
        mask.iter().any(|covered| !covered)
    }
}

/// Stream one variable into the time-oriented archive.
///
/// The splitter drives the producer with strictly increasing offsets
/// into the flattened (location x member) dimension; each call fills one
/// location chunk across all members and the full time range. Returns
/// `false` when there was nothing to convert.
pub fn convert_variable(plan: &AssemblePlan, splitter: &StoreSplitter) -> Result<bool> {
    let readers = plan.open_sources()?;
    if readers.is_empty() {
        info!(variable = plan.variable.id, "No raw inputs in range, skipping");
        return Ok(false);
    }

    let chunk = splitter.locations_per_chunk();
    if chunk % plan.n_members != 0 || splitter.n_locations() != plan.n_locations * plan.n_members {
        return Err(IngestError::Store(chunk_store::StoreError::InvalidDimensions(
            format!(
                "splitter is {} locations in chunks of {}, plan has {} x {} members",
                splitter.n_locations(),
                chunk,
                plan.n_locations,
                plan.n_members
            ),
        )));
    }
    let chunk_locations = chunk / plan.n_members;

    let n_time = plan.time.count();
    let mask = plan.native_mask();
    let interpolate = plan.has_gaps(&mask);
    let mut block = Block3d::new(chunk_locations, plan.n_members, n_time);
    let mut progress = ProgressTracker::new(
        format!("convert {}", plan.variable.id),
        plan.n_locations * plan.n_members,
    );

    splitter.update_time_oriented_streaming(
        plan.variable.id,
        plan.time.index_time(),
        plan.skip_first,
        0,
        0,
        plan.variable.scale_factor,
        plan.variable.compression(),
        |offset| {
            let location0 = offset / plan.n_members;
            let locations = chunk_locations.min(plan.n_locations - location0);
            block.reset(locations);
            for (t, member, reader) in &readers {
                let slice = reader.read(0..1, location0..location0 + locations)?;
                block.set_time_slice(*member, *t, &slice);
            }
            if interpolate {
                block.interpolate_gaps(plan.variable.interpolation, &mask);
            }
            if plan.deaccumulate {
                block.deaccumulate();
            }
            progress.add(locations * plan.n_members);
            Ok::<_, IngestError>(block.data().to_vec())
        },
    )?;
    progress.finish();
    Ok(true)
}

/// Assemble one variable's raw files into a single long file (yearly
/// archive layout), using the same producer protocol. Skips work when
/// the output already exists.
pub fn assemble_long_file(
    plan: &AssemblePlan,
    out_path: &std::path::Path,
    chunk_locations: usize,
) -> Result<bool> {
    if out_path.exists() {
        info!(variable = plan.variable.id, out = %out_path.display(), "Output exists, skipping");
        return Ok(false);
    }
    let readers = plan.open_sources()?;
    if readers.is_empty() {
        info!(variable = plan.variable.id, "No raw inputs in range, skipping");
        return Ok(false);
    }

    let n_time = plan.time.count();
    let writer = StoreWriter::new(plan.n_locations, n_time, chunk_locations, n_time);
    let mut block = Block3d::new(chunk_locations, 1, n_time);
    let mut progress = ProgressTracker::new(
        format!("assemble {}", plan.variable.id),
        plan.n_locations,
    );

    writer.write(
        out_path,
        plan.variable.compression(),
        plan.variable.scale_factor,
        |offset| {
            let locations = chunk_locations.min(plan.n_locations - offset);
            block.reset(locations);
            for (t, _member, reader) in &readers {
                let slice = reader.read(0..1, offset..offset + locations)?;
                block.set_time_slice(0, *t, &slice);
            }
            progress.add(locations);
            Ok::<_, IngestError>(block.data().to_vec())
        },
    )?;
    progress.finish();
    Ok(true)
}
