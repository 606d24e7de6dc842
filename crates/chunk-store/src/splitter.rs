//! Time-oriented archive maintenance.
//!
//! An archive holds one file per fixed-length time window per variable,
//! each a `(n_locations x n_time_per_file)` array indexed by a global
//! step count since the epoch. Updating a sub-range rewrites only the
//! touched window files, merging new columns over the existing ones,
//! one location chunk at a time.

use std::fs;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::format::{encode_values, Header};
use crate::{Compression, Result, StoreError, StoreReader};

/// Default upper bound on the floats held per location chunk (values, not
/// bytes); keeps merge memory around a few megabytes.
const DEFAULT_CHUNK_VALUES: usize = 4 * 1024 * 1024;

pub struct StoreSplitter {
    base_path: PathBuf,
    n_locations: usize,
    n_time_per_file: usize,
    locations_per_chunk: usize,
}

struct WindowFile {
    /// First global step index covered by this window.
    start_step: i64,
    old: Option<StoreReader>,
    temp: BufWriter<NamedTempFile>,
    final_path: PathBuf,
}

impl StoreSplitter {
    /// `chunk_locations` overrides the derived location-chunk size; pass a
    /// multiple of the ensemble member count when dim0 interleaves members.
    pub fn new(
        base_path: impl Into<PathBuf>,
        n_locations: usize,
        n_time_per_file: usize,
        chunk_locations: Option<usize>,
    ) -> Self {
        let derived = (DEFAULT_CHUNK_VALUES / n_time_per_file.max(1)).clamp(1, n_locations.max(1));
        Self {
            base_path: base_path.into(),
            n_locations,
            n_time_per_file,
            locations_per_chunk: chunk_locations.unwrap_or(derived),
        }
    }

    pub fn n_locations(&self) -> usize {
        self.n_locations
    }

    pub fn n_time_per_file(&self) -> usize {
        self.n_time_per_file
    }

    /// The location-chunk size the producer will be driven with.
    pub fn locations_per_chunk(&self) -> usize {
        self.locations_per_chunk
    }

    /// Archive file for one variable and window index.
    pub fn file_path(&self, variable: &str, window: i64) -> PathBuf {
        self.base_path.join(format!("{variable}_{window}.cst"))
    }

    /// Merge a dense in-memory block of `n_locations * index_time.len()`
    /// values into the archive.
    #[allow(clippy::too_many_arguments)]
    pub fn update_time_oriented(
        &self,
        variable: &str,
        block: &[f32],
        index_time: Range<i64>,
        skip_first: usize,
        skip_last: usize,
        smooth_width: usize,
        scale_factor: f32,
        compression: Compression,
    ) -> Result<()> {
        let nt = (index_time.end - index_time.start) as usize;
        if block.len() != self.n_locations * nt {
            return Err(StoreError::InvalidDimensions(format!(
                "block holds {} values, expected {} locations x {} steps",
                block.len(),
                self.n_locations,
                nt
            )));
        }
        self.update_time_oriented_streaming(
            variable,
            index_time,
            skip_first,
            skip_last,
            smooth_width,
            scale_factor,
            compression,
            |offset| {
                let rows = (self.n_locations - offset).min(self.locations_per_chunk);
                Ok::<_, StoreError>(block[offset * nt..(offset + rows) * nt].to_vec())
            },
        )
    }

    /// Merge new data into the archive, pulling location chunks from a
    /// producer callback.
    ///
    /// `index_time` is a half-open range of global step indices; the
    /// producer must return, for each strictly increasing location offset,
    /// a buffer of `rows * index_time.len()` values laid out location-major.
    /// The first `skip_first` and last `skip_last` steps of the new data
    /// are not persisted, and NaN cells never overwrite stored values.
    #[allow(clippy::too_many_arguments)]
    pub fn update_time_oriented_streaming<F, E>(
        &self,
        variable: &str,
        index_time: Range<i64>,
        skip_first: usize,
        skip_last: usize,
        smooth_width: usize,
        scale_factor: f32,
        compression: Compression,
        mut producer: F,
    ) -> std::result::Result<(), E>
    where
        F: FnMut(usize) -> std::result::Result<Vec<f32>, E>,
        E: From<StoreError>,
    {
        let nt = (index_time.end - index_time.start) as usize;
        if nt == 0 || self.n_locations == 0 {
            return Ok(());
        }
        let ntpf = self.n_time_per_file;

        fs::create_dir_all(&self.base_path).map_err(StoreError::Io)?;
        let mut windows = self.open_windows(variable, &index_time, compression, scale_factor)?;

        // Global step range that survives the skip margins.
        let keep = (index_time.start + skip_first as i64)..(index_time.end - skip_last as i64);

        let mut offset = 0usize;
        while offset < self.n_locations {
            let buffer = producer(offset)?;
            let remaining = self.n_locations - offset;
            if buffer.is_empty() || buffer.len() % nt != 0 || buffer.len() / nt > remaining {
                return Err(StoreError::BadProducerBuffer {
                    offset,
                    got: buffer.len(),
                    dim1: nt,
                    remaining,
                }
                .into());
            }
            let rows = buffer.len() / nt;

            for window in windows.iter_mut() {
                let old_rows = match &window.old {
                    Some(reader) => reader.read(offset..offset + rows, 0..ntpf)?,
                    None => vec![f32::NAN; rows * ntpf],
                };
                let mut encoded = Vec::new();
                let mut row_out = vec![f32::NAN; ntpf];
                let mut series = vec![f32::NAN; nt];
                for r in 0..rows {
                    row_out.copy_from_slice(&old_rows[r * ntpf..(r + 1) * ntpf]);
                    series.copy_from_slice(&buffer[r * nt..(r + 1) * nt]);
                    if smooth_width > 0 {
                        smooth_series(&mut series, smooth_width);
                    }
                    for t_file in 0..ntpf {
                        let step = window.start_step + t_file as i64;
                        if step < keep.start || step >= keep.end {
                            continue;
                        }
                        let new = series[(step - index_time.start) as usize];
                        if !new.is_nan() {
                            row_out[t_file] = new;
                        }
                    }
                    encoded.clear();
                    encode_values(&row_out, compression, scale_factor, &mut encoded);
                    window.temp.write_all(&encoded).map_err(StoreError::Io)?;
                }
            }
            offset += rows;
        }

        for window in windows {
            let temp = window
                .temp
                .into_inner()
                .map_err(|e| StoreError::Io(e.into_error()))?;
            temp.persist(&window.final_path)
                .map_err(|e| StoreError::Io(e.error))?;
            debug!(path = %window.final_path.display(), "Updated archive window");
        }
        Ok(())
    }

    fn open_windows(
        &self,
        variable: &str,
        index_time: &Range<i64>,
        compression: Compression,
        scale_factor: f32,
    ) -> Result<Vec<WindowFile>> {
        let ntpf = self.n_time_per_file as i64;
        let first = index_time.start.div_euclid(ntpf);
        let last = (index_time.end - 1).div_euclid(ntpf);

        let mut windows = Vec::with_capacity((last - first + 1) as usize);
        for index in first..=last {
            let final_path = self.file_path(variable, index);
            let old = if final_path.exists() {
                let reader = StoreReader::open(&final_path)?;
                if reader.dim0() != self.n_locations || reader.dim1() != self.n_time_per_file {
                    return Err(StoreError::InvalidDimensions(format!(
                        "archive {} is {} x {}, splitter expects {} x {}",
                        final_path.display(),
                        reader.dim0(),
                        reader.dim1(),
                        self.n_locations,
                        self.n_time_per_file
                    )));
                }
                Some(reader)
            } else {
                None
            };
            let temp = NamedTempFile::new_in(&self.base_path)?;
            let mut temp = BufWriter::new(temp);
            Header {
                dim0: self.n_locations,
                dim1: self.n_time_per_file,
                chunk0: self.locations_per_chunk.min(self.n_locations),
                chunk1: self.n_time_per_file,
                compression,
                scale_factor,
            }
            .write_to(&mut temp)?;
            windows.push(WindowFile {
                start_step: index * ntpf,
                old,
                temp,
                final_path,
            });
        }
        Ok(windows)
    }
}

/// Centered moving average over `2 * width + 1` steps, skipping NaN.
fn smooth_series(series: &mut [f32], width: usize) {
    let source = series.to_vec();
    for (i, out) in series.iter_mut().enumerate() {
        if source[i].is_nan() {
            continue;
        }
        let lo = i.saturating_sub(width);
        let hi = (i + width + 1).min(source.len());
        let mut sum = 0.0f32;
        let mut n = 0u32;
        for &v in &source[lo..hi] {
            if !v.is_nan() {
                sum += v;
                n += 1;
            }
        }
        *out = sum / n as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(dir: &Path) -> StoreSplitter {
        // 4 locations, 8 steps per window, chunks of 2 locations
        StoreSplitter::new(dir, 4, 8, Some(2))
    }

    #[test]
    fn update_spanning_two_windows() {
        let dir = tempfile::tempdir().unwrap();
        let s = splitter(dir.path());

        // steps 6..10 cross the boundary between windows 0 and 1
        let block: Vec<f32> = (0..4 * 4).map(|v| v as f32).collect();
        s.update_time_oriented("temperature_2m", &block, 6..10, 0, 0, 0, 1.0, Compression::Float32)
            .unwrap();

        let w0 = StoreReader::open(&s.file_path("temperature_2m", 0)).unwrap();
        let w1 = StoreReader::open(&s.file_path("temperature_2m", 1)).unwrap();

        // location 1: new series is [4, 5, 6, 7] at steps 6..10
        let row0 = w0.read(1..2, 0..8).unwrap();
        assert!(row0[..6].iter().all(|v| v.is_nan()));
        assert_eq!(&row0[6..], &[4.0, 5.0]);

        let row1 = w1.read(1..2, 0..8).unwrap();
        assert_eq!(&row1[..2], &[6.0, 7.0]);
        assert!(row1[2..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn merge_preserves_existing_steps() {
        let dir = tempfile::tempdir().unwrap();
        let s = splitter(dir.path());

        let first = vec![1.0f32; 4 * 2];
        s.update_time_oriented("gusts", &first, 0..2, 0, 0, 0, 1.0, Compression::Float32)
            .unwrap();
        let second = vec![2.0f32; 4 * 2];
        s.update_time_oriented("gusts", &second, 2..4, 0, 0, 0, 1.0, Compression::Float32)
            .unwrap();

        let w = StoreReader::open(&s.file_path("gusts", 0)).unwrap();
        let row = w.read(0..1, 0..8).unwrap();
        assert_eq!(&row[..4], &[1.0, 1.0, 2.0, 2.0]);
        assert!(row[4..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn skip_first_leaves_leading_step_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let s = splitter(dir.path());

        let block = vec![5.0f32; 4 * 4];
        s.update_time_oriented("precip", &block, 0..4, 1, 0, 0, 1.0, Compression::Float32)
            .unwrap();

        let w = StoreReader::open(&s.file_path("precip", 0)).unwrap();
        let row = w.read(0..1, 0..8).unwrap();
        assert!(row[0].is_nan());
        assert_eq!(&row[1..4], &[5.0, 5.0, 5.0]);
    }

    #[test]
    fn nan_does_not_clobber_stored_values() {
        let dir = tempfile::tempdir().unwrap();
        let s = splitter(dir.path());

        let good = vec![3.0f32; 4 * 2];
        s.update_time_oriented("snow", &good, 0..2, 0, 0, 0, 1.0, Compression::Float32)
            .unwrap();
        let partial = vec![f32::NAN; 4 * 2];
        s.update_time_oriented("snow", &partial, 0..2, 0, 0, 0, 1.0, Compression::Float32)
            .unwrap();

        let w = StoreReader::open(&s.file_path("snow", 0)).unwrap();
        let row = w.read(2..3, 0..8).unwrap();
        assert_eq!(&row[..2], &[3.0, 3.0]);
    }

    #[test]
    fn streaming_offsets_cover_all_locations() {
        let dir = tempfile::tempdir().unwrap();
        let s = splitter(dir.path());

        let mut offsets = Vec::new();
        s.update_time_oriented_streaming(
            "wind",
            0..4,
            0,
            0,
            0,
            1.0,
            Compression::Float32,
            |offset| {
                offsets.push(offset);
                Ok::<_, StoreError>(vec![offset as f32; 2 * 4])
            },
        )
        .unwrap();
        assert_eq!(offsets, vec![0, 2]);
    }

    #[test]
    fn smooth_series_averages_neighbors() {
        let mut series = vec![0.0, 3.0, 6.0];
        smooth_series(&mut series, 1);
        assert_eq!(series, vec![1.5, 3.0, 4.5]);
    }
}
