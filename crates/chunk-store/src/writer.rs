//! Producer-driven writer for store files.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::format::{encode_values, Header};
use crate::{Compression, Result, StoreError};

/// Writes a `dim0 x dim1` array, pulling data from a producer callback
/// one block of `dim0` rows at a time.
///
/// The producer is invoked with strictly increasing row offsets and must
/// return a buffer holding a positive whole number of rows starting at
/// that offset. This keeps peak memory at one block regardless of the
/// full array size. Output is written to a temporary file and renamed
/// into place, so a crashed write never leaves a truncated file behind.
#[derive(Debug, Clone, Copy)]
pub struct StoreWriter {
    pub dim0: usize,
    pub dim1: usize,
    pub chunk0: usize,
    pub chunk1: usize,
}

impl StoreWriter {
    pub fn new(dim0: usize, dim1: usize, chunk0: usize, chunk1: usize) -> Self {
        Self {
            dim0,
            dim1,
            chunk0,
            chunk1,
        }
    }

    /// Write a file by repeatedly asking `producer` for the next rows.
    ///
    /// The error type is generic so callers can thread their own errors
    /// through the producer; store-level failures convert via `From`.
    pub fn write<F, E>(
        &self,
        path: &Path,
        compression: Compression,
        scale_factor: f32,
        mut producer: F,
    ) -> std::result::Result<(), E>
    where
        F: FnMut(usize) -> std::result::Result<Vec<f32>, E>,
        E: From<StoreError>,
    {
        if self.dim0 == 0 || self.dim1 == 0 {
            return Err(StoreError::InvalidDimensions(format!(
                "{} x {}",
                self.dim0, self.dim1
            ))
            .into());
        }
        if !(scale_factor > 0.0) {
            return Err(StoreError::BadScaleFactor(scale_factor).into());
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(StoreError::Io)?;
        let temp = NamedTempFile::new_in(dir).map_err(StoreError::Io)?;
        let mut out = BufWriter::new(temp);

        Header {
            dim0: self.dim0,
            dim1: self.dim1,
            chunk0: self.chunk0,
            chunk1: self.chunk1,
            compression,
            scale_factor,
        }
        .write_to(&mut out)?;

        let mut encoded = Vec::new();
        let mut offset = 0usize;
        while offset < self.dim0 {
            let buffer = producer(offset)?;
            let remaining = self.dim0 - offset;
            if buffer.is_empty()
                || buffer.len() % self.dim1 != 0
                || buffer.len() / self.dim1 > remaining
            {
                return Err(StoreError::BadProducerBuffer {
                    offset,
                    got: buffer.len(),
                    dim1: self.dim1,
                    remaining,
                }
                .into());
            }
            encoded.clear();
            encode_values(&buffer, compression, scale_factor, &mut encoded);
            out.write_all(&encoded).map_err(StoreError::Io)?;
            offset += buffer.len() / self.dim1;
        }

        let temp = out
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        temp.persist(path)
            .map_err(|e| StoreError::Io(e.error))?;
        debug!(path = %path.display(), dim0 = self.dim0, dim1 = self.dim1, "Wrote store file");
        Ok(())
    }

    /// Write a file from a single in-memory buffer of `dim0 * dim1` values.
    pub fn write_all(
        &self,
        path: &Path,
        compression: Compression,
        scale_factor: f32,
        data: &[f32],
    ) -> Result<()> {
        if data.len() != self.dim0 * self.dim1 {
            return Err(StoreError::InvalidDimensions(format!(
                "buffer holds {} values, dimensions require {}",
                data.len(),
                self.dim0 * self.dim1
            )));
        }
        self.write(path, compression, scale_factor, |_| {
            Ok::<_, StoreError>(data.to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreReader;

    #[test]
    fn producer_offsets_are_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.cst");
        let writer = StoreWriter::new(6, 4, 2, 4);

        let mut offsets = Vec::new();
        writer
            .write(&path, Compression::Float32, 1.0, |offset| {
                offsets.push(offset);
                // two rows at a time
                Ok::<_, StoreError>(vec![offset as f32; 2 * 4])
            })
            .unwrap();

        assert_eq!(offsets, vec![0, 2, 4]);
    }

    #[test]
    fn rejects_oversized_producer_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.cst");
        let writer = StoreWriter::new(2, 4, 1, 4);

        let result: std::result::Result<(), StoreError> =
            writer.write(&path, Compression::Float32, 1.0, |_| Ok(vec![0.0; 3 * 4]));
        assert!(matches!(result, Err(StoreError::BadProducerBuffer { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn write_all_then_read_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.cst");
        let data: Vec<f32> = (0..12).map(|v| v as f32 * 0.5).collect();

        StoreWriter::new(3, 4, 1, 4)
            .write_all(&path, Compression::Float32, 1.0, &data)
            .unwrap();

        let reader = StoreReader::open(&path).unwrap();
        assert_eq!(reader.dim0(), 3);
        assert_eq!(reader.dim1(), 4);
        assert_eq!(reader.read_all().unwrap(), data);
    }
}
