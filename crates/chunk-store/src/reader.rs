//! Slice-addressable reader for store files.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::format::{decode_values, Header, HEADER_LEN};
use crate::{Compression, Result, StoreError};

/// Read access to one store file.
///
/// Both codecs are fixed-width, so a `(dim0, dim1)` sub-rectangle is read
/// with one seek per row and nothing else is touched.
pub struct StoreReader {
    file: Mutex<File>,
    path: PathBuf,
    header: Header,
}

impl StoreReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let header = {
            let mut reader = BufReader::new(&mut file);
            Header::read_from(&mut reader)?
        };
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn dim0(&self) -> usize {
        self.header.dim0
    }

    pub fn dim1(&self) -> usize {
        self.header.dim1
    }

    pub fn chunk0(&self) -> usize {
        self.header.chunk0
    }

    pub fn chunk1(&self) -> usize {
        self.header.chunk1
    }

    pub fn compression(&self) -> Compression {
        self.header.compression
    }

    pub fn scale_factor(&self) -> f32 {
        self.header.scale_factor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort hint that `read` for the same rectangle is imminent.
    ///
    /// The flat layout already reads minimally, so this is advisory only.
    pub fn prefetch(&self, _d0: Range<usize>, _d1: Range<usize>) {}

    /// Read a sub-rectangle, returned row-major as `d0.len() * d1.len()`
    /// values.
    pub fn read(&self, d0: Range<usize>, d1: Range<usize>) -> Result<Vec<f32>> {
        if d0.end > self.header.dim0 || d1.end > self.header.dim1 || d0.start > d0.end || d1.start > d1.end {
            return Err(StoreError::OutOfBounds(format!(
                "rows {:?} cols {:?} of {} x {} file {}",
                d0,
                d1,
                self.header.dim0,
                self.header.dim1,
                self.path.display()
            )));
        }

        let width = self.header.compression.value_width();
        let row_values = d1.len();
        let mut out = Vec::with_capacity(d0.len() * row_values);
        let mut row_bytes = vec![0u8; row_values * width];

        let mut file = self.file.lock().expect("store reader poisoned");
        for row in d0 {
            let cell = row * self.header.dim1 + d1.start;
            file.seek(SeekFrom::Start((HEADER_LEN + cell * width) as u64))?;
            file.read_exact(&mut row_bytes)?;
            decode_values(
                &row_bytes,
                self.header.compression,
                self.header.scale_factor,
                &mut out,
            );
        }
        Ok(out)
    }

    /// Read the whole array.
    pub fn read_all(&self) -> Result<Vec<f32>> {
        self.read(0..self.header.dim0, 0..self.header.dim1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreWriter;

    fn write_grid(path: &Path, dim0: usize, dim1: usize) {
        let data: Vec<f32> = (0..dim0 * dim1).map(|v| v as f32).collect();
        StoreWriter::new(dim0, dim1, 1, dim1)
            .write_all(path, Compression::Float32, 1.0, &data)
            .unwrap();
    }

    #[test]
    fn reads_sub_rectangle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.cst");
        write_grid(&path, 4, 5);

        let reader = StoreReader::open(&path).unwrap();
        // rows 1..3, cols 2..4
        let values = reader.read(1..3, 2..4).unwrap();
        assert_eq!(values, vec![7.0, 8.0, 12.0, 13.0]);
    }

    #[test]
    fn rejects_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.cst");
        write_grid(&path, 4, 5);

        let reader = StoreReader::open(&path).unwrap();
        assert!(matches!(
            reader.read(0..5, 0..5),
            Err(StoreError::OutOfBounds(_))
        ));
    }

    #[test]
    fn scaled_file_restores_quantized_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.cst");
        let data = vec![21.37, f32::NAN, -5.05, 0.0];
        StoreWriter::new(1, 4, 1, 4)
            .write_all(&path, Compression::ScaledInt16, 20.0, &data)
            .unwrap();

        let reader = StoreReader::open(&path).unwrap();
        let values = reader.read_all().unwrap();
        assert!((values[0] - 21.37).abs() <= 0.025);
        assert!(values[1].is_nan());
        assert!((values[2] + 5.05).abs() <= 0.025);
        assert_eq!(values[3], 0.0);
    }
}
