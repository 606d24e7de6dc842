//! Error types for the chunk store.

use thiserror::Error;

/// Errors that can occur while reading or writing store files.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a chunk-store file: {0}")]
    BadMagic(String),

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown compression code {0}")]
    UnknownCompression(u8),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Read range out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Producer returned {got} values at offset {offset}, expected a positive multiple of {dim1} covering at most {remaining} rows")]
    BadProducerBuffer {
        offset: usize,
        got: usize,
        dim1: usize,
        remaining: usize,
    },

    #[error("Scale factor must be positive, got {0}")]
    BadScaleFactor(f32),
}
