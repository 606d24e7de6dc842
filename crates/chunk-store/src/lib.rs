//! Chunked columnar storage for dense 2-D float arrays.
//!
//! Files hold a `dim0 x dim1` array of `f32` values behind a fixed-size
//! header. The writer is driven by a producer callback that is asked for
//! successive `dim0` row blocks in strictly increasing order, so arrays
//! far larger than memory can be written one location chunk at a time.
//! The reader addresses arbitrary `(dim0, dim1)` sub-rectangles without
//! loading the rest of the file.
//!
//! [`StoreSplitter`] sits on top of both and maintains a time-oriented
//! archive: one file per fixed-length time window, merged in place when
//! new data for a sub-range arrives.

mod error;
mod format;
mod reader;
mod splitter;
mod writer;

pub use error::StoreError;
pub use format::Compression;
pub use reader::StoreReader;
pub use splitter::StoreSplitter;
pub use writer::StoreWriter;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
