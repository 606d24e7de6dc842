//! Error types for the ingestion crate.

use thiserror::Error;

/// Errors that abort the current command.
///
/// Two upstream conditions are deliberately NOT errors: a reanalysis date
/// that is not yet published ([`crate::cds::RetrieveOutcome::NotAvailable`],
/// which truncates the effective range), and a missing raw input file
/// during assembly (the affected buffer slots stay at the missing
/// sentinel). Everything here propagates to a non-zero exit.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned status {status} for {url}")]
    Upstream { status: u16, url: String },

    #[error("Session deadline of {hours} h exhausted while fetching {url}")]
    DeadlineExceeded { hours: f64, url: String },

    #[error("Failed to decode GRIB data: {0}")]
    Decode(String),

    #[error("Grid is {actual_nx} x {actual_ny}, domain declares {expected_nx} x {expected_ny}")]
    MalformedGrid {
        expected_nx: usize,
        expected_ny: usize,
        actual_nx: usize,
        actual_ny: usize,
    },

    #[error("Reanalysis API request failed: {0}")]
    Api(String),

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Unknown domain '{0}'")]
    UnknownDomain(String),

    #[error("Invalid time interval '{0}', expected YYYYMMDD-YYYYMMDD")]
    InvalidTimeInterval(String),

    #[error("Missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("Invalid variable registry: {0}")]
    InvalidRegistry(String),

    #[error("Store error: {0}")]
    Store(#[from] chunk_store::StoreError),
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;
