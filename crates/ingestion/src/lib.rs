//! Weather model ingestion library.
//!
//! Downloads gridded NWP output from two upstream kinds, an API-gated
//! reanalysis archive (Copernicus CDS) and a directly-served forecast
//! feed (MSC Datamart), normalizes it into physical units, and
//! reassembles the scattered per-timestep grids into a time-oriented
//! chunked store.
//!
//! # Architecture
//!
//! - [`variables`]: registry of per-variable metadata, validated at startup
//! - [`normalize`]: unit scaling and grid orientation corrections
//! - [`elevation`]: one-time static terrain/landmask field per domain
//! - [`fetcher`]: per-timestep downloads with resumable-skip semantics
//! - [`assembler`]: streaming reassembly into (location x member x time)
//!   blocks under a fixed memory ceiling
//!
//! The GRIB decoder ([`decode`]), HTTP transport ([`fetch`]) and the
//! reanalysis API client ([`cds`]) sit behind traits so the pipeline is
//! testable without network access or real GRIB payloads.

pub mod assembler;
pub mod cds;
pub mod decode;
pub mod domain;
pub mod elevation;
pub mod error;
pub mod fetch;
pub mod fetcher;
pub mod normalize;
pub mod progress;
pub mod time;
pub mod variables;

// Re-exports
pub use assembler::{AssemblePlan, Block3d, RawSource};
pub use cds::{CdsClient, CdsRequest, ReanalysisApi, RetrieveOutcome};
pub use decode::{GribMessage, MessageDecode};
pub use domain::{Domain, Grid};
pub use error::{IngestError, Result};
pub use fetch::{Deadline, GridFetch, HttpFetcher};
pub use fetcher::DownloadedRange;
pub use time::TimeRange;
pub use variables::{Interpolation, Variable, VariableRegistry};
