//! Publishes ACS profile attributes for US Census Places as per-state,
//! GEOID-keyed JSON lookup files plus a run manifest.

pub mod census;
pub mod config;
pub mod error;
pub mod manifest;
pub mod normalize;
pub mod pipeline;
pub mod regions;
pub mod schema;
pub mod writer;

pub use census::{CensusClient, FetchedTable, HttpReply, ReqwestTransport, Transport};
pub use config::PipelineConfig;
pub use error::{ConfigError, FetchError, RegionError, RowError, WriteError};
pub use manifest::Manifest;
pub use pipeline::{process_region, run, PipelineContext, RegionOutcome, RegionResult, RunReport};
pub use regions::{Region, RegionCatalog};
