pub mod config;
pub mod error;
pub mod ingestion;
pub mod normalize;
pub mod store;
pub mod validate;

pub use config::PipelineConfig;
pub use error::{FetchError, LoadError, PipelineError, Result};
pub use ingestion::{Pipeline, RunOptions, RunStatus, RunSummary};
