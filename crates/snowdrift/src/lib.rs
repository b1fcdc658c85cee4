//! Snowdrift: streaming pipelines over object-storage exports.
//!
//! This crate handles:
//! - Reading ordered sequences of remote objects as one record stream
//! - Unframing binary event streams and decompressing gzip, bzip2 and zstd
//! - Splitting bytes into records and filtering them as they are decoded
//! - Staging upcoming objects on local disk within a byte budget
//! - Fanning records out to rate-limited, bounded upload queues

pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod stream;

// Re-export commonly used items
pub use config::{CliArgs, Config, PipelineConfig};
pub use error::{PipelineError, PipelineFailure};
pub use pipeline::{Pipeline, PipelineReport, run_pipeline, run_pipelines};

pub use snowdrift_core::{
    KB, MB, MetricsConfig, StorageProvider, StorageProviderRef, cancel_on_signal, init_metrics,
    init_tracing,
};
