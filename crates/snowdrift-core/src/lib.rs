//! snowdrift-core: shared plumbing for the snowdrift engine.
//!
//! - `storage/` - Multi-cloud storage abstraction (S3, GCS, Azure, local)
//! - `metrics/` - Prometheus metrics infrastructure and internal events
//! - `config/` - YAML loading, merging and environment variable interpolation
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber initialization
//! - `error` - Common error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod storage;
pub mod tracing;

pub use config::{CliArgs, KB, MB, MetricsConfig};
pub use error::{ConfigError, MetricsError, StorageError};
pub use metrics::{DEFAULT_METRICS_ADDR, init as init_metrics};
pub use signal::{cancel_on_signal, shutdown_signal};
pub use storage::{ObjectStream, StorageProvider, StorageProviderRef};
pub use self::tracing::init_tracing;
