//! Common error types shared by the snowdrift crates.
//!
//! Storage, configuration and metrics errors live here so both the engine
//! and the binary can report them without depending on each other.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors raised by the storage layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// The URL matches none of the supported backends.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// An object store request failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// Local filesystem IO failed.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// A cloud client could not be built from the URL and options.
    #[snafu(display("{backend} configuration error: {source}"))]
    BackendSetup {
        backend: &'static str,
        source: object_store::Error,
    },
}

impl StorageError {
    /// Whether the object (or local path) does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            StorageError::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Input URL is empty for a pipeline.
    #[snafu(display("Pipeline '{pipeline}' has empty input url"))]
    EmptyInputUrl { pipeline: String },

    /// Pipeline has no sources.
    #[snafu(display("Pipeline '{pipeline}' has no sources"))]
    NoSources { pipeline: String },

    /// Pipeline has no sinks.
    #[snafu(display("Pipeline '{pipeline}' has no output sinks"))]
    NoSinks { pipeline: String },

    /// A numeric setting is out of range.
    #[snafu(display("Pipeline '{pipeline}': {message}"))]
    InvalidSetting { pipeline: String, message: String },

    /// A filter pattern failed to compile.
    #[snafu(display("Invalid pattern '{pattern}': {source}"))]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Duplicate pipeline keys found across config files.
    #[snafu(display("Duplicate pipelines: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Failed to read configuration directory.
    #[snafu(display("Failed to read directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },
}
