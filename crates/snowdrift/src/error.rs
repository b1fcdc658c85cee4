//! Error types for the snowdrift engine.
//!
//! Each stage has its own enum. [`PipelineError`] wraps them at the top and
//! [`PipelineFailure`] pairs that error with the parameters that were in
//! effect when it happened.

use std::collections::BTreeMap;
use std::fmt;

use snafu::prelude::*;

pub use snowdrift_core::error::{ConfigError, StorageError};

/// Errors raised while decoding the binary event-stream framing.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FrameError {
    /// The prelude announces lengths that cannot describe a message.
    #[snafu(display(
        "Invalid message prelude: total length {total_length} cannot hold {header_length} header bytes"
    ))]
    InvalidPrelude {
        total_length: u32,
        header_length: u32,
    },

    /// A header entry runs past the end of the header block.
    #[snafu(display("Header entry at offset {offset} overruns the header block"))]
    HeaderOverrun { offset: usize },

    /// A header name or value is not UTF-8.
    #[snafu(display("Header at offset {offset} is not valid UTF-8"))]
    HeaderEncoding { offset: usize },

    /// The service sent an `error` message.
    #[snafu(display(
        "Remote error {}: {}",
        headers.get(":error-code").map(String::as_str).unwrap_or("unknown"),
        headers.get(":error-message").map(String::as_str).unwrap_or("no message")
    ))]
    RemoteMessage { headers: BTreeMap<String, String> },

    /// The stream ended without an `End` or `error` message.
    #[snafu(display("Stream ended without terminal message"))]
    MissingTerminal,

    /// The stream ended in the middle of a message.
    #[snafu(display("Stream ended mid-message with {buffered} bytes buffered"))]
    Truncated { buffered: usize },

    /// IO error from an underlying reader.
    #[snafu(display("Frame IO error: {source}"))]
    FrameIo { source: std::io::Error },
}

impl From<std::io::Error> for FrameError {
    fn from(source: std::io::Error) -> Self {
        FrameError::FrameIo { source }
    }
}

/// Errors raised while turning lines into records.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    /// A line is not valid UTF-8.
    #[snafu(display("Line is not valid UTF-8: {source}"))]
    InvalidUtf8 { source: std::string::FromUtf8Error },

    /// A line could not be parsed as JSON.
    #[snafu(display("Invalid JSON line: {source}"))]
    InvalidJson { source: serde_json::Error },

    /// A delimited line has fewer fields than declared columns.
    #[snafu(display("Expected {expected} fields, found {found}"))]
    ColumnCount { expected: usize, found: usize },
}

/// Errors raised by the local file cache.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheError {
    /// The cache directory could not be created.
    #[snafu(display("Failed to create cache directory {}: {source}", path.display()))]
    CreateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Reading or writing a cached file failed.
    #[snafu(display("Cache file IO failed for {}: {source}", path.display()))]
    LocalIo {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// The local copy is larger than the remote object.
    #[snafu(display("Cached copy of {url} holds {local} bytes but the object has {total}"))]
    SizeMismatch { url: String, local: u64, total: u64 },

    /// No entry was registered at this position.
    #[snafu(display("No cache entry at index {index}"))]
    UnknownEntry { index: usize },
}

/// Errors raised while producing a source's byte or record stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The remote store rejected a probe or read.
    #[snafu(display("Failed to read {url}: {source}"))]
    Remote { url: String, source: StorageError },

    /// Decompression failed.
    #[snafu(display("Failed to decompress {url}: {source}"))]
    Decompress {
        url: String,
        source: std::io::Error,
    },

    /// Event-stream framing failed.
    #[snafu(display("Malformed event stream from {url}: {source}"))]
    Frame { url: String, source: FrameError },

    /// Record decoding failed.
    #[snafu(display("Failed to decode records from {url}: {source}"))]
    Decode { url: String, source: DecodeError },

    /// The cache could not serve the source.
    #[snafu(display("Cache failure for {url}: {source}"))]
    Cache { url: String, source: CacheError },
}

impl SourceError {
    /// URL of the source the error came from.
    pub fn url(&self) -> &str {
        match self {
            SourceError::Remote { url, .. }
            | SourceError::Decompress { url, .. }
            | SourceError::Frame { url, .. }
            | SourceError::Decode { url, .. }
            | SourceError::Cache { url, .. } => url,
        }
    }

    fn stage(&self) -> Stage {
        match self {
            SourceError::Remote { .. } => Stage::Input,
            SourceError::Cache { .. } => Stage::Cache,
            SourceError::Decompress { .. }
            | SourceError::Frame { .. }
            | SourceError::Decode { .. } => Stage::Decode,
        }
    }
}

/// Errors raised by a transform in the filter stage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// Projection was asked to pick columns out of a non-object value.
    #[snafu(display("Cannot project columns out of a {kind} record"))]
    NotProjectable { kind: &'static str },
}

/// Errors raised by output sinks.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// A consume operation failed.
    #[snafu(display("Consume failed: {message}"))]
    Consume { message: String },

    /// The upload collaborator failed.
    #[snafu(display("Upload to {destination} failed: {source}"))]
    Upload {
        destination: String,
        source: StorageError,
    },

    /// A record could not be serialised.
    #[snafu(display("Failed to serialise record: {source}"))]
    Serialize { source: serde_json::Error },

    /// The sink's internal channel closed before it finished.
    #[snafu(display("Sink channel closed unexpectedly"))]
    Closed,

    /// A sink task panicked or was cancelled.
    #[snafu(display("Sink task failed: {source}"))]
    SinkJoin { source: tokio::task::JoinError },
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage could not be set up.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Reading a source failed.
    #[snafu(display("{source}"))]
    Source { source: SourceError },

    /// Cache setup failed.
    #[snafu(display("Cache error: {source}"))]
    CacheSetup { source: CacheError },

    /// A transform rejected a batch.
    #[snafu(display("Transform error: {source}"))]
    Transform { source: TransformError },

    /// A sink failed.
    #[snafu(display("Sink '{sink}' failed: {source}"))]
    Sink { sink: String, source: SinkError },

    /// A pipeline task panicked or was cancelled.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Shutdown was requested before the pipeline drained.
    #[snafu(display("Pipeline cancelled"))]
    Cancelled,
}

impl PipelineError {
    /// The stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Config { .. } | PipelineError::Storage { .. } => Stage::Input,
            PipelineError::Source { source } => source.stage(),
            PipelineError::CacheSetup { .. } => Stage::Cache,
            PipelineError::Transform { .. } => Stage::Filter,
            PipelineError::Sink { .. } => Stage::Output,
            PipelineError::TaskJoin { .. } | PipelineError::Cancelled => Stage::Runtime,
        }
    }

    /// Source URL the error came from, where known.
    pub fn source_url(&self) -> Option<&str> {
        match self {
            PipelineError::Source { source } => Some(source.url()),
            _ => None,
        }
    }

    /// Sink name the error came from, where known.
    pub fn sink_name(&self) -> Option<&str> {
        match self {
            PipelineError::Sink { sink, .. } => Some(sink),
            _ => None,
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(source: SourceError) -> Self {
        PipelineError::Source { source }
    }
}

impl From<TransformError> for PipelineError {
    fn from(source: TransformError) -> Self {
        PipelineError::Transform { source }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

/// Logical stage of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Cache,
    Decode,
    Filter,
    Output,
    Runtime,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Cache => "cache",
            Stage::Decode => "decode",
            Stage::Filter => "filter",
            Stage::Output => "output",
            Stage::Runtime => "runtime",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters in effect when a pipeline failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureParams {
    pub pipeline: String,
    pub stage: Stage,
    pub source: Option<String>,
    pub sink: Option<String>,
    pub sources: usize,
}

/// Structured failure returned by [`crate::pipeline::run_pipeline`].
#[derive(Debug)]
pub struct PipelineFailure {
    pub params: FailureParams,
    pub error: PipelineError,
}

impl PipelineFailure {
    pub fn new(pipeline: &str, sources: usize, error: PipelineError) -> Self {
        let params = FailureParams {
            pipeline: pipeline.to_string(),
            stage: error.stage(),
            source: error.source_url().map(str::to_string),
            sink: error.sink_name().map(str::to_string),
            sources,
        };
        Self { params, error }
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pipeline '{}' failed in {} stage",
            self.params.pipeline, self.params.stage
        )?;
        if let Some(source) = &self.params.source {
            write!(f, " (source {source})")?;
        }
        if let Some(sink) = &self.params.sink {
            write!(f, " (sink {sink})")?;
        }
        write!(f, ": {}", self.error)
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_params_from_decode_error() {
        let error = PipelineError::Source {
            source: SourceError::Frame {
                url: "exports/part-1".into(),
                source: FrameError::MissingTerminal,
            },
        };
        let failure = PipelineFailure::new("inventory", 3, error);

        assert_eq!(failure.params.stage, Stage::Decode);
        assert_eq!(failure.params.source.as_deref(), Some("exports/part-1"));
        assert_eq!(failure.params.sources, 3);
        assert!(failure.to_string().contains("decode stage"));
    }

    #[test]
    fn test_remote_frame_error_display() {
        let headers = BTreeMap::from([
            (":message-type".to_string(), "error".to_string()),
            (":error-code".to_string(), "Throttled".to_string()),
            (":error-message".to_string(), "slow down".to_string()),
        ]);
        let err = FrameError::RemoteMessage { headers };
        assert_eq!(err.to_string(), "Remote error Throttled: slow down");
    }

    #[test]
    fn test_sink_failure_records_sink_name() {
        let failure = PipelineFailure::new(
            "inventory",
            1,
            PipelineError::Sink {
                sink: "report".into(),
                source: SinkError::Closed,
            },
        );
        assert_eq!(failure.params.stage, Stage::Output);
        assert_eq!(failure.params.sink.as_deref(), Some("report"));
        assert_eq!(failure.params.source, None);
    }
}
