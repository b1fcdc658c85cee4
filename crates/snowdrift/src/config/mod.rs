//! Configuration for snowdrift pipelines.
//!
//! A config document holds the metrics endpoint and any number of named
//! pipelines. Several documents can be merged as long as pipeline names do
//! not collide.

mod scalar;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

pub use snowdrift_core::config::{
    CliArgs, ConfigPath, KB, MB, MetricsConfig, Mergeable, load_from_paths,
};

use snowdrift_core::error::{
    ConfigError, DuplicateComponentsSnafu, EmptyInputUrlSnafu, InvalidPatternSnafu,
    InvalidSettingSnafu, NoSinksSnafu, NoSourcesSnafu, YamlParseSnafu,
};

/// Compression applied to a source object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
    Zstd,
}

/// How a source object's body is framed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// The body is the data itself.
    #[default]
    Raw,
    /// The body is a binary event stream; only `Records` payloads are data.
    EventStream,
}

/// How a line becomes a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    #[default]
    Raw,
    Delimited,
    Json,
}

/// One remote object to read. Immutable once a pipeline starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Object path relative to the input root URL.
    pub url: String,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub framing: Framing,
    /// Candidate record delimiters, tried in order on every chunk.
    #[serde(default = "default_record_delimiters")]
    pub record_delimiters: Vec<String>,
    #[serde(default = "default_field_delimiter")]
    pub field_delimiter: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub extractor: ExtractorKind,
    /// Predicate applied while decoding, before the pipeline filter stage.
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

impl SourceDescriptor {
    /// A raw, uncompressed, newline-delimited source.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            compression: Compression::default(),
            framing: Framing::default(),
            record_delimiters: default_record_delimiters(),
            field_delimiter: default_field_delimiter(),
            columns: Vec::new(),
            extractor: ExtractorKind::default(),
            filter: None,
        }
    }
}

fn default_record_delimiters() -> Vec<String> {
    vec!["\n".to_string()]
}

fn default_field_delimiter() -> String {
    ",".to_string()
}

/// Adaptive local file cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory for cached files (default: a per-pipeline temp directory).
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_disk_budget")]
    pub disk_budget_bytes: u64,
    /// Smallest prefix worth caching when an object does not fit entirely.
    #[serde(default = "default_min_truncation")]
    pub min_truncation_bytes: u64,
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    /// Share of the budget on disk at which the cache counts as ready.
    #[serde(default = "default_ready_fraction")]
    pub ready_fraction: f64,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            disk_budget_bytes: default_disk_budget(),
            min_truncation_bytes: default_min_truncation(),
            max_parallel_downloads: default_max_parallel_downloads(),
            probe_concurrency: default_probe_concurrency(),
            ready_fraction: default_ready_fraction(),
            init_timeout_ms: default_init_timeout_ms(),
        }
    }
}

impl CacheConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

fn default_disk_budget() -> u64 {
    512 * MB
}

fn default_min_truncation() -> u64 {
    16 * MB
}

fn default_max_parallel_downloads() -> usize {
    4
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_ready_fraction() -> f64 {
    0.5
}

fn default_init_timeout_ms() -> u64 {
    10_000
}

/// Where records come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// Storage root URL that source paths are resolved against.
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

/// How conditions combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

/// Comparison applied to one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorConfig {
    Eq {
        #[serde(deserialize_with = "scalar::one")]
        value: String,
    },
    Neq {
        #[serde(deserialize_with = "scalar::one")]
        value: String,
    },
    Contains {
        #[serde(deserialize_with = "scalar::one")]
        value: String,
    },
    StartsWith {
        #[serde(deserialize_with = "scalar::one")]
        value: String,
    },
    EndsWith {
        #[serde(deserialize_with = "scalar::one")]
        value: String,
    },
    In {
        #[serde(deserialize_with = "scalar::many")]
        values: Vec<String>,
    },
    Range {
        #[serde(default, deserialize_with = "scalar::optional")]
        min: Option<String>,
        #[serde(default, deserialize_with = "scalar::optional")]
        max: Option<String>,
    },
    Matches {
        pattern: String,
    },
    Exists,
}

/// `column <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub column: String,
    #[serde(flatten)]
    pub op: OperatorConfig,
}

/// Filter stage settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
    /// Columns to keep, in output order.
    #[serde(default)]
    pub select: Vec<String>,
    /// Replace the output with a single record count at end of stream.
    #[serde(default)]
    pub count: bool,
}

/// Serialisation applied by upload sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Lines,
    Csv,
    Ndjson,
}

/// Bounded queue settings for a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Multipart upload part size in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            max_size: default_max_size(),
            part_size: default_part_size(),
        }
    }
}

fn default_parallel() -> usize {
    1
}

fn default_max_size() -> usize {
    16
}

fn default_part_size() -> usize {
    (8 * MB) as usize
}

/// Rate gate settings for a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    pub count_limit: usize,
    pub duration_ms: u64,
}

impl RateConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// One output destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Full object URL of the output file.
    pub url: String,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rate: Option<RateConfig>,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl SinkConfig {
    /// Name used in logs and failures.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// Where records go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Row written once to every sink before any data.
    #[serde(default)]
    pub header: Option<String>,
    pub sinks: Vec<SinkConfig>,
}

/// Configuration of a single pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    pub output: OutputConfig,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub pipelines: IndexMap<String, PipelineConfig>,
}

impl Config {
    /// Load and merge every file and directory named on the command line.
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        load_from_paths(paths)
    }

    /// Parse a single interpolated YAML document.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Validate every pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, pipeline) in &self.pipelines {
            pipeline.validate(name)?;
        }
        Ok(())
    }
}

impl Mergeable for Config {
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        Config::parse(contents)
    }

    fn merge(&mut self, other: Self) -> Result<(), ConfigError> {
        let keys: Vec<String> = other
            .pipelines
            .keys()
            .filter(|k| self.pipelines.contains_key(*k))
            .cloned()
            .collect();
        ensure!(keys.is_empty(), DuplicateComponentsSnafu { keys });

        self.metrics.merge_from(&other.metrics);
        self.pipelines.extend(other.pipelines);
        Ok(())
    }
}

impl PipelineConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self, pipeline: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| {
            InvalidSettingSnafu {
                pipeline,
                message,
            }
            .fail()
        };

        ensure!(!self.input.url.is_empty(), EmptyInputUrlSnafu { pipeline });
        ensure!(!self.input.sources.is_empty(), NoSourcesSnafu { pipeline });
        ensure!(!self.output.sinks.is_empty(), NoSinksSnafu { pipeline });

        for source in &self.input.sources {
            if source.record_delimiters.is_empty()
                || source.record_delimiters.iter().any(String::is_empty)
            {
                return invalid(format!("source '{}' needs non-empty record delimiters", source.url));
            }
            if source.extractor == ExtractorKind::Delimited && source.field_delimiter.is_empty() {
                return invalid(format!("source '{}' needs a field delimiter", source.url));
            }
            if let Some(filter) = &source.filter {
                filter.validate()?;
            }
        }

        if let Some(cache) = &self.input.cache {
            if !(cache.ready_fraction > 0.0 && cache.ready_fraction <= 1.0) {
                return invalid(format!(
                    "cache.ready_fraction must be in (0, 1], got {}",
                    cache.ready_fraction
                ));
            }
            if cache.max_parallel_downloads == 0 || cache.probe_concurrency == 0 {
                return invalid("cache download and probe concurrency must be >= 1".into());
            }
        }

        self.filter.validate()?;

        for sink in &self.output.sinks {
            if sink.queue.parallel == 0 {
                return invalid(format!("sink '{}': queue.parallel must be >= 1", sink.name()));
            }
            if sink.queue.max_size < sink.queue.parallel {
                return invalid(format!(
                    "sink '{}': queue.max_size ({}) must be >= queue.parallel ({})",
                    sink.name(),
                    sink.queue.max_size,
                    sink.queue.parallel
                ));
            }
            if sink.queue.part_size == 0 {
                return invalid(format!("sink '{}': queue.part_size must be > 0", sink.name()));
            }
            if let Some(rate) = &sink.rate
                && rate.count_limit == 0
            {
                return invalid(format!("sink '{}': rate.count_limit must be >= 1", sink.name()));
            }
        }
        Ok(())
    }
}

impl FilterConfig {
    pub fn is_passthrough(&self) -> bool {
        self.conditions.is_empty() && self.select.is_empty() && !self.count
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for condition in &self.conditions {
            if let OperatorConfig::Matches { pattern } = &condition.op {
                regex::Regex::new(pattern).context(InvalidPatternSnafu {
                    pattern: pattern.clone(),
                })?;
            }
        }
        Ok(())
    }
}
