//! Pipeline orchestration.
//!
//! Read side (ordered joiner over sources, optionally cache-backed) feeds the
//! transform chain, whose output fans out to every sink. A header row, when
//! configured, reaches each sink before any data. The run resolves once the
//! read side and every sink have settled; the first failure anywhere fails
//! the whole run.

mod fanout;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use snowdrift_core::emit;
use snowdrift_core::metrics::events::{BatchesEmitted, PipelineCompleted, RecordsDecoded, RunStatus};
use tokio_util::sync::CancellationToken;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::FileCache;
use crate::config::{CacheConfig, Config, PipelineConfig, SourceDescriptor};
use crate::decode::{Batch, BatchStream, Record};
use crate::error::{ConfigError, PipelineError, PipelineFailure, SourceError};
use crate::filter::{RecordFilter, TransformChain};
use crate::sink::{self, BatchSink};
use crate::source::{RemoteSourceRef, StorageRemote, decode_source};
use crate::stream::join_each;
use fanout::Fanout;

/// Counters for a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub sources: usize,
    pub records_decoded: u64,
    pub records_emitted: u64,
    pub batches_emitted: u64,
    pub duration: Duration,
}

/// A pipeline with its collaborators in place.
pub struct Pipeline {
    name: String,
    sources: Vec<SourceDescriptor>,
    remote: RemoteSourceRef,
    cache: Option<CacheConfig>,
    transforms: TransformChain,
    header: Option<String>,
    sinks: Vec<(String, Box<dyn BatchSink>)>,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// A passthrough pipeline over `sources` with no sinks yet.
    pub fn new(
        name: impl Into<String>,
        sources: Vec<SourceDescriptor>,
        remote: RemoteSourceRef,
    ) -> Self {
        Self {
            name: name.into(),
            sources,
            remote,
            cache: None,
            transforms: TransformChain::passthrough(),
            header: None,
            sinks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_transforms(mut self, transforms: TransformChain) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_cache(mut self, cache: Option<CacheConfig>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_header(mut self, header: Option<String>) -> Self {
        self.header = header;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn add_sink(mut self, name: impl Into<String>, sink: Box<dyn BatchSink>) -> Self {
        self.sinks.push((name.into(), sink));
        self
    }

    pub async fn run(self) -> Result<PipelineReport, PipelineFailure> {
        let start = Instant::now();
        let name = self.name.clone();
        let sources = self.sources.len();
        info!(target = %name, "Starting pipeline over {sources} sources");

        let result = self.execute(start).await;
        let status = match &result {
            Ok(_) => RunStatus::Success,
            Err(_) => RunStatus::Failed,
        };
        emit!(PipelineCompleted {
            status,
            duration: start.elapsed(),
            target: name.clone(),
        });

        match result {
            Ok(report) => {
                info!(
                    target = %name,
                    records_decoded = report.records_decoded,
                    records_emitted = report.records_emitted,
                    batches = report.batches_emitted,
                    "Pipeline completed in {:?}",
                    report.duration
                );
                Ok(report)
            }
            Err(error) => Err(PipelineFailure::new(&name, sources, error)),
        }
    }

    async fn execute(self, start: Instant) -> Result<PipelineReport, PipelineError> {
        let Pipeline {
            name,
            sources,
            remote,
            cache,
            mut transforms,
            header,
            sinks,
            shutdown,
        } = self;

        let filters = sources
            .iter()
            .map(source_filter)
            .collect::<Result<Vec<_>, _>>()?;

        let cache = match cache {
            Some(config) => {
                let cache = FileCache::new(remote.clone(), config, name.clone())
                    .await
                    .map_err(|source| PipelineError::CacheSetup { source })?;
                cache
                    .initialize(sources.iter().map(|s| s.url.clone()).collect())
                    .await;
                Some(cache)
            }
            None => None,
        };

        let source_count = sources.len();
        let batches = read_side(
            Arc::new(sources),
            Arc::new(filters),
            remote,
            cache.clone(),
        );
        let fanout = Fanout::spawn(sinks);

        let read = pump(
            &name,
            batches,
            &mut transforms,
            header,
            &fanout,
            &shutdown,
        )
        .await;

        let result = match read {
            Ok(counters) => fanout.finish().await.map(|()| counters),
            Err(e) => {
                fanout.abort();
                Err(e)
            }
        };

        if let Some(cache) = cache {
            cache.shutdown().await;
        }

        let counters = result?;
        Ok(PipelineReport {
            sources: source_count,
            records_decoded: counters.records_decoded,
            records_emitted: counters.records_emitted,
            batches_emitted: counters.batches_emitted,
            duration: start.elapsed(),
        })
    }
}

#[derive(Default)]
struct Counters {
    records_decoded: u64,
    records_emitted: u64,
    batches_emitted: u64,
}

fn source_filter(source: &SourceDescriptor) -> Result<Option<Arc<RecordFilter>>, ConfigError> {
    match &source.filter {
        Some(config) => Ok(RecordFilter::from_config(config)?.map(Arc::new)),
        None => Ok(None),
    }
}

/// One ordered stream of batches over all sources, opened one at a time.
fn read_side(
    sources: Arc<Vec<SourceDescriptor>>,
    filters: Arc<Vec<Option<Arc<RecordFilter>>>>,
    remote: RemoteSourceRef,
    cache: Option<FileCache>,
) -> BatchStream {
    join_each(0..sources.len(), move |index| {
        let sources = sources.clone();
        let filters = filters.clone();
        let remote = remote.clone();
        let cache = cache.clone();
        async move {
            let source = &sources[index];
            debug!("Opening source {index}: {}", source.url);
            let bytes = match &cache {
                Some(cache) => cache.open(index).await?,
                None => remote.open(&source.url).await?,
            };
            Ok::<_, SourceError>(decode_source(source, bytes, filters[index].clone()))
        }
    })
}

/// Drive the read side into the fan-out until the sources are exhausted or
/// a sink stops taking batches.
async fn pump(
    name: &str,
    mut batches: BatchStream,
    transforms: &mut TransformChain,
    header: Option<String>,
    fanout: &Fanout,
    shutdown: &CancellationToken,
) -> Result<Counters, PipelineError> {
    let mut counters = Counters::default();

    if let Some(header) = header
        && !fanout.send(vec![Record::Line(header)]).await
    {
        return Ok(counters);
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                warn!(target = %name, "Shutdown requested, abandoning pipeline");
                return Err(PipelineError::Cancelled);
            }
            next = batches.next() => next,
        };
        let Some(batch) = next else {
            break;
        };

        let batch = batch?;
        counters.records_decoded += batch.len() as u64;
        emit!(RecordsDecoded {
            count: batch.len() as u64,
            target: name.to_string(),
        });

        let out = transforms.apply(batch)?;
        if out.is_empty() {
            continue;
        }
        if !emit_batch(name, out, fanout, &mut counters).await {
            debug!(target = %name, "A sink stopped taking batches");
            return Ok(counters);
        }
    }

    let tail = transforms.finish()?;
    if !tail.is_empty() {
        emit_batch(name, tail, fanout, &mut counters).await;
    }
    Ok(counters)
}

async fn emit_batch(
    name: &str,
    batch: Batch,
    fanout: &Fanout,
    counters: &mut Counters,
) -> bool {
    let records = batch.len() as u64;
    if !fanout.send(batch).await {
        return false;
    }
    counters.records_emitted += records;
    counters.batches_emitted += 1;
    emit!(BatchesEmitted {
        count: 1,
        target: name.to_string(),
    });
    true
}

/// Build and run the pipeline `name` from its configuration.
pub async fn run_pipeline(
    name: &str,
    config: &PipelineConfig,
    shutdown: CancellationToken,
) -> Result<PipelineReport, PipelineFailure> {
    let sources = config.input.sources.len();
    let fail = |error: PipelineError| PipelineFailure::new(name, sources, error);

    let remote = StorageRemote::connect(
        &config.input.url,
        config.input.storage_options.clone(),
        name,
    )
    .await
    .map_err(|source| fail(PipelineError::Storage { source }))?;
    let transforms =
        TransformChain::from_config(&config.filter).map_err(|e| fail(PipelineError::from(e)))?;

    let mut pipeline = Pipeline::new(name, config.input.sources.clone(), Arc::new(remote))
        .with_transforms(transforms)
        .with_cache(config.input.cache.clone())
        .with_header(config.output.header.clone())
        .with_shutdown(shutdown);

    for sink_config in &config.output.sinks {
        let sink = sink::from_config(sink_config, name)
            .await
            .map_err(|source| {
                fail(PipelineError::Sink {
                    sink: sink_config.name().to_string(),
                    source,
                })
            })?;
        pipeline = pipeline.add_sink(sink_config.name(), sink);
    }

    pipeline.run().await
}

/// Run every selected pipeline concurrently until all have settled.
///
/// Returns the number of pipelines that failed.
pub async fn run_pipelines(
    config: &Config,
    selects: impl Fn(&str) -> bool,
    shutdown: CancellationToken,
) -> usize {
    let mut handles = JoinSet::new();
    for (name, pipeline) in &config.pipelines {
        if !selects(name) {
            debug!(target = %name, "Pipeline not selected, skipping");
            continue;
        }
        let name = name.clone();
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        handles.spawn(async move { run_pipeline(&name, &pipeline, shutdown).await });
    }
    info!("Spawned {} pipeline tasks", handles.len());

    let mut failed = 0;
    while let Some(joined) = handles.join_next().await {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(failure)) => {
                error!(
                    target = %failure.params.pipeline,
                    stage = %failure.params.stage,
                    error = %failure.error,
                    "Pipeline failed"
                );
                failed += 1;
            }
            Err(e) => {
                error!(error = %e, "Pipeline task panicked");
                failed += 1;
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::error::{SinkError, Stage};
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use snowdrift_core::StorageProvider;

    async fn remote_with(objects: &[(&str, &str)]) -> RemoteSourceRef {
        let storage = StorageProvider::from_object_store(Arc::new(InMemory::new()), None);
        for (path, body) in objects {
            storage
                .put(&Path::from(*path), Bytes::from(body.to_string()))
                .await
                .unwrap();
        }
        Arc::new(StorageRemote::new(Arc::new(storage), "test"))
    }

    fn sources(urls: &[&str]) -> Vec<SourceDescriptor> {
        urls.iter().map(|url| SourceDescriptor::new(*url)).collect()
    }

    fn lines(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|record| record.get(crate::decode::LINE_COLUMN).unwrap().into_owned())
            .collect()
    }

    struct Failing;

    #[async_trait]
    impl BatchSink for Failing {
        async fn write(&mut self, _batch: Batch) -> Result<(), SinkError> {
            Err(SinkError::Consume {
                message: "disk full".into(),
            })
        }

        async fn finish(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_records_reach_every_sink_in_source_order() {
        let remote = remote_with(&[("a", "a\nb\n"), ("b", "c\n"), ("c", "d\ne\n")]).await;
        let first = MemorySink::new();
        let second = MemorySink::new();

        let report = Pipeline::new("test", sources(&["a", "b", "c"]), remote)
            .with_header(Some("letter".into()))
            .add_sink("first", Box::new(first.clone()))
            .add_sink("second", Box::new(second.clone()))
            .run()
            .await
            .unwrap();

        for sink in [&first, &second] {
            assert_eq!(
                lines(&sink.records().await),
                ["letter", "a", "b", "c", "d", "e"]
            );
            assert!(sink.is_finished());
        }
        assert_eq!(report.sources, 3);
        assert_eq!(report.records_decoded, 5);
        assert_eq!(report.records_emitted, 5);
    }

    #[tokio::test]
    async fn test_count_summary_is_sent_at_end() {
        let remote = remote_with(&[("a", "x\ny\n"), ("b", "z\n")]).await;
        let sink = MemorySink::new();
        let filter = FilterConfig {
            count: true,
            ..Default::default()
        };

        let report = Pipeline::new("test", sources(&["a", "b"]), remote)
            .with_transforms(TransformChain::from_config(&filter).unwrap())
            .add_sink("out", Box::new(sink.clone()))
            .run()
            .await
            .unwrap();

        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("records").as_deref(), Some("3"));
        assert_eq!(report.batches_emitted, 1);
    }

    #[tokio::test]
    async fn test_missing_source_fails_in_input_stage() {
        let remote = remote_with(&[("a", "a\n")]).await;
        let sink = MemorySink::new();

        let failure = Pipeline::new("test", sources(&["a", "missing"]), remote)
            .add_sink("out", Box::new(sink.clone()))
            .run()
            .await
            .unwrap_err();

        assert_eq!(failure.params.stage, Stage::Input);
        assert_eq!(failure.params.source.as_deref(), Some("missing"));
        assert_eq!(failure.params.sources, 2);
        assert!(!sink.is_finished());
    }

    #[tokio::test]
    async fn test_sink_failure_fails_the_run() {
        let remote = remote_with(&[("a", "a\nb\n"), ("b", "c\n")]).await;

        let failure = Pipeline::new("test", sources(&["a", "b"]), remote)
            .add_sink("healthy", Box::new(MemorySink::new()))
            .add_sink("broken", Box::new(Failing))
            .run()
            .await
            .unwrap_err();

        assert_eq!(failure.params.stage, Stage::Output);
        assert_eq!(failure.params.sink.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let remote = remote_with(&[("a", "a\n")]).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let failure = Pipeline::new("test", sources(&["a"]), remote)
            .add_sink("out", Box::new(MemorySink::new()))
            .with_shutdown(shutdown)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(failure.error, PipelineError::Cancelled));
        assert_eq!(failure.params.stage, Stage::Runtime);
    }

    #[tokio::test]
    async fn test_cached_read_matches_direct_read() {
        let objects = [("a", "one\ntwo\n"), ("b", "three\n"), ("c", "four\nfive\n")];
        let sink = MemorySink::new();
        let cache = CacheConfig {
            disk_budget_bytes: 12,
            min_truncation_bytes: 4,
            ..Default::default()
        };

        Pipeline::new("test", sources(&["a", "b", "c"]), remote_with(&objects).await)
            .with_cache(Some(cache))
            .add_sink("out", Box::new(sink.clone()))
            .run()
            .await
            .unwrap();

        assert_eq!(
            lines(&sink.records().await),
            ["one", "two", "three", "four", "five"]
        );
    }

    #[tokio::test]
    async fn test_run_without_sinks_drains_sources() {
        let remote = remote_with(&[("a", "a\nb\n")]).await;

        let report = Pipeline::new("test", sources(&["a"]), remote)
            .run()
            .await
            .unwrap();

        assert_eq!(report.records_decoded, 2);
    }
}
