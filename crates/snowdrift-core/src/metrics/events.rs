//! Internal events for snowdrift metrics emission.
//!
//! Each struct is one measurable occurrence. Emitting it records the matching
//! Prometheus metric and a `trace!` line.
//!
//! ## Target labels
//!
//! Engine metrics carry a `target` label holding the pipeline name so several
//! pipelines in one process stay distinguishable.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Raw bytes pulled from a source (before decompression).
pub struct BytesRead {
    pub bytes: u64,
    pub target: String,
}

impl InternalEvent for BytesRead {
    fn emit(self) {
        trace!(bytes = self.bytes, target = %self.target, "Bytes read");
        counter!("snowdrift_bytes_read_total", "target" => self.target).increment(self.bytes);
    }
}

/// Records produced by the line decoder after the per-line predicate.
pub struct RecordsDecoded {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsDecoded {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records decoded");
        counter!("snowdrift_records_decoded_total", "target" => self.target).increment(self.count);
    }
}

/// Batches handed to the output fan-out.
pub struct BatchesEmitted {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for BatchesEmitted {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Batches emitted");
        counter!("snowdrift_batches_emitted_total", "target" => self.target).increment(self.count);
    }
}

/// Event-stream message blocks fully parsed.
pub struct FramesDecoded {
    pub count: u64,
}

impl InternalEvent for FramesDecoded {
    fn emit(self) {
        trace!(count = self.count, "Frames decoded");
        counter!("snowdrift_frames_decoded_total").increment(self.count);
    }
}

/// How a source's bytes were served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Straight from the remote store.
    Direct,
    /// Entirely from the local cache.
    Cached,
    /// Cached prefix followed by a remote range for the tail.
    Hybrid,
}

impl ReadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMode::Direct => "direct",
            ReadMode::Cached => "cached",
            ReadMode::Hybrid => "hybrid",
        }
    }
}

/// A source stream was opened.
pub struct SourceOpened {
    pub mode: ReadMode,
    pub target: String,
}

impl InternalEvent for SourceOpened {
    fn emit(self) {
        trace!(mode = self.mode.as_str(), target = %self.target, "Source opened");
        counter!("snowdrift_sources_opened_total", "mode" => self.mode.as_str(), "target" => self.target)
            .increment(1);
    }
}

/// A cache entry was granted disk budget.
pub struct CacheAdmitted {
    pub bytes: u64,
    pub truncated: bool,
    pub target: String,
}

impl InternalEvent for CacheAdmitted {
    fn emit(self) {
        let kind = if self.truncated { "truncated" } else { "full" };
        trace!(bytes = self.bytes, kind, target = %self.target, "Cache entry admitted");
        counter!("snowdrift_cache_admissions_total", "kind" => kind, "target" => self.target)
            .increment(1);
    }
}

/// Why a cache entry gave up its local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    ProbeFailed,
    DownloadFailed,
    TooSmall,
    Consumed,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::ProbeFailed => "probe_failed",
            EvictionReason::DownloadFailed => "download_failed",
            EvictionReason::TooSmall => "too_small",
            EvictionReason::Consumed => "consumed",
        }
    }
}

/// A cache entry released its reservation.
pub struct CacheReleased {
    pub reason: EvictionReason,
    pub target: String,
}

impl InternalEvent for CacheReleased {
    fn emit(self) {
        trace!(reason = self.reason.as_str(), target = %self.target, "Cache entry released");
        counter!("snowdrift_cache_releases_total", "reason" => self.reason.as_str(), "target" => self.target)
            .increment(1);
    }
}

/// Bytes currently held on local disk by the cache.
pub struct CacheBytesOnDisk {
    pub bytes: u64,
    pub target: String,
}

impl InternalEvent for CacheBytesOnDisk {
    fn emit(self) {
        trace!(bytes = self.bytes, target = %self.target, "Cache bytes on disk");
        gauge!("snowdrift_cache_bytes_on_disk", "target" => self.target).set(self.bytes as f64);
    }
}

/// Number of cache downloads in flight.
pub struct ActiveDownloads {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for ActiveDownloads {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Active downloads");
        gauge!("snowdrift_active_downloads", "target" => self.target).set(self.count as f64);
    }
}

/// A cache download reached a stable state.
pub struct CacheDownloadCompleted {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for CacheDownloadCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            target = %self.target,
            "Cache download completed"
        );
        histogram!("snowdrift_cache_download_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Tasks held by a queue sink (waiting + running).
pub struct QueueDepth {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for QueueDepth {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Queue depth");
        gauge!("snowdrift_queue_depth", "target" => self.target).set(self.count as f64);
    }
}

/// Consume operations currently running in a queue sink.
pub struct RunningConsumers {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for RunningConsumers {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Running consumers");
        gauge!("snowdrift_running_consumers", "target" => self.target).set(self.count as f64);
    }
}

/// Items released downstream by a rate gate.
pub struct GateReleased {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for GateReleased {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Gate released items");
        counter!("snowdrift_gate_released_total", "target" => self.target).increment(self.count);
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Copy)]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// A pipeline run settled.
pub struct PipelineCompleted {
    pub status: RunStatus,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for PipelineCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            target = %self.target,
            "Pipeline completed"
        );
        counter!("snowdrift_pipelines_completed_total", "status" => self.status.as_str(), "target" => self.target.clone())
            .increment(1);
        histogram!("snowdrift_pipeline_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage request events
// ============================================================================

/// Storage operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    Head,
    Get,
    GetRange,
    PutMultipart,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Head => "head",
            StorageOperation::Get => "get",
            StorageOperation::GetRange => "get_range",
            StorageOperation::PutMultipart => "put_multipart",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }

    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }
}

/// A storage request finished.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "snowdrift_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "snowdrift_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
