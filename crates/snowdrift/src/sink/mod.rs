//! Output sinks.
//!
//! - `queue`: bounded queue with a pluggable consume operation
//! - `gate`: rate gate wrapping any sink
//! - `upload`: serialising consumer feeding an upload collaborator
//! - `format`: record encodings

mod format;
mod gate;
mod queue;
mod upload;

pub use format::RecordEncoder;
pub use gate::RateGate;
pub use queue::{Consume, QueueSink};
pub use upload::{StorageUploader, UploadBody, UploadConsumer, Uploader, UploaderRef};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::SinkConfig;
use crate::decode::{Batch, Record};
use crate::error::SinkError;

/// Destination for record batches.
///
/// `write` resolving is the sink's acknowledgement; a writer does not send
/// the next batch before that.
#[async_trait]
pub trait BatchSink: Send {
    async fn write(&mut self, batch: Batch) -> Result<(), SinkError>;

    /// Resolves once everything written has been fully handled.
    async fn finish(&mut self) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: BatchSink + ?Sized> BatchSink for Box<S> {
    async fn write(&mut self, batch: Batch) -> Result<(), SinkError> {
        (**self).write(batch).await
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        (**self).finish().await
    }
}

/// Keeps every record in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    batches: Arc<Mutex<usize>>,
    finished: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<Record> {
        self.records.lock().await.clone()
    }

    pub async fn batches(&self) -> usize {
        *self.batches.lock().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn write(&mut self, batch: Batch) -> Result<(), SinkError> {
        self.records.lock().await.extend(batch);
        *self.batches.lock().await += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Build the sink described by `config`: an upload queue, rate-gated when
/// a rate is set.
pub async fn from_config(
    config: &SinkConfig,
    target: &str,
) -> Result<Box<dyn BatchSink>, SinkError> {
    let queue = &config.queue;
    let (uploader, object) = StorageUploader::for_object_url(
        &config.url,
        config.storage_options.clone(),
        queue.part_size,
        queue.parallel.max(1),
    )
    .await?;
    let consumer = UploadConsumer::spawn(Arc::new(uploader), object, config.format, queue.max_size);
    // One object body: a single worker keeps it in write order, and
    // `parallel` goes to concurrent part uploads instead.
    let sink = QueueSink::new(consumer, 1, queue.max_size, target);

    Ok(match &config.rate {
        Some(rate) => Box::new(RateGate::new(sink, rate.count_limit, rate.window(), target)),
        None => Box::new(sink),
    })
}
