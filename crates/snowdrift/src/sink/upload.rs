//! Upload sink: serialised batches streamed into one remote object.
//!
//! The consumer feeds encoded batches through a bounded channel into a
//! background task that owns the upload. `finalize` closes the channel and
//! waits for the upload to complete.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use object_store::path::Path;
use snowdrift_core::{StorageProvider, StorageProviderRef};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::format::RecordEncoder;
use super::queue::Consume;
use crate::config::OutputFormat;
use crate::decode::Batch;
use crate::error::{SinkError, StorageError};

/// Body of an upload.
pub type UploadBody = BoxStream<'static, Bytes>;

/// Writes a byte stream to a destination.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Returns the number of bytes written.
    async fn upload_from_stream(&self, destination: &str, body: UploadBody)
    -> Result<u64, SinkError>;
}

pub type UploaderRef = Arc<dyn Uploader>;

/// Multipart uploads into a storage root; destinations are object paths
/// under it.
pub struct StorageUploader {
    storage: StorageProviderRef,
    part_size: usize,
    max_concurrent_parts: usize,
}

impl StorageUploader {
    pub fn new(storage: StorageProviderRef, part_size: usize, max_concurrent_parts: usize) -> Self {
        Self {
            storage,
            part_size,
            max_concurrent_parts,
        }
    }

    /// Connect to the directory holding the object at `url`, returning the
    /// uploader and the object's file name.
    pub async fn for_object_url(
        url: &str,
        options: HashMap<String, String>,
        part_size: usize,
        max_concurrent_parts: usize,
    ) -> Result<(Self, String), SinkError> {
        let (root, name) = split_destination(url).ok_or_else(|| SinkError::Upload {
            destination: url.to_string(),
            source: StorageError::InvalidUrl {
                url: url.to_string(),
            },
        })?;
        let storage = StorageProvider::for_url_with_options(root, options)
            .await
            .map_err(|source| SinkError::Upload {
                destination: url.to_string(),
                source,
            })?;
        Ok((
            Self::new(Arc::new(storage), part_size, max_concurrent_parts),
            name.to_string(),
        ))
    }
}

#[async_trait]
impl Uploader for StorageUploader {
    async fn upload_from_stream(
        &self,
        destination: &str,
        body: UploadBody,
    ) -> Result<u64, SinkError> {
        self.storage
            .put_multipart_stream(
                &Path::from(destination),
                body,
                self.part_size,
                self.max_concurrent_parts,
            )
            .await
            .map_err(|source| SinkError::Upload {
                destination: format!("{}/{destination}", self.storage.url()),
                source,
            })
    }
}

/// Split `scheme://root/dir/name` into `(scheme://root/dir, name)`.
fn split_destination(url: &str) -> Option<(&str, &str)> {
    let (root, name) = url.rsplit_once('/')?;
    let bare_scheme = root.is_empty() || root.ends_with(':') || root.ends_with(":/");
    if bare_scheme || name.is_empty() {
        return None;
    }
    Some((root, name))
}

/// [`Consume`] that appends encoded batches to a single upload.
pub struct UploadConsumer {
    encoder: RecordEncoder,
    destination: String,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    task: Mutex<Option<JoinHandle<Result<u64, SinkError>>>>,
}

impl UploadConsumer {
    /// Start the upload task. `buffer` bounds encoded batches waiting for it.
    pub fn spawn(
        uploader: UploaderRef,
        destination: impl Into<String>,
        format: OutputFormat,
        buffer: usize,
    ) -> Self {
        let destination = destination.into();
        let (tx, rx) = mpsc::channel::<Bytes>(buffer.max(1));
        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed();

        let target = destination.clone();
        let task = tokio::spawn(async move { uploader.upload_from_stream(&target, body).await });

        Self {
            encoder: RecordEncoder::new(format),
            destination,
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// The upload task stopped taking data; report why.
    async fn upload_outcome(&self) -> Result<u64, SinkError> {
        let Some(task) = self.task.lock().await.take() else {
            return Err(SinkError::Closed);
        };
        task.await
            .map_err(|source| SinkError::SinkJoin { source })?
    }
}

#[async_trait]
impl Consume for UploadConsumer {
    async fn consume(&self, batch: Batch) -> Result<(), SinkError> {
        let chunk = self.encoder.encode(&batch)?;
        if chunk.is_empty() {
            return Ok(());
        }
        let tx = self.tx.lock().await.clone().ok_or(SinkError::Closed)?;
        if tx.send(chunk).await.is_err() {
            self.upload_outcome().await?;
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<(), SinkError> {
        drop(self.tx.lock().await.take());
        let written = self.upload_outcome().await?;
        info!("Uploaded {written} bytes to {}", self.destination);
        Ok(())
    }
}

impl Drop for UploadConsumer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            debug!("Abandoning upload to {}", self.destination);
            task.abort();
        }
    }
}
