//! Multi-cloud storage abstraction.
//!
//! Provides a unified interface for reading and writing objects on S3, GCS,
//! Azure Blob Storage and the local filesystem. Every path handed to a
//! [`StorageProvider`] is relative to the key prefix of the URL it was built
//! from.

mod backends;
mod url_parser;

pub use backends::{AzureConfig, GcsConfig, LocalConfig, S3Config};
pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{GetOptions, GetRange, ObjectStore, PutPayload, WriteMultipart};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Stream of object bytes as served by the backend.
pub type ObjectStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Storage provider that abstracts over different cloud storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn record(operation: StorageOperation, start: Instant, status: RequestStatus) {
    emit!(StorageRequest {
        operation,
        status,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        Self::connect(BackendConfig::parse_url(url)?, options).await
    }

    /// Wrap an existing object store, e.g. `object_store::memory::InMemory`.
    pub fn from_object_store(object_store: Arc<dyn ObjectStore>, prefix: Option<Path>) -> Self {
        let canonical_url = match &prefix {
            Some(prefix) => format!("memory:///{prefix}"),
            None => "memory:///".to_string(),
        };
        Self {
            config: BackendConfig::Local(LocalConfig {
                path: String::new(),
                key: prefix,
            }),
            object_store,
            canonical_url,
            storage_options: HashMap::new(),
        }
    }

    /// Canonical URL of the storage root.
    pub fn url(&self) -> &str {
        &self.canonical_url
    }

    /// Storage options the provider was built with.
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Size in bytes of the object at `path`.
    pub async fn head(&self, path: &Path) -> Result<u64, StorageError> {
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(path)).await;
        record(StorageOperation::Head, start, RequestStatus::of(&result));
        Ok(result.context(ObjectStoreSnafu)?.size)
    }

    /// Stream the full contents of an object.
    pub async fn get_stream(&self, path: &Path) -> Result<ObjectStream, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;
        record(StorageOperation::Get, start, RequestStatus::of(&result));

        let stream = result.context(ObjectStoreSnafu)?.into_stream();
        Ok(stream.map_err(|source| StorageError::ObjectStore { source }).boxed())
    }

    /// Stream the bytes in `range` (end exclusive). An empty range yields an
    /// empty stream without contacting the backend.
    pub async fn get_range_stream(
        &self,
        path: &Path,
        range: Range<u64>,
    ) -> Result<ObjectStream, StorageError> {
        if range.start >= range.end {
            return Ok(futures::stream::empty().boxed());
        }

        let options = GetOptions {
            range: Some(GetRange::Bounded(range)),
            ..Default::default()
        };
        let start = Instant::now();
        let result = self
            .object_store
            .get_opts(&self.qualify_path(path), options)
            .await;
        record(StorageOperation::GetRange, start, RequestStatus::of(&result));

        let stream = result.context(ObjectStoreSnafu)?.into_stream();
        Ok(stream.map_err(|source| StorageError::ObjectStore { source }).boxed())
    }

    /// Read a whole object into memory.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let chunks: Vec<Bytes> = self.get_stream(path).await?.try_collect().await?;
        Ok(chunks.concat().into())
    }

    /// Write `bytes` to `path` in a single request.
    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.object_store
            .put(&self.qualify_path(path), PutPayload::from(bytes))
            .await
            .context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Upload a stream of chunks as a multipart object.
    ///
    /// Chunks are regrouped into parts of `part_size` bytes and at most
    /// `max_concurrent_parts` parts are in flight. Returns the total number of
    /// bytes written.
    pub async fn put_multipart_stream<S>(
        &self,
        path: &Path,
        mut chunks: S,
        part_size: usize,
        max_concurrent_parts: usize,
    ) -> Result<u64, StorageError>
    where
        S: Stream<Item = Bytes> + Send + Unpin,
    {
        let qualified = self.qualify_path(path).into_owned();
        let start = Instant::now();

        let upload = self
            .object_store
            .put_multipart(&qualified)
            .await
            .context(ObjectStoreSnafu)?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, part_size.max(1));

        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            if let Err(source) = writer.wait_for_capacity(max_concurrent_parts.max(1)).await {
                record(StorageOperation::PutMultipart, start, RequestStatus::Error);
                return Err(StorageError::ObjectStore { source });
            }
            written += chunk.len() as u64;
            writer.write(&chunk);
        }

        let result = writer.finish().await;
        record(StorageOperation::PutMultipart, start, RequestStatus::of(&result));
        result.context(ObjectStoreSnafu)?;

        debug!("Completed multipart upload of {written} bytes to {qualified}");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn memory_provider(prefix: Option<&str>) -> StorageProvider {
        StorageProvider::from_object_store(Arc::new(InMemory::new()), prefix.map(Path::from))
    }

    #[tokio::test]
    async fn test_local_provider_reads_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("exports/2024");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("part-0.csv"), b"a,b\n1,2\n").unwrap();

        let url = format!("{}/exports", temp_dir.path().display());
        let storage = StorageProvider::for_url_with_options(&url, HashMap::new())
            .await
            .unwrap();

        let path = Path::from("2024/part-0.csv");
        assert_eq!(storage.head(&path).await.unwrap(), 8);
        assert_eq!(storage.get(&path).await.unwrap().as_ref(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_range_stream_returns_slice() {
        let storage = memory_provider(Some("root"));
        let path = Path::from("data.txt");
        storage
            .put(&path, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let chunks: Vec<Bytes> = storage
            .get_range_stream(&path, 3..7)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"3456");
    }

    #[tokio::test]
    async fn test_empty_range_is_empty_stream() {
        let storage = memory_provider(None);
        let path = Path::from("missing.txt");

        let chunks: Vec<Bytes> = storage
            .get_range_stream(&path, 5..5)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_head_missing_is_not_found() {
        let storage = memory_provider(None);
        let err = storage.head(&Path::from("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_multipart_stream_concatenates_chunks() {
        let storage = memory_provider(Some("out"));
        let path = Path::from("result.ndjson");

        let chunks = futures::stream::iter(vec![
            Bytes::from_static(b"{\"a\":1}\n"),
            Bytes::from_static(b"{\"a\":2}\n"),
            Bytes::from_static(b"{\"a\":3}\n"),
        ]);
        let written = storage
            .put_multipart_stream(&path, chunks, 5, 2)
            .await
            .unwrap();

        assert_eq!(written, 24);
        assert_eq!(
            storage.get(&path).await.unwrap().as_ref(),
            b"{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n"
        );
    }
}
