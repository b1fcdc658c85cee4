//! Remote object access used by the joiner and the file cache.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::path::Path;
use snowdrift_core::emit;
use snowdrift_core::metrics::events::BytesRead;
use snowdrift_core::{ObjectStream, StorageProvider, StorageProviderRef};

use super::ByteStream;
use crate::error::{SourceError, StorageError};

/// Metadata returned by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub content_length: u64,
}

/// Read access to remote objects.
///
/// Retries and request signing are the implementor's business.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ObjectInfo, SourceError>;

    /// Bytes `range.start..range.end` of the object.
    async fn open_range(&self, url: &str, range: Range<u64>) -> Result<ByteStream, SourceError>;

    async fn open(&self, url: &str) -> Result<ByteStream, SourceError>;
}

pub type RemoteSourceRef = Arc<dyn RemoteSource>;

/// [`RemoteSource`] over a [`StorageProvider`]; source URLs are object paths
/// under the provider's root.
#[derive(Debug, Clone)]
pub struct StorageRemote {
    storage: StorageProviderRef,
    target: String,
}

impl StorageRemote {
    pub fn new(storage: StorageProviderRef, target: impl Into<String>) -> Self {
        Self {
            storage,
            target: target.into(),
        }
    }

    /// Connect to the storage root at `url`.
    pub async fn connect(
        url: &str,
        options: std::collections::HashMap<String, String>,
        target: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let storage = StorageProvider::for_url_with_options(url, options).await?;
        Ok(Self::new(Arc::new(storage), target))
    }

    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    fn counted(&self, url: &str, stream: ObjectStream) -> ByteStream {
        let url = url.to_string();
        let target = self.target.clone();
        stream
            .map(move |chunk| match chunk {
                Ok(bytes) => {
                    emit!(BytesRead {
                        bytes: bytes.len() as u64,
                        target: target.clone(),
                    });
                    Ok(bytes)
                }
                Err(source) => Err(SourceError::Remote {
                    url: url.clone(),
                    source,
                }),
            })
            .boxed()
    }
}

fn remote_error(url: &str) -> impl FnOnce(StorageError) -> SourceError + '_ {
    move |source| SourceError::Remote {
        url: url.to_string(),
        source,
    }
}

#[async_trait]
impl RemoteSource for StorageRemote {
    async fn probe(&self, url: &str) -> Result<ObjectInfo, SourceError> {
        let content_length = self
            .storage
            .head(&Path::from(url))
            .await
            .map_err(remote_error(url))?;
        Ok(ObjectInfo { content_length })
    }

    async fn open_range(&self, url: &str, range: Range<u64>) -> Result<ByteStream, SourceError> {
        let stream = self
            .storage
            .get_range_stream(&Path::from(url), range)
            .await
            .map_err(remote_error(url))?;
        Ok(self.counted(url, stream))
    }

    async fn open(&self, url: &str) -> Result<ByteStream, SourceError> {
        let stream = self
            .storage
            .get_stream(&Path::from(url))
            .await
            .map_err(remote_error(url))?;
        Ok(self.counted(url, stream))
    }
}
