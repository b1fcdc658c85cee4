//! Adaptive local file cache.
//!
//! Prefetches remote objects into a bounded local directory while records
//! are being decoded, and serves each object as one continuous byte stream:
//! the local prefix first, then a remote range read for whatever did not fit.
//!
//! All bookkeeping lives in a single [`State`] behind one lock. Downloads run
//! as spawned tasks and only touch the state to record progress and to
//! settle. Admission re-runs whenever budget or a download slot frees up.

mod admission;
mod entry;

pub use admission::{Decision, decide};
pub use entry::{CacheSnapshot, EntrySnapshot, EntryStatus};

use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt, future, stream};
use snowdrift_core::emit;
use snowdrift_core::metrics::events::{
    ActiveDownloads, CacheAdmitted, CacheBytesOnDisk, CacheDownloadCompleted, CacheReleased,
    EvictionReason, ReadMode, SourceOpened,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, SourceError};
use crate::source::{ByteStream, ObjectInfo, RemoteSourceRef};
use crate::stream::join_each;
use entry::{Entry, local_file_name};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

struct State {
    entries: Vec<Entry>,
    committed: u64,
    active: usize,
    bytes_on_disk: u64,
    shut_down: bool,
}

impl State {
    /// Give back an entry's budget and disk accounting.
    fn release(&mut self, index: usize) -> PathBuf {
        let entry = &mut self.entries[index];
        self.committed = self.committed.saturating_sub(entry.allocated);
        self.bytes_on_disk = self.bytes_on_disk.saturating_sub(entry.downloaded);
        entry.downloaded = 0;
        entry.local_path.clone()
    }
}

struct Inner {
    remote: RemoteSourceRef,
    config: CacheConfig,
    directory: PathBuf,
    owns_directory: bool,
    target: String,
    state: Mutex<State>,
    /// Bumped whenever readiness may have changed.
    progress: watch::Sender<u64>,
    shutdown: CancellationToken,
}

enum Segment {
    Local,
    Remote(Range<u64>),
}

/// Shared handle to a file cache.
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<Inner>,
}

impl FileCache {
    /// Create the cache directory. Without a configured directory a fresh one
    /// is made under the system temp dir and removed on shutdown.
    pub async fn new(
        remote: RemoteSourceRef,
        config: CacheConfig,
        target: impl Into<String>,
    ) -> Result<Self, CacheError> {
        let target = target.into();
        let (directory, owns_directory) = match &config.directory {
            Some(directory) => (directory.clone(), false),
            None => {
                let id = NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed);
                let name = format!("snowdrift-{}-{id}", std::process::id());
                (std::env::temp_dir().join(name), true)
            }
        };
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|source| CacheError::CreateDir {
                path: directory.clone(),
                source,
            })?;
        debug!(target = %target, "Cache directory {}", directory.display());

        Ok(Self {
            inner: Arc::new(Inner {
                remote,
                config,
                directory,
                owns_directory,
                target,
                state: Mutex::new(State {
                    entries: Vec::new(),
                    committed: 0,
                    active: 0,
                    bytes_on_disk: 0,
                    shut_down: false,
                }),
                progress: watch::channel(0).0,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Probe every object, start admitting, and wait until the cache is
    /// ready or the init timeout passes.
    ///
    /// Entry `i` corresponds to `urls[i]`. Call once.
    pub async fn initialize(&self, urls: Vec<String>) {
        let inner = &self.inner;
        let probes: Vec<(usize, String, Result<ObjectInfo, SourceError>)> =
            stream::iter(urls.into_iter().enumerate())
                .map(|(index, url)| {
                    let remote = inner.remote.clone();
                    async move {
                        let probe = remote.probe(&url).await;
                        (index, url, probe)
                    }
                })
                .buffered(inner.config.probe_concurrency.max(1))
                .collect()
                .await;

        {
            let mut state = inner.state.lock().await;
            for (index, url, probe) in probes {
                let path = inner.directory.join(local_file_name(index, &url));
                let mut entry = Entry::new(url, path, inner.shutdown.child_token());
                match probe {
                    Ok(info) => entry.total_size = info.content_length,
                    Err(e) => {
                        warn!(target = %inner.target, "Probe failed, {} will be read directly: {e}", entry.url);
                        entry.status = EntryStatus::Evicted;
                        entry.settle();
                        emit!(CacheReleased {
                            reason: EvictionReason::ProbeFailed,
                            target: inner.target.clone(),
                        });
                    }
                }
                state.entries.push(entry);
            }
        }

        self.admit().await;

        let timeout = inner.config.init_timeout();
        match tokio::time::timeout(timeout, self.ready()).await {
            Ok(()) => debug!(target = %inner.target, "Cache ready"),
            Err(_) => info!(
                target = %inner.target,
                "Cache not ready after {timeout:?}, starting with downloads in flight"
            ),
        }
    }

    /// Resolves once no download is running or enough bytes are on disk.
    async fn ready(&self) {
        let inner = &self.inner;
        let threshold = (inner.config.disk_budget_bytes as f64 * inner.config.ready_fraction) as u64;
        let mut progress = inner.progress.subscribe();
        loop {
            {
                let state = inner.state.lock().await;
                if state.active == 0 || state.bytes_on_disk >= threshold {
                    return;
                }
            }
            if progress.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start downloads for waiting entries while slots and budget allow.
    async fn admit(&self) {
        let inner = &self.inner;
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        if state.shut_down {
            return;
        }

        let slots = inner.config.max_parallel_downloads.max(1);
        while state.active < slots {
            let Some(index) = state
                .entries
                .iter()
                .position(|e| e.status == EntryStatus::Waiting)
            else {
                break;
            };

            let remaining = inner.config.disk_budget_bytes.saturating_sub(state.committed);
            let entry = &mut state.entries[index];
            match decide(entry.total_size, remaining, inner.config.min_truncation_bytes) {
                Decision::Skip => {
                    debug!(target = %inner.target, "Skipping empty object {}", entry.url);
                    entry.status = EntryStatus::Skipped;
                    entry.settle();
                }
                Decision::Stop => break,
                Decision::Admit { allocated } => {
                    entry.allocated = allocated;
                    entry.status = EntryStatus::Downloading;
                    entry.started = Some(std::time::Instant::now());
                    emit!(CacheAdmitted {
                        bytes: allocated,
                        truncated: allocated < entry.total_size,
                        target: inner.target.clone(),
                    });
                    debug!(
                        target = %inner.target,
                        "Admitted {} ({allocated} of {} bytes)",
                        entry.url,
                        entry.total_size
                    );
                    tokio::spawn(self.clone().download(
                        index,
                        entry.url.clone(),
                        entry.local_path.clone(),
                        allocated,
                        entry.stop.clone(),
                    ));
                    state.committed += allocated;
                    state.active += 1;
                }
            }
        }

        emit!(ActiveDownloads {
            count: state.active,
            target: inner.target.clone(),
        });
    }

    fn download(
        self,
        index: usize,
        url: String,
        path: PathBuf,
        allocated: u64,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        async move {
            let outcome = self.fetch_prefix(index, &url, &path, allocated, &stop).await;

            let evicted = {
                let mut state = self.inner.state.lock().await;
                state.active = state.active.saturating_sub(1);
                match outcome {
                    Ok(written) => {
                        let entry = &mut state.entries[index];
                        entry.status = EntryStatus::Finished;
                        entry.settle();
                        if let Some(started) = entry.started {
                            emit!(CacheDownloadCompleted {
                                duration: started.elapsed(),
                                target: self.inner.target.clone(),
                            });
                        }
                        debug!(target = %self.inner.target, "Cached {written} bytes of {url}");
                        None
                    }
                    Err(e) => {
                        warn!(target = %self.inner.target, "Cache download failed, {url} will be read directly: {e}");
                        let path = state.release(index);
                        let entry = &mut state.entries[index];
                        entry.status = EntryStatus::Evicted;
                        entry.settle();
                        emit!(CacheReleased {
                            reason: EvictionReason::DownloadFailed,
                            target: self.inner.target.clone(),
                        });
                        Some(path)
                    }
                }
            };

            if let Some(path) = evicted {
                remove_local(&path).await;
            }
            self.bump();
            self.admit().await;
        }
        .boxed()
    }

    /// Copy the first `allocated` bytes of `url` to `path`. Stopping early
    /// keeps whatever has been written.
    async fn fetch_prefix(
        &self,
        index: usize,
        url: &str,
        path: &Path,
        allocated: u64,
        stop: &CancellationToken,
    ) -> Result<u64, SourceError> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(local_io(url, path))?;

        let mut body = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(0),
            body = self.inner.remote.open_range(url, 0..allocated) => body?,
        };

        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk.transpose()? else {
                break;
            };
            file.write_all(&chunk).await.map_err(local_io(url, path))?;
            written += chunk.len() as u64;
            self.record_progress(index, chunk.len() as u64).await;
        }
        file.flush().await.map_err(local_io(url, path))?;
        Ok(written)
    }

    async fn record_progress(&self, index: usize, bytes: u64) {
        let mut state = self.inner.state.lock().await;
        state.entries[index].downloaded += bytes;
        state.bytes_on_disk += bytes;
        emit!(CacheBytesOnDisk {
            bytes: state.bytes_on_disk,
            target: self.inner.target.clone(),
        });
        drop(state);
        self.bump();
    }

    fn bump(&self) {
        self.inner.progress.send_modify(|version| *version += 1);
    }

    /// Open entry `index` for reading.
    ///
    /// A download still in flight is stopped where it is. Objects that were
    /// never admitted, or whose local copy is not worth keeping, are read
    /// directly.
    pub async fn open(&self, index: usize) -> Result<ByteStream, SourceError> {
        let mut settled = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.entries.get_mut(index) else {
                return Err(SourceError::Cache {
                    url: format!("#{index}"),
                    source: CacheError::UnknownEntry { index },
                });
            };
            match entry.status {
                EntryStatus::Waiting => {
                    entry.status = EntryStatus::Bypassed;
                    entry.settle();
                    let url = entry.url.clone();
                    drop(state);
                    return self.direct(&url).await;
                }
                EntryStatus::Skipped
                | EntryStatus::Bypassed
                | EntryStatus::Evicted
                | EntryStatus::Reclaimed => {
                    let url = entry.url.clone();
                    drop(state);
                    return self.direct(&url).await;
                }
                EntryStatus::Downloading => {
                    entry.stop.cancel();
                    entry.settled.subscribe()
                }
                EntryStatus::Finished => entry.settled.subscribe(),
            }
        };
        // The sender lives as long as the entry.
        let _ = settled.wait_for(|done| *done).await;

        let (url, path, total, status) = {
            let state = self.inner.state.lock().await;
            let entry = &state.entries[index];
            (
                entry.url.clone(),
                entry.local_path.clone(),
                entry.total_size,
                entry.status,
            )
        };
        if status != EntryStatus::Finished {
            return self.direct(&url).await;
        }

        let local = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(local_io(&url, &path)(e)),
        };

        if local > total {
            self.discard(index, EntryStatus::Evicted, EvictionReason::DownloadFailed)
                .await;
            return Err(SourceError::Cache {
                url: url.clone(),
                source: CacheError::SizeMismatch { url, local, total },
            });
        }

        if local < total && local < self.inner.config.min_truncation_bytes {
            debug!(
                target = %self.inner.target,
                "Discarding {local} cached bytes of {url}, below truncation threshold"
            );
            self.discard(index, EntryStatus::Evicted, EvictionReason::TooSmall)
                .await;
            return self.direct(&url).await;
        }

        let mode = if local < total {
            ReadMode::Hybrid
        } else {
            ReadMode::Cached
        };
        emit!(SourceOpened {
            mode,
            target: self.inner.target.clone(),
        });

        let mut segments = vec![Segment::Local];
        if local < total {
            segments.push(Segment::Remote(local..total));
        }
        let cache = self.clone();
        Ok(join_each(segments, move |segment| {
            let cache = cache.clone();
            let url = url.clone();
            let path = path.clone();
            async move {
                match segment {
                    Segment::Local => cache.local_stream(index, url, path).await,
                    Segment::Remote(range) => cache.inner.remote.open_range(&url, range).await,
                }
            }
        }))
    }

    async fn direct(&self, url: &str) -> Result<ByteStream, SourceError> {
        emit!(SourceOpened {
            mode: ReadMode::Direct,
            target: self.inner.target.clone(),
        });
        self.inner.remote.open(url).await
    }

    /// Stream the local copy, reclaiming it once fully read.
    async fn local_stream(
        &self,
        index: usize,
        url: String,
        path: PathBuf,
    ) -> Result<ByteStream, SourceError> {
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(local_io(&url, &path))?;

        let body = ReaderStream::new(file)
            .map_ok(Some)
            .map_err(move |e| local_io(&url, &path)(e));
        let cache = self.clone();
        let release = stream::once(async move {
            cache
                .discard(index, EntryStatus::Reclaimed, EvictionReason::Consumed)
                .await;
            Ok(None)
        });

        Ok(body
            .chain(release)
            .try_filter_map(|chunk| future::ready(Ok(chunk)))
            .boxed())
    }

    /// Drop an entry's local copy and credit its budget.
    async fn discard(&self, index: usize, status: EntryStatus, reason: EvictionReason) {
        let path = {
            let mut state = self.inner.state.lock().await;
            if !state.entries[index].status.holds_budget() {
                return;
            }
            let path = state.release(index);
            state.entries[index].status = status;
            emit!(CacheBytesOnDisk {
                bytes: state.bytes_on_disk,
                target: self.inner.target.clone(),
            });
            path
        };
        remove_local(&path).await;
        emit!(CacheReleased {
            reason,
            target: self.inner.target.clone(),
        });
        self.bump();
        self.admit().await;
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        let state = self.inner.state.lock().await;
        CacheSnapshot {
            entries: state.entries.iter().map(Entry::snapshot).collect(),
            budget: self.inner.config.disk_budget_bytes,
            committed: state.committed,
            bytes_on_disk: state.bytes_on_disk,
            active_downloads: state.active,
        }
    }

    /// Stop all downloads and delete every local file.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let pending: Vec<watch::Receiver<bool>> = {
            let mut state = inner.state.lock().await;
            state.shut_down = true;
            state
                .entries
                .iter()
                .filter(|e| e.status == EntryStatus::Downloading)
                .map(|e| e.settled.subscribe())
                .collect()
        };
        inner.shutdown.cancel();
        for mut settled in pending {
            let _ = settled.wait_for(|done| *done).await;
        }

        let paths: Vec<PathBuf> = {
            let mut state = inner.state.lock().await;
            let holding: Vec<usize> = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status.holds_budget())
                .map(|(index, _)| index)
                .collect();
            holding
                .into_iter()
                .map(|index| {
                    let path = state.release(index);
                    state.entries[index].status = EntryStatus::Reclaimed;
                    path
                })
                .collect()
        };
        for path in &paths {
            remove_local(path).await;
        }

        if inner.owns_directory {
            match tokio::fs::remove_dir_all(&inner.directory).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    target = %inner.target,
                    "Failed to remove cache directory {}: {e}",
                    inner.directory.display()
                ),
            }
        }
        emit!(CacheBytesOnDisk {
            bytes: 0,
            target: inner.target.clone(),
        });
        info!(target = %inner.target, "Cache shut down, released {} files", paths.len());
    }
}

fn local_io<'a>(url: &'a str, path: &'a Path) -> impl FnOnce(io::Error) -> SourceError + 'a {
    move |source| SourceError::Cache {
        url: url.to_string(),
        source: CacheError::LocalIo {
            path: path.to_path_buf(),
            source,
        },
    }
}

async fn remove_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove cached file {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{RemoteSource, StorageRemote};
    use async_trait::async_trait;
    use bytes::Bytes;
    use object_store::ObjectStore;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use snowdrift_core::StorageProvider;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Storage-backed remote that can stall or fail range reads.
    struct TestRemote {
        inner: StorageRemote,
        stall_ranges: bool,
        fail_ranges: Vec<String>,
    }

    #[async_trait]
    impl RemoteSource for TestRemote {
        async fn probe(&self, url: &str) -> Result<ObjectInfo, SourceError> {
            self.inner.probe(url).await
        }

        async fn open_range(&self, url: &str, range: Range<u64>) -> Result<ByteStream, SourceError> {
            if self.fail_ranges.iter().any(|u| u == url) {
                let chunks: Vec<Result<Bytes, SourceError>> = vec![
                    Ok(Bytes::from_static(b"partial")),
                    Err(SourceError::Cache {
                        url: url.to_string(),
                        source: CacheError::UnknownEntry { index: 99 },
                    }),
                ];
                return Ok(stream::iter(chunks).boxed());
            }
            if self.stall_ranges && range.start == 0 {
                return Ok(stream::pending().boxed());
            }
            self.inner.open_range(url, range).await
        }

        async fn open(&self, url: &str) -> Result<ByteStream, SourceError> {
            self.inner.open(url).await
        }
    }

    async fn remote(objects: &[(&str, Vec<u8>)]) -> StorageRemote {
        let store = Arc::new(InMemory::new());
        for (path, body) in objects {
            store
                .put(&ObjectPath::from(*path), Bytes::from(body.clone()).into())
                .await
                .unwrap();
        }
        StorageRemote::new(
            Arc::new(StorageProvider::from_object_store(store, None)),
            "cache-test",
        )
    }

    fn body(size: usize, seed: u8) -> Vec<u8> {
        (0..size).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn config(dir: &TempDir, budget: u64, min_truncation: u64) -> CacheConfig {
        CacheConfig {
            directory: Some(dir.path().to_path_buf()),
            disk_budget_bytes: budget,
            min_truncation_bytes: min_truncation,
            max_parallel_downloads: 2,
            probe_concurrency: 4,
            ready_fraction: 1.0,
            init_timeout_ms: 5_000,
        }
    }

    async fn cache_over(remote: impl RemoteSource + 'static, config: CacheConfig) -> FileCache {
        FileCache::new(Arc::new(remote), config, "cache-test")
            .await
            .unwrap()
    }

    async fn read(cache: &FileCache, index: usize) -> Vec<u8> {
        let chunks: Vec<Bytes> = cache.open(index).await.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    fn statuses(snapshot: &CacheSnapshot) -> Vec<EntryStatus> {
        snapshot.entries.iter().map(|e| e.status).collect()
    }

    fn assert_budget(snapshot: &CacheSnapshot, min_truncation: u64) {
        let held: u64 = snapshot
            .entries
            .iter()
            .filter(|e| e.status.holds_budget())
            .map(|e| e.allocated_size)
            .sum();
        assert_eq!(held, snapshot.committed);
        assert!(snapshot.committed <= snapshot.budget);
        for entry in snapshot.entries.iter().filter(|e| e.status.holds_budget()) {
            assert!(
                entry.allocated_size == entry.total_size
                    || entry.allocated_size >= min_truncation,
                "{entry:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_fully_cached_objects_are_read_locally_and_reclaimed() {
        let dir = TempDir::new().unwrap();
        let (a, b) = (body(100, 1), body(200, 2));
        let remote = remote(&[("a", a.clone()), ("b", b.clone())]).await;
        let cache = cache_over(remote, config(&dir, 1_000, 50)).await;

        cache.initialize(vec!["a".into(), "b".into()]).await;
        let snapshot = cache.snapshot().await;
        assert_eq!(statuses(&snapshot), [EntryStatus::Finished, EntryStatus::Finished]);
        assert_eq!(snapshot.bytes_on_disk, 300);
        assert!(snapshot.entries[0].local_path.exists());

        assert_eq!(read(&cache, 0).await, a);
        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.entries[0].status, EntryStatus::Reclaimed);
        assert!(!snapshot.entries[0].local_path.exists());
        assert_eq!(snapshot.committed, 200);

        assert_eq!(read(&cache, 1).await, b);
        assert_eq!(cache.snapshot().await.committed, 0);
    }

    #[tokio::test]
    async fn test_object_too_large_for_budget_is_read_directly() {
        let dir = TempDir::new().unwrap();
        let big = body(10_000, 7);
        let remote = remote(&[("big", big.clone())]).await;
        let cache = cache_over(remote, config(&dir, 2_000, 5_000)).await;

        cache.initialize(vec!["big".into()]).await;
        let snapshot = cache.snapshot().await;
        assert_eq!(statuses(&snapshot), [EntryStatus::Waiting]);
        assert_eq!(snapshot.committed, 0);

        assert_eq!(read(&cache, 0).await, big);
        let snapshot = cache.snapshot().await;
        assert_eq!(statuses(&snapshot), [EntryStatus::Bypassed]);
        assert_eq!(snapshot.entries[0].downloaded, 0);
    }

    #[tokio::test]
    async fn test_truncated_entry_reads_local_prefix_then_remote_tail() {
        let dir = TempDir::new().unwrap();
        let data = body(1_000, 3);
        let remote = remote(&[("obj", data.clone())]).await;
        let cache = cache_over(remote, config(&dir, 600, 100)).await;

        cache.initialize(vec!["obj".into()]).await;
        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.entries[0].allocated_size, 600);
        assert_eq!(snapshot.entries[0].downloaded, 600);

        assert_eq!(read(&cache, 0).await, data);
        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.entries[0].status, EntryStatus::Reclaimed);
        assert_eq!(snapshot.committed, 0);
    }

    #[tokio::test]
    async fn test_blocked_head_holds_back_smaller_entries() {
        let dir = TempDir::new().unwrap();
        let objects = [
            ("first", body(800, 0)),
            ("second", body(300, 1)),
            ("third", body(100, 2)),
        ];
        let remote = remote(&objects).await;
        let cache = cache_over(remote, config(&dir, 1_000, 500)).await;

        cache
            .initialize(objects.iter().map(|(name, _)| name.to_string()).collect())
            .await;
        let snapshot = cache.snapshot().await;
        assert_eq!(
            statuses(&snapshot),
            [EntryStatus::Finished, EntryStatus::Waiting, EntryStatus::Waiting]
        );
        assert_budget(&snapshot, 500);

        assert_eq!(read(&cache, 0).await, objects[0].1);
        let snapshot = cache.snapshot().await;
        assert_budget(&snapshot, 500);
        for status in &statuses(&snapshot)[1..] {
            assert!(
                matches!(status, EntryStatus::Downloading | EntryStatus::Finished),
                "{status:?}"
            );
        }

        assert_eq!(read(&cache, 1).await, objects[1].1);
        assert_eq!(read(&cache, 2).await, objects[2].1);
        assert_budget(&cache.snapshot().await, 500);
    }

    #[tokio::test]
    async fn test_budget_invariant_while_draining() {
        let dir = TempDir::new().unwrap();
        let sizes = [700usize, 0, 250, 900, 40, 1_300, 310, 5];
        let objects: Vec<(String, Vec<u8>)> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| (format!("part-{i}"), body(*size, i as u8)))
            .collect();
        let refs: Vec<(&str, Vec<u8>)> =
            objects.iter().map(|(n, b)| (n.as_str(), b.clone())).collect();
        let remote = remote(&refs).await;
        let cache = cache_over(remote, config(&dir, 1_000, 300)).await;

        cache
            .initialize(objects.iter().map(|(n, _)| n.clone()).collect())
            .await;
        assert_eq!(cache.snapshot().await.entries[1].status, EntryStatus::Skipped);

        for (index, (_, expected)) in objects.iter().enumerate() {
            assert_budget(&cache.snapshot().await, 300);
            assert_eq!(&read(&cache, index).await, expected, "object {index}");
        }
        let snapshot = cache.snapshot().await;
        assert_budget(&snapshot, 300);
        assert_eq!(snapshot.committed, 0);
        assert_eq!(snapshot.bytes_on_disk, 0);
    }

    #[tokio::test]
    async fn test_failed_download_is_evicted_and_read_directly() {
        let dir = TempDir::new().unwrap();
        let (good, bad) = (body(100, 1), body(100, 2));
        let remote = TestRemote {
            inner: remote(&[("good", good.clone()), ("bad", bad.clone())]).await,
            stall_ranges: false,
            fail_ranges: vec!["bad".into()],
        };
        let cache = cache_over(remote, config(&dir, 1_000, 10)).await;

        cache.initialize(vec!["bad".into(), "good".into()]).await;
        let snapshot = cache.snapshot().await;
        assert_eq!(
            statuses(&snapshot),
            [EntryStatus::Evicted, EntryStatus::Finished]
        );
        assert_eq!(snapshot.committed, 100);
        assert!(!snapshot.entries[0].local_path.exists());

        assert_eq!(read(&cache, 0).await, bad);
        assert_eq!(read(&cache, 1).await, good);
    }

    #[tokio::test]
    async fn test_probe_failure_falls_back_to_direct_read() {
        let dir = TempDir::new().unwrap();
        let remote = remote(&[("present", body(10, 0))]).await;
        let cache = cache_over(remote, config(&dir, 1_000, 10)).await;

        cache
            .initialize(vec!["missing".into(), "present".into()])
            .await;
        assert_eq!(
            statuses(&cache.snapshot().await),
            [EntryStatus::Evicted, EntryStatus::Finished]
        );

        let err = match cache.open(0).await {
            Ok(_) => panic!("missing object opened"),
            Err(e) => e,
        };
        assert!(matches!(err, SourceError::Remote { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_local_copy_larger_than_object_is_fatal() {
        let dir = TempDir::new().unwrap();
        let remote = remote(&[("obj", body(50, 0))]).await;
        let cache = cache_over(remote, config(&dir, 1_000, 10)).await;
        cache.initialize(vec!["obj".into()]).await;

        let path = cache.snapshot().await.entries[0].local_path.clone();
        let mut corrupted = std::fs::read(&path).unwrap();
        corrupted.extend_from_slice(b"trailing garbage");
        std::fs::write(&path, corrupted).unwrap();

        let err = match cache.open(0).await {
            Ok(_) => panic!("corrupted copy opened"),
            Err(e) => e,
        };
        assert!(
            matches!(
                err,
                SourceError::Cache {
                    source: CacheError::SizeMismatch {
                        local: 66,
                        total: 50,
                        ..
                    },
                    ..
                }
            ),
            "{err}"
        );
        assert_eq!(cache.snapshot().await.committed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_download_times_out_and_is_stopped_on_read() {
        let dir = TempDir::new().unwrap();
        let data = body(400, 9);
        let remote = TestRemote {
            inner: remote(&[("slow", data.clone())]).await,
            stall_ranges: true,
            fail_ranges: Vec::new(),
        };
        let mut config = config(&dir, 1_000, 100);
        config.init_timeout_ms = 250;
        let cache = cache_over(remote, config).await;

        let started = tokio::time::Instant::now();
        cache.initialize(vec!["slow".into()]).await;
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(
            statuses(&cache.snapshot().await),
            [EntryStatus::Downloading]
        );

        // Nothing arrived, so the empty local copy is discarded.
        assert_eq!(read(&cache, 0).await, data);
        let snapshot = cache.snapshot().await;
        assert_eq!(statuses(&snapshot), [EntryStatus::Evicted]);
        assert_eq!(snapshot.committed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_removes_owned_directory() {
        let remote = remote(&[("a", body(64, 0))]).await;
        let config = CacheConfig {
            disk_budget_bytes: 1_000,
            min_truncation_bytes: 10,
            ..Default::default()
        };
        let cache = cache_over(remote, config).await;
        cache.initialize(vec!["a".into()]).await;
        assert!(cache.directory().exists());

        cache.shutdown().await;
        assert!(!cache.directory().exists());
        let snapshot = cache.snapshot().await;
        assert_eq!(statuses(&snapshot), [EntryStatus::Reclaimed]);
        assert_eq!(snapshot.committed, 0);
    }

    #[tokio::test]
    async fn test_unknown_index() {
        let dir = TempDir::new().unwrap();
        let cache = cache_over(remote(&[]).await, config(&dir, 10, 1)).await;
        cache.initialize(Vec::new()).await;
        assert!(matches!(
            cache.open(3).await,
            Err(SourceError::Cache {
                source: CacheError::UnknownEntry { index: 3 },
                ..
            })
        ));
    }
}
