//! Cache entry bookkeeping.

use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Registered, no budget yet.
    Waiting,
    Downloading,
    /// Local copy is stable and may be read.
    Finished,
    /// Zero-length object, nothing to cache.
    Skipped,
    /// Read before it was admitted; served directly.
    Bypassed,
    /// Probe or download failed, or the partial copy was discarded.
    Evicted,
    /// Local copy consumed and deleted.
    Reclaimed,
}

impl EntryStatus {
    /// Whether the entry still holds budget.
    pub fn holds_budget(&self) -> bool {
        matches!(self, EntryStatus::Downloading | EntryStatus::Finished)
    }
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub url: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub allocated_size: u64,
    pub downloaded: u64,
    pub status: EntryStatus,
}

/// Point-in-time view of the whole cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub entries: Vec<EntrySnapshot>,
    pub budget: u64,
    pub committed: u64,
    pub bytes_on_disk: u64,
    pub active_downloads: usize,
}

pub(super) struct Entry {
    pub url: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub allocated: u64,
    pub downloaded: u64,
    pub status: EntryStatus,
    /// Flips to `true` once a download can no longer change the local copy.
    pub settled: watch::Sender<bool>,
    /// Stops the download early, keeping what was written.
    pub stop: CancellationToken,
    pub started: Option<Instant>,
}

impl Entry {
    pub fn new(url: String, local_path: PathBuf, stop: CancellationToken) -> Self {
        Self {
            url,
            local_path,
            total_size: 0,
            allocated: 0,
            downloaded: 0,
            status: EntryStatus::Waiting,
            settled: watch::channel(false).0,
            stop,
            started: None,
        }
    }

    pub fn settle(&self) {
        self.settled.send_replace(true);
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            url: self.url.clone(),
            local_path: self.local_path.clone(),
            total_size: self.total_size,
            allocated_size: self.allocated,
            downloaded: self.downloaded,
            status: self.status,
        }
    }
}

/// File name for the entry at `index`, kept readable for debugging.
pub(super) fn local_file_name(index: usize, url: &str) -> String {
    let tail = url.rsplit('/').find(|s| !s.is_empty()).unwrap_or("object");
    let clean: String = tail
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("{index:05}-{clean}")
}
