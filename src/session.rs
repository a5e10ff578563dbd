//! Download sessions: one batch of entries downloaded into one directory,
//! with per-item outcomes that can be retried later.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    thread,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    media::{DownloadOutcome, OutputFormat, VideoEntry, unique_stems},
    ytdlp::Downloader,
};

pub const DEFAULT_PARALLEL_DOWNLOADS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub id: String,
    pub download_dir: PathBuf,
    pub format: OutputFormat,
    pub results: Vec<DownloadOutcome>,
    pub successful_count: usize,
    pub total_count: usize,
    pub created_at: DateTime<Utc>,
}

impl DownloadSession {
    pub fn new(
        id: impl Into<String>,
        download_dir: impl Into<PathBuf>,
        format: OutputFormat,
        results: Vec<DownloadOutcome>,
    ) -> Self {
        let mut session = Self {
            id: id.into(),
            download_dir: download_dir.into(),
            format,
            results,
            successful_count: 0,
            total_count: 0,
            created_at: Utc::now(),
        };
        session.recount();
        session
    }

    /// Replaces the outcome at `position` and refreshes the counters.
    pub fn splice(&mut self, position: usize, outcome: DownloadOutcome) -> Result<()> {
        let Some(slot) = self.results.get_mut(position) else {
            bail!(
                "position {position} is out of range for a session with {} results",
                self.results.len()
            );
        };
        *slot = outcome;
        self.recount();
        Ok(())
    }

    pub fn failed_positions(&self) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, outcome)| !outcome.success)
            .map(|(position, _)| position)
            .collect()
    }

    /// Entry and file stem the item at `position` was downloaded with.
    fn retry_target(&self, position: usize) -> Result<(VideoEntry, String)> {
        let Some(previous) = self.results.get(position) else {
            bail!(
                "position {position} is out of range for a session with {} results",
                self.results.len()
            );
        };
        let stem = unique_stems(self.results.iter().map(|outcome| &outcome.video))
            .swap_remove(position);
        Ok((previous.video.clone(), stem))
    }

    fn recount(&mut self) {
        self.total_count = self.results.len();
        self.successful_count = self.results.iter().filter(|o| o.success).count();
    }
}

/// Downloads a single entry into `dir/<stem>.<ext>`, turning any failure into
/// a failed outcome.
pub fn download_one<D>(
    downloader: &D,
    entry: &VideoEntry,
    dir: &Path,
    stem: &str,
    format: OutputFormat,
) -> DownloadOutcome
where
    D: Downloader + ?Sized,
{
    match downloader.download(entry, dir, stem, format) {
        Ok(path) => {
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            DownloadOutcome::succeeded(entry, filename)
        }
        Err(err) => {
            warn!(title = %entry.title, error = %err, "download failed");
            DownloadOutcome::failed(entry, format!("{err:#}"))
        }
    }
}

/// Downloads `entries` with up to `workers` threads. Outcomes come back in
/// input order regardless of completion order.
pub fn download_batch<D>(
    downloader: &D,
    entries: &[VideoEntry],
    dir: &Path,
    format: OutputFormat,
    workers: usize,
) -> Vec<DownloadOutcome>
where
    D: Downloader + Sync + ?Sized,
{
    let workers = workers.clamp(1, entries.len().max(1));
    let stems = unique_stems(entries);
    let next = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<DownloadOutcome>>> =
        entries.iter().map(|_| Mutex::new(None)).collect();

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(entry) = entries.get(index) else {
                        break;
                    };
                    let outcome = download_one(downloader, entry, dir, &stems[index], format);
                    *slots[index].lock() = Some(outcome);
                }
            });
        }
    });

    slots
        .into_iter()
        .zip(entries)
        .map(|(slot, entry)| {
            slot.into_inner()
                .unwrap_or_else(|| DownloadOutcome::failed(entry, "download did not run"))
        })
        .collect()
}

/// Resubmits the entry stored at `position` and splices the new outcome in
/// place.
pub fn retry<D>(downloader: &D, session: &mut DownloadSession, position: usize) -> Result<()>
where
    D: Downloader + ?Sized,
{
    let (entry, stem) = session.retry_target(position)?;
    info!(session = %session.id, position, title = %entry.title, "retrying download");
    let outcome = download_one(downloader, &entry, &session.download_dir, &stem, session.format);
    session.splice(position, outcome)
}

/// Sessions kept by [`SessionStore::new`] before the oldest is dropped.
pub const DEFAULT_SESSION_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct StoredSessions {
    by_id: HashMap<String, DownloadSession>,
    /// Ids in insertion order, oldest first.
    order: VecDeque<String>,
}

/// Sessions held in memory by the server, keyed by id. Holds at most
/// `capacity` sessions; inserting past that evicts the oldest.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<StoredSessions>,
    counter: AtomicU64,
    capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SESSION_CAPACITY)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(StoredSessions::default()),
            counter: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Timestamp-based id, unique within this store.
    pub fn next_id(&self) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{sequence}", Utc::now().format("%Y%m%d_%H%M%S"))
    }

    pub fn insert(&self, session: DownloadSession) {
        let mut stored = self.sessions.write();
        let id = session.id.clone();
        if stored.by_id.insert(id.clone(), session).is_none() {
            stored.order.push_back(id);
        }
        while stored.order.len() > self.capacity {
            if let Some(oldest) = stored.order.pop_front() {
                debug!(session = %oldest, "evicting session");
                stored.by_id.remove(&oldest);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<DownloadSession> {
        self.sessions.read().by_id.get(id).cloned()
    }

    /// Replaces one outcome of a stored session under the write lock and
    /// returns the updated session.
    pub fn splice(
        &self,
        id: &str,
        position: usize,
        outcome: DownloadOutcome,
    ) -> Result<DownloadSession> {
        let mut stored = self.sessions.write();
        let session = stored
            .by_id
            .get_mut(id)
            .with_context(|| format!("session {id} not found"))?;
        session.splice(position, outcome)?;
        Ok(session.clone())
    }

    /// Retries one position of a stored session. The download runs without
    /// holding the lock and only its outcome is spliced back, so retries of
    /// other positions running at the same time are kept.
    pub fn retry<D>(&self, downloader: &D, id: &str, position: usize) -> Result<DownloadSession>
    where
        D: Downloader + ?Sized,
    {
        let (entry, stem, dir, format) = {
            let stored = self.sessions.read();
            let session = stored
                .by_id
                .get(id)
                .with_context(|| format!("session {id} not found"))?;
            let (entry, stem) = session.retry_target(position)?;
            (entry, stem, session.download_dir.clone(), session.format)
        };

        info!(session = %id, position, title = %entry.title, "retrying download");
        let outcome = download_one(downloader, &entry, &dir, &stem, format);
        self.splice(id, position, outcome)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().by_id.is_empty()
    }
}

/// Accepts a bare file name; rejects anything that could leave the
/// session directory.
pub fn safe_file_name(name: &str) -> Option<&str> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    valid.then_some(name)
}
