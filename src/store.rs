//! Cache store and single-flight coordination.
//!
//! One entry per `CacheKey`, moving through `Empty → Fetching → Ready |
//! Failed`. The map is guarded by a single fast mutex, but only state
//! transitions happen under it; the fetch itself runs in a detached task so
//! a disconnecting client cannot abandon work other callers are waiting on.
//!
//! Single-flight: whichever caller observes a buildable state first installs
//! a `watch` channel and becomes the owner. Everyone else subscribes to that
//! channel and receives the owner's outcome, success or failure, exactly as
//! published. A `Failed` entry is immediately retryable by the next caller.
//!
//! Artifacts are downloaded into `partial/` and renamed into `streams/` only
//! once complete, so readers never observe a half-written file.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::fetcher::Fetcher;
use crate::key::{CacheKey, parse_artifact_file_name};

pub const STREAMS_SUBDIR: &str = "streams";
pub const PARTIAL_SUBDIR: &str = "partial";

pub type FetchOutcome = Result<PathBuf, StreamError>;

#[derive(Clone)]
enum EntryState {
    Empty,
    Fetching {
        outcome: watch::Receiver<Option<FetchOutcome>>,
    },
    Ready {
        artifact: PathBuf,
    },
    Failed {
        error: StreamError,
    },
}

struct CacheEntry {
    state: EntryState,
    source_ref: Option<String>,
    last_fetched_at: Option<SystemTime>,
    last_checked_at: Option<SystemTime>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            state: EntryState::Empty,
            source_ref: None,
            last_fetched_at: None,
            last_checked_at: None,
        }
    }

    fn reset(&mut self) {
        self.state = EntryState::Empty;
        self.source_ref = None;
        self.last_fetched_at = None;
        self.last_checked_at = None;
    }
}

/// Coarse entry state exposed to the listing view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Empty,
    Fetching,
    Ready,
    Failed,
}

/// Point-in-time copy of an entry, safe to hand out without holding locks.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub status: EntryStatus,
    pub artifact: Option<PathBuf>,
    pub source_ref: Option<String>,
    pub last_fetched_at: Option<SystemTime>,
    pub last_checked_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

pub struct CacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    streams_dir: PathBuf,
    partial_dir: PathBuf,
    expiry_age: Duration,
    fetch_timeout: Duration,
}

enum Role {
    Done(FetchOutcome),
    Waiter(watch::Receiver<Option<FetchOutcome>>),
    Owner(watch::Sender<Option<FetchOutcome>>),
}

impl CacheStore {
    pub fn new(media_root: &Path, expiry_age: Duration, fetch_timeout: Duration) -> Result<Self> {
        let streams_dir = media_root.join(STREAMS_SUBDIR);
        let partial_dir = media_root.join(PARTIAL_SUBDIR);
        std::fs::create_dir_all(&streams_dir)
            .with_context(|| format!("creating {}", streams_dir.display()))?;
        std::fs::create_dir_all(&partial_dir)
            .with_context(|| format!("creating {}", partial_dir.display()))?;
        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            streams_dir,
            partial_dir,
            expiry_age,
            fetch_timeout,
        })
    }

    pub fn streams_dir(&self) -> &Path {
        &self.streams_dir
    }

    pub fn partial_dir(&self) -> &Path {
        &self.partial_dir
    }

    pub fn expiry_age(&self) -> Duration {
        self.expiry_age
    }

    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.streams_dir.join(key.artifact_file_name())
    }

    fn partial_path(&self, key: &CacheKey) -> PathBuf {
        self.partial_dir.join(key.artifact_file_name())
    }

    /// Returns the ready artifact for `key`, fetching it first if the entry
    /// is cold, expired, failed, or gone from disk. Concurrent callers for
    /// the same key share a single fetch and observe its one outcome.
    pub async fn get_or_build<F>(
        self: &Arc<Self>,
        key: &CacheKey,
        source_ref: &str,
        fetcher: &Arc<F>,
    ) -> FetchOutcome
    where
        F: Fetcher + 'static,
    {
        self.build_inner(key, source_ref, fetcher, false).await
    }

    /// Forces a fresh fetch even when the entry is `Ready`, used by the
    /// refresh scheduler when the upstream source moved. Joins an already
    /// running fetch instead of queueing a second one.
    pub async fn rebuild<F>(
        self: &Arc<Self>,
        key: &CacheKey,
        source_ref: &str,
        fetcher: &Arc<F>,
    ) -> FetchOutcome
    where
        F: Fetcher + 'static,
    {
        self.build_inner(key, source_ref, fetcher, true).await
    }

    async fn build_inner<F>(
        self: &Arc<Self>,
        key: &CacheKey,
        source_ref: &str,
        fetcher: &Arc<F>,
        force: bool,
    ) -> FetchOutcome
    where
        F: Fetcher + 'static,
    {
        let role = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::new);
            match &entry.state {
                EntryState::Ready { artifact }
                    if !force && !self.is_expired(entry.last_fetched_at) && artifact.exists() =>
                {
                    Role::Done(Ok(artifact.clone()))
                }
                EntryState::Fetching { outcome } => Role::Waiter(outcome.clone()),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    entry.state = EntryState::Fetching { outcome: rx };
                    Role::Owner(tx)
                }
            }
        };

        match role {
            Role::Done(outcome) => outcome,
            Role::Waiter(rx) => self.await_outcome(rx, key).await,
            Role::Owner(tx) => {
                debug!(key = %key, source_ref, "starting fetch");
                let rx = tx.subscribe();
                let store = Arc::clone(self);
                let fetcher = Arc::clone(fetcher);
                let task_key = key.clone();
                let task_ref = source_ref.to_owned();
                // Detached so the fetch survives the requesting client going
                // away; waiters are still released through the channel.
                tokio::spawn(async move {
                    let outcome = store.run_fetch(&task_key, &task_ref, fetcher.as_ref()).await;
                    store.publish(&task_key, &task_ref, &outcome);
                    let _ = tx.send(Some(outcome));
                });
                self.await_outcome(rx, key).await
            }
        }
    }

    async fn await_outcome(
        &self,
        mut rx: watch::Receiver<Option<FetchOutcome>>,
        key: &CacheKey,
    ) -> FetchOutcome {
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(guard) => match guard.as_ref() {
                Some(outcome) => outcome.clone(),
                None => self.abandoned(key),
            },
            Err(_) => self.abandoned(key),
        }
    }

    /// The owning task died without publishing. Reset the entry so the next
    /// caller can retry instead of waiting on a dead channel forever.
    fn abandoned(&self, key: &CacheKey) -> FetchOutcome {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            let owner_gone = match &entry.state {
                EntryState::Fetching { outcome } => outcome.has_changed().is_err(),
                _ => false,
            };
            if owner_gone {
                entry.state = EntryState::Empty;
            }
        }
        Err(StreamError::Fetch {
            key: key.to_string(),
            message: "fetch was abandoned before completing".to_owned(),
        })
    }

    async fn run_fetch<F: Fetcher>(
        &self,
        key: &CacheKey,
        source_ref: &str,
        fetcher: &F,
    ) -> FetchOutcome {
        let partial = self.partial_path(key);
        // A stale partial from a crashed run would make the downloader skip
        // the download entirely.
        let _ = tokio::fs::remove_file(&partial).await;

        let fetch = fetcher.fetch(source_ref, key.format, &partial);
        let outcome = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(())) => {
                let artifact = self.artifact_path(key);
                match tokio::fs::rename(&partial, &artifact).await {
                    Ok(()) => Ok(artifact),
                    Err(err) => Err(StreamError::filesystem(&artifact, &err)),
                }
            }
            Ok(Err(err)) => Err(StreamError::Fetch {
                key: key.to_string(),
                message: format!("{err:#}"),
            }),
            Err(_) => Err(StreamError::Timeout {
                key: key.to_string(),
                seconds: self.fetch_timeout.as_secs(),
            }),
        };

        if outcome.is_err() && tokio::fs::remove_file(&partial).await.is_ok() {
            debug!(key = %key, "removed leftover partial artifact");
        }
        outcome
    }

    /// Records the fetch outcome on the entry. Path and timestamp land
    /// before any waiter is released, so nobody observes `Ready` without a
    /// published artifact.
    fn publish(&self, key: &CacheKey, source_ref: &str, outcome: &FetchOutcome) {
        let now = SystemTime::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::new);
        match outcome {
            Ok(artifact) => {
                entry.state = EntryState::Ready {
                    artifact: artifact.clone(),
                };
                entry.source_ref = Some(source_ref.to_owned());
                entry.last_fetched_at = Some(now);
                entry.last_checked_at = Some(now);
                info!(key = %key, artifact = %artifact.display(), "artifact ready");
            }
            Err(error) => {
                entry.state = EntryState::Failed {
                    error: error.clone(),
                };
                entry.last_checked_at = Some(now);
                warn!(key = %key, %error, "fetch failed");
            }
        }
    }

    /// Non-blocking inspection. Never triggers a fetch.
    pub fn peek(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        let entries = self.entries.lock();
        entries.get(key).map(|entry| snapshot(key, entry))
    }

    pub fn peek_all(&self) -> Vec<EntrySnapshot> {
        let entries = self.entries.lock();
        entries
            .iter()
            .map(|(key, entry)| snapshot(key, entry))
            .collect()
    }

    pub fn known_keys(&self) -> Vec<CacheKey> {
        let entries = self.entries.lock();
        entries.keys().cloned().collect()
    }

    /// Marks an upstream freshness probe that found nothing new.
    pub fn touch_checked(&self, key: &CacheKey, now: SystemTime) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.last_checked_at = Some(now);
        }
    }

    /// Resets the entry to `Empty` and unlinks its artifact. Declines while
    /// a fetch is in flight; the reaper will catch the artifact once it ages
    /// out. Returns whether anything was actually removed or reset.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let had_entry = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) => match entry.state {
                    EntryState::Fetching { .. } => {
                        warn!(key = %key, "not invalidating entry with fetch in flight");
                        return false;
                    }
                    EntryState::Empty => false,
                    _ => {
                        entry.reset();
                        true
                    }
                },
                None => false,
            }
        };

        let path = self.artifact_path(key);
        let removed_file = match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(key = %key, "removed artifact {}", path.display());
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(key = %key, "could not remove {}: {}", path.display(), err);
                false
            }
        };

        had_entry || removed_file
    }

    /// Repopulates the entry map from the artifacts already on disk, taking
    /// each file's mtime as its fetch time. Called once at startup.
    pub fn rebuild_from_disk(&self, channels: &BTreeMap<String, String>) -> Result<usize> {
        let dir = std::fs::read_dir(&self.streams_dir)
            .with_context(|| format!("reading {}", self.streams_dir.display()))?;

        let mut restored = 0;
        for dir_entry in dir {
            let dir_entry = match dir_entry {
                Ok(value) => value,
                Err(err) => {
                    warn!("skipping unreadable directory entry: {err}");
                    continue;
                }
            };
            let name = dir_entry.file_name();
            let Some(key) = name
                .to_str()
                .and_then(|name| parse_artifact_file_name(name, channels))
            else {
                continue;
            };
            let modified = match dir_entry.metadata().and_then(|meta| meta.modified()) {
                Ok(value) => value,
                Err(err) => {
                    warn!(key = %key, "skipping artifact without readable mtime: {err}");
                    continue;
                }
            };

            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::new);
            entry.state = EntryState::Ready {
                artifact: dir_entry.path(),
            };
            entry.last_fetched_at = Some(modified);
            restored += 1;
            debug!(key = %key, "restored artifact from disk");
        }
        Ok(restored)
    }

    fn is_expired(&self, last_fetched_at: Option<SystemTime>) -> bool {
        match last_fetched_at {
            Some(fetched) => match SystemTime::now().duration_since(fetched) {
                Ok(age) => age > self.expiry_age,
                // Clock went backwards; treat the artifact as fresh.
                Err(_) => false,
            },
            None => true,
        }
    }

    #[cfg(test)]
    fn backdate(&self, key: &CacheKey, fetched_at: SystemTime) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.last_fetched_at = Some(fetched_at);
        }
    }
}

fn snapshot(key: &CacheKey, entry: &CacheEntry) -> EntrySnapshot {
    let (status, artifact, last_error) = match &entry.state {
        EntryState::Empty => (EntryStatus::Empty, None, None),
        EntryState::Fetching { .. } => (EntryStatus::Fetching, None, None),
        EntryState::Ready { artifact } => (EntryStatus::Ready, Some(artifact.clone()), None),
        EntryState::Failed { error } => (EntryStatus::Failed, None, Some(error.to_string())),
    };
    EntrySnapshot {
        key: key.clone(),
        status,
        artifact,
        source_ref: entry.source_ref.clone(),
        last_fetched_at: entry.last_fetched_at,
        last_checked_at: entry.last_checked_at,
        last_error,
    }
}
