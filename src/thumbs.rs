//! Channel avatar side-cache.
//!
//! Avatars ride along with the freshness probe: the refresh scheduler
//! remembers each channel's avatar URL here, and the thumbnail route
//! materializes the bytes on demand. The cache has its own short TTL,
//! independent of artifact expiry, and a failed fetch falls back to
//! whatever stale copy is still on disk. Nothing in the stream path ever
//! waits on a thumbnail.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub const THUMBNAILS_SUBDIR: &str = "thumbnails";

const DEFAULT_TTL: Duration = Duration::from_secs(900);

/// Avatars are small; anything past this is not one.
const MAX_THUMBNAIL_BYTES: u64 = 2 * 1024 * 1024;

pub struct ThumbnailCache {
    dir: PathBuf,
    ttl: Duration,
    urls: Mutex<HashMap<String, String>>,
}

impl ThumbnailCache {
    pub fn new(media_root: &Path) -> Result<Self> {
        Self::with_ttl(media_root, DEFAULT_TTL)
    }

    pub fn with_ttl(media_root: &Path, ttl: Duration) -> Result<Self> {
        let dir = media_root.join(THUMBNAILS_SUBDIR);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir,
            ttl,
            urls: Mutex::new(HashMap::new()),
        })
    }

    /// Records the avatar URL the latest probe reported for a channel.
    pub fn remember_url(&self, channel: &str, url: &str) {
        self.urls
            .lock()
            .insert(channel.to_owned(), url.to_owned());
    }

    pub fn path_for(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{channel}.jpg"))
    }

    /// Returns a servable avatar file for the channel, refetching when the
    /// cached copy has aged out. Fetch failures degrade to the stale copy,
    /// then to `None`; they never propagate.
    pub async fn ensure(&self, channel: &str) -> Option<PathBuf> {
        let path = self.path_for(channel);
        if is_fresh(&path, self.ttl) {
            return Some(path);
        }

        let Some(url) = self.urls.lock().get(channel).cloned() else {
            return path.exists().then_some(path);
        };

        let fetched = tokio::task::spawn_blocking(move || fetch_bytes(&url)).await;
        match fetched {
            Ok(Ok(bytes)) => {
                let staging = path.with_extension("jpg.tmp");
                let written = tokio::fs::write(&staging, &bytes).await;
                let published = match written {
                    Ok(()) => tokio::fs::rename(&staging, &path).await,
                    Err(err) => Err(err),
                };
                match published {
                    Ok(()) => {
                        debug!(channel, "thumbnail refreshed");
                        Some(path)
                    }
                    Err(err) => {
                        warn!(channel, "could not store thumbnail: {err}");
                        path.exists().then_some(path)
                    }
                }
            }
            Ok(Err(err)) => {
                warn!(channel, "thumbnail fetch failed: {err:#}");
                path.exists().then_some(path)
            }
            Err(err) => {
                warn!(channel, "thumbnail fetch task failed: {err}");
                path.exists().then_some(path)
            }
        }
    }
}

fn is_fresh(path: &Path, ttl: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age <= ttl)
}

fn fetch_bytes(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("requesting {url}"))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_THUMBNAIL_BYTES)
        .read_to_end(&mut bytes)
        .context("reading thumbnail body")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn unknown_channel_without_file_yields_none() {
        let temp = tempdir().unwrap();
        let thumbs = ThumbnailCache::new(temp.path()).unwrap();
        assert!(thumbs.ensure("comedy").await.is_none());
    }

    #[tokio::test]
    async fn fresh_file_is_served_without_a_fetch() {
        let temp = tempdir().unwrap();
        let thumbs = ThumbnailCache::new(temp.path()).unwrap();
        std::fs::write(thumbs.path_for("comedy"), "jpeg-bytes").unwrap();

        // No URL was ever remembered, so this can only come from disk.
        let path = thumbs.ensure("comedy").await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "jpeg-bytes");
    }

    #[tokio::test]
    async fn failed_refetch_falls_back_to_the_stale_copy() {
        let temp = tempdir().unwrap();
        // Zero TTL: the on-disk copy is always considered stale.
        let thumbs = ThumbnailCache::with_ttl(temp.path(), Duration::ZERO).unwrap();
        std::fs::write(thumbs.path_for("comedy"), "stale-bytes").unwrap();
        thumbs.remember_url("comedy", "not-a-valid-url");

        let path = thumbs.ensure("comedy").await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "stale-bytes");
    }

    #[tokio::test]
    async fn failed_fetch_with_no_fallback_yields_none() {
        let temp = tempdir().unwrap();
        let thumbs = ThumbnailCache::with_ttl(temp.path(), Duration::ZERO).unwrap();
        thumbs.remember_url("comedy", "not-a-valid-url");
        assert!(thumbs.ensure("comedy").await.is_none());
    }
}
