//! Age-based disk hygiene, decoupled from the refresh cadence.
//!
//! The reaper walks the media root on its own timer and removes artifacts
//! whose mtime is older than the expiry age, resetting their store entries
//! in the process. It also clears leftover partial downloads. A file it
//! cannot delete is logged and skipped; the sweep always finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::store::{CacheStore, PARTIAL_SUBDIR, STREAMS_SUBDIR};

pub async fn run(store: Arc<CacheStore>, media_root: PathBuf, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let store = Arc::clone(&store);
        let root = media_root.clone();
        let swept =
            tokio::task::spawn_blocking(move || sweep(&store, &root, SystemTime::now())).await;
        match swept {
            Ok(removed) if removed > 0 => info!(removed, "reaper sweep complete"),
            Ok(_) => debug!("reaper sweep complete, nothing expired"),
            Err(err) => warn!("reaper sweep aborted: {err}"),
        }
    }
}

/// One pass over `streams/` and `partial/`. `now` is passed in so tests can
/// age artifacts without touching mtimes. Returns how many files went away.
pub fn sweep(store: &CacheStore, media_root: &Path, now: SystemTime) -> usize {
    let expiry = store.expiry_age();
    let mut removed = 0;

    let walker = WalkDir::new(media_root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file());

    for entry in walker {
        let Some(parent) = entry
            .path()
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|name| name.to_str())
        else {
            continue;
        };
        if parent != STREAMS_SUBDIR && parent != PARTIAL_SUBDIR {
            continue;
        }

        let modified = match entry.metadata() {
            Ok(meta) => match meta.modified() {
                Ok(modified) => modified,
                Err(err) => {
                    warn!("skipping {}: no readable mtime: {err}", entry.path().display());
                    continue;
                }
            },
            Err(err) => {
                warn!("skipping {}: {err}", entry.path().display());
                continue;
            }
        };
        let age = match now.duration_since(modified) {
            Ok(age) => age,
            // mtime in the future; leave it alone.
            Err(_) => continue,
        };
        if age <= expiry {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if parent == STREAMS_SUBDIR {
            let key = store
                .known_keys()
                .into_iter()
                .find(|key| key.artifact_file_name() == name);
            match key {
                // Known entry: unlink through the store so the in-memory
                // state resets alongside the file.
                Some(key) => {
                    if store.invalidate(&key) {
                        removed += 1;
                    }
                }
                None => removed += unlink(entry.path()),
            }
        } else {
            removed += unlink(entry.path());
        }
    }

    removed
}

fn unlink(path: &Path) -> usize {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("removed expired file {}", path.display());
            1
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => {
            warn!("could not remove {}: {err}", path.display());
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CacheKey, OutputFormat};
    use crate::store::EntryStatus;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    const EXPIRY: Duration = Duration::from_secs(3 * 60 * 60);
    const TIMEOUT: Duration = Duration::from_secs(30);

    fn channels() -> BTreeMap<String, String> {
        BTreeMap::from([(
            "comedy".to_owned(),
            "https://youtube.com/@comedy/videos".to_owned(),
        )])
    }

    fn aged(now_offset: Duration) -> SystemTime {
        SystemTime::now() + now_offset
    }

    #[test]
    fn expired_artifact_is_unlinked_and_entry_reset() {
        let temp = tempdir().unwrap();
        let store = CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap();
        let key = CacheKey::new("comedy", OutputFormat::Mp4);
        let artifact = store.artifact_path(&key);
        std::fs::write(&artifact, "video-bytes").unwrap();
        store.rebuild_from_disk(&channels()).unwrap();

        let removed = sweep(&store, temp.path(), aged(EXPIRY + Duration::from_secs(60)));

        assert_eq!(removed, 1);
        assert!(!artifact.exists());
        assert_eq!(store.peek(&key).unwrap().status, EntryStatus::Empty);
    }

    #[test]
    fn fresh_artifact_survives_the_sweep() {
        let temp = tempdir().unwrap();
        let store = CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap();
        let key = CacheKey::new("comedy", OutputFormat::Mp4);
        let artifact = store.artifact_path(&key);
        std::fs::write(&artifact, "video-bytes").unwrap();
        store.rebuild_from_disk(&channels()).unwrap();

        let removed = sweep(&store, temp.path(), SystemTime::now());

        assert_eq!(removed, 0);
        assert!(artifact.exists());
        assert_eq!(store.peek(&key).unwrap().status, EntryStatus::Ready);
    }

    #[test]
    fn orphans_and_partials_are_swept_but_thumbnails_are_not() {
        let temp = tempdir().unwrap();
        let store = CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap();
        let orphan = store.streams_dir().join("stray.mp4");
        let partial = store.partial_dir().join("comedy.mp4");
        std::fs::write(&orphan, "old").unwrap();
        std::fs::write(&partial, "half").unwrap();
        let thumbs_dir = temp.path().join("thumbnails");
        std::fs::create_dir_all(&thumbs_dir).unwrap();
        let thumb = thumbs_dir.join("comedy.jpg");
        std::fs::write(&thumb, "jpg").unwrap();

        let removed = sweep(&store, temp.path(), aged(EXPIRY + Duration::from_secs(60)));

        assert_eq!(removed, 2);
        assert!(!orphan.exists());
        assert!(!partial.exists());
        assert!(thumb.exists());
    }
}
