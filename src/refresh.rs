//! Background refresh: keeps cached artifacts pointed at the newest
//! upstream entry, independently of request traffic.
//!
//! Each sweep probes every tracked key, rebuilds the ones whose upstream
//! moved, and merely stamps `last_checked_at` on the ones that did not.
//! A randomized delay between per-key probes spreads the sweep out so all
//! channels do not hit the upstream at the same instant.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::JitterRange;
use crate::fetcher::{Fetcher, FreshnessProbe};
use crate::key::{CacheKey, OutputFormat};
use crate::store::{CacheStore, EntryStatus};
use crate::thumbs::ThumbnailCache;

/// Probes are cheap metadata calls; they get a much tighter bound than full
/// fetches so one hung probe cannot stall the sweep for long.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Every configured channel is kept warm in this format even before the
/// first client asks for it.
const WARM_FORMAT: OutputFormat = OutputFormat::Mp4;

pub async fn run<F, P>(
    store: Arc<CacheStore>,
    channels: Arc<BTreeMap<String, String>>,
    probe: Arc<P>,
    fetcher: Arc<F>,
    thumbs: Arc<ThumbnailCache>,
    interval: Duration,
    jitter: JitterRange,
) where
    F: Fetcher + 'static,
    P: FreshnessProbe,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep(
            &store,
            &channels,
            probe.as_ref(),
            &fetcher,
            Some(thumbs.as_ref()),
            jitter,
        )
        .await;
    }
}

/// One full pass over the tracked keys. Exposed separately from the loop so
/// tests can drive it directly with fake collaborators and zero jitter.
pub async fn sweep<F, P>(
    store: &Arc<CacheStore>,
    channels: &BTreeMap<String, String>,
    probe: &P,
    fetcher: &Arc<F>,
    thumbs: Option<&ThumbnailCache>,
    jitter: JitterRange,
) where
    F: Fetcher + 'static,
    P: FreshnessProbe,
{
    let keys = sweep_keys(store, channels);
    debug!(keys = keys.len(), "starting refresh sweep");

    for key in keys {
        let Some(channel_url) = channels.get(&key.channel) else {
            continue;
        };

        match time::timeout(PROBE_TIMEOUT, probe.latest_source_ref(channel_url)).await {
            Ok(Ok(result)) => {
                if let (Some(thumbs), Some(avatar)) = (thumbs, result.avatar_url.as_deref()) {
                    thumbs.remember_url(&key.channel, avatar);
                }

                let entry = store.peek(&key);
                let ready = entry
                    .as_ref()
                    .is_some_and(|snapshot| snapshot.status == EntryStatus::Ready);
                let current_ref = entry.and_then(|snapshot| snapshot.source_ref);

                if ready && current_ref.as_deref() == Some(result.source_ref.as_str()) {
                    store.touch_checked(&key, SystemTime::now());
                    debug!(key = %key, "upstream unchanged");
                } else {
                    info!(key = %key, source_ref = %result.source_ref, "rebuilding");
                    if let Err(error) = store.rebuild(&key, &result.source_ref, fetcher).await {
                        warn!(key = %key, %error, "refresh rebuild failed");
                    }
                }
            }
            Ok(Err(error)) => warn!(key = %key, "freshness probe failed: {error:#}"),
            Err(_) => warn!(key = %key, "freshness probe timed out"),
        }

        sleep_jitter(jitter).await;
    }
}

/// Keys already tracked by the store plus one warm-format key per configured
/// channel, so a cold start still pre-populates the cache.
fn sweep_keys(store: &CacheStore, channels: &BTreeMap<String, String>) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = store
        .known_keys()
        .into_iter()
        .filter(|key| channels.contains_key(&key.channel))
        .collect();
    for name in channels.keys() {
        let warm = CacheKey::new(name.clone(), WARM_FORMAT);
        if !keys.contains(&warm) {
            keys.push(warm);
        }
    }
    keys.sort();
    keys
}

async fn sleep_jitter(jitter: JitterRange) {
    if jitter.max_secs == 0 {
        return;
    }
    let secs = {
        let mut rng = rand::thread_rng();
        rng.gen_range(jitter.min_secs..=jitter.max_secs)
    };
    time::sleep(Duration::from_secs(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::ProbeResult;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const EXPIRY: Duration = Duration::from_secs(3 * 60 * 60);
    const TIMEOUT: Duration = Duration::from_secs(30);

    struct RecordingFetcher {
        calls: AtomicUsize,
    }

    impl RecordingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for RecordingFetcher {
        async fn fetch(
            &self,
            _source_ref: &str,
            _format: OutputFormat,
            dest: &std::path::Path,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, "refreshed").await?;
            Ok(())
        }
    }

    /// Answers with a fixed ref per channel URL; channels not in the map
    /// fail their probe.
    struct FakeProbe {
        refs: BTreeMap<String, String>,
        calls: AtomicUsize,
    }

    impl FreshnessProbe for FakeProbe {
        async fn latest_source_ref(&self, channel_url: &str) -> anyhow::Result<ProbeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.refs.get(channel_url) {
                Some(source_ref) => Ok(ProbeResult {
                    source_ref: source_ref.clone(),
                    avatar_url: None,
                }),
                None => bail!("probe offline"),
            }
        }
    }

    fn channels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, url)| (name.to_string(), url.to_string()))
            .collect()
    }

    fn probe_for(pairs: &[(&str, &str)]) -> FakeProbe {
        FakeProbe {
            refs: pairs
                .iter()
                .map(|(url, source_ref)| (url.to_string(), source_ref.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn unchanged_upstream_skips_the_fetch() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap());
        let channels = channels(&[("comedy", "https://yt/@comedy")]);
        let fetcher = RecordingFetcher::new();
        let key = CacheKey::new("comedy", OutputFormat::Mp4);

        store
            .get_or_build(&key, "https://watch?v=A", &fetcher)
            .await
            .unwrap();
        assert_eq!(fetcher.calls(), 1);

        let probe = probe_for(&[("https://yt/@comedy", "https://watch?v=A")]);
        sweep(&store, &channels, &probe, &fetcher, None, JitterRange::none()).await;

        assert_eq!(fetcher.calls(), 1);
        let snapshot = store.peek(&key).unwrap();
        assert_eq!(snapshot.status, EntryStatus::Ready);
        assert!(snapshot.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn moved_upstream_forces_a_rebuild() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap());
        let channels = channels(&[("comedy", "https://yt/@comedy")]);
        let fetcher = RecordingFetcher::new();
        let key = CacheKey::new("comedy", OutputFormat::Mp4);

        store
            .get_or_build(&key, "https://watch?v=A", &fetcher)
            .await
            .unwrap();

        let probe = probe_for(&[("https://yt/@comedy", "https://watch?v=B")]);
        sweep(&store, &channels, &probe, &fetcher, None, JitterRange::none()).await;

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(
            store.peek(&key).unwrap().source_ref.as_deref(),
            Some("https://watch?v=B")
        );
    }

    #[tokio::test]
    async fn cold_sweep_warms_every_configured_channel() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap());
        let channels = channels(&[
            ("comedy", "https://yt/@comedy"),
            ("studyiq", "https://yt/@studyiq"),
        ]);
        let fetcher = RecordingFetcher::new();

        let probe = probe_for(&[
            ("https://yt/@comedy", "https://watch?v=A"),
            ("https://yt/@studyiq", "https://watch?v=B"),
        ]);
        sweep(&store, &channels, &probe, &fetcher, None, JitterRange::none()).await;

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(
            store
                .peek(&CacheKey::new("comedy", OutputFormat::Mp4))
                .unwrap()
                .status,
            EntryStatus::Ready
        );
        assert_eq!(
            store
                .peek(&CacheKey::new("studyiq", OutputFormat::Mp4))
                .unwrap()
                .status,
            EntryStatus::Ready
        );
    }

    #[tokio::test]
    async fn one_failing_probe_does_not_stop_the_sweep() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap());
        let channels = channels(&[
            ("broken", "https://yt/@broken"),
            ("comedy", "https://yt/@comedy"),
        ]);
        let fetcher = RecordingFetcher::new();

        // Only comedy's probe answers; broken's fails.
        let probe = probe_for(&[("https://yt/@comedy", "https://watch?v=A")]);
        sweep(&store, &channels, &probe, &fetcher, None, JitterRange::none()).await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(
            store
                .peek(&CacheKey::new("comedy", OutputFormat::Mp4))
                .unwrap()
                .status,
            EntryStatus::Ready
        );
        assert!(
            store
                .peek(&CacheKey::new("broken", OutputFormat::Mp4))
                .is_none()
        );
    }

    #[tokio::test]
    async fn sweep_tracks_extra_formats_already_requested() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path(), EXPIRY, TIMEOUT).unwrap());
        let channels = channels(&[("comedy", "https://yt/@comedy")]);
        let fetcher = RecordingFetcher::new();
        let webm = CacheKey::new("comedy", OutputFormat::Webm);

        store
            .get_or_build(&webm, "https://watch?v=A", &fetcher)
            .await
            .unwrap();

        let probe = probe_for(&[("https://yt/@comedy", "https://watch?v=B")]);
        sweep(&store, &channels, &probe, &fetcher, None, JitterRange::none()).await;

        // Both the requested webm key and the warm mp4 key got rebuilt.
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(
            store.peek(&webm).unwrap().source_ref.as_deref(),
            Some("https://watch?v=B")
        );
    }
}
