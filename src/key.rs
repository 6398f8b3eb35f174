//! Key normalization: maps inbound request names onto canonical cache keys.
//!
//! Everything here is pure. A request either resolves to a configured channel
//! and a recognized container format before any I/O happens, or it is
//! rejected with `NotFound`.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::StreamError;

/// Container formats the service will materialize. The format is part of
/// cache identity: `comedy.mp4` and `comedy.webm` are distinct artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
}

impl OutputFormat {
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "mp4" => Some(Self::Mp4),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }

    pub fn ext(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    /// yt-dlp format selector that yields a muxed file in this container.
    pub fn selector(self) -> &'static str {
        match self {
            Self::Mp4 => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
            Self::Webm => "bestvideo[ext=webm]+bestaudio[ext=webm]/best[ext=webm]/best",
        }
    }
}

/// Canonical identifier for one channel/format pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub channel: String,
    pub format: OutputFormat,
}

impl CacheKey {
    pub fn new(channel: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            channel: channel.into(),
            format,
        }
    }

    /// Deterministic on-disk file name, so a directory scan can rebuild the
    /// store after a restart.
    pub fn artifact_file_name(&self) -> String {
        format!("{}.{}", self.channel, self.format.ext())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.channel, self.format.ext())
    }
}

/// Result of normalizing a request: the cache key plus the upstream locator
/// the artifact should be built from when the cache is cold.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub key: CacheKey,
    pub source_ref: String,
}

/// Resolves a path component such as `comedy.mp4` against the configured
/// channel map. No side effects; unknown channels and unknown extensions are
/// both rejected as `NotFound` before any fetch can start.
pub fn normalize(
    name: &str,
    channels: &BTreeMap<String, String>,
) -> Result<NormalizedRequest, StreamError> {
    let (channel, ext) = name
        .rsplit_once('.')
        .ok_or_else(|| StreamError::NotFound(name.to_owned()))?;

    let format = OutputFormat::from_ext(ext).ok_or_else(|| StreamError::NotFound(name.to_owned()))?;

    let source_ref = channels
        .get(channel)
        .ok_or_else(|| StreamError::NotFound(name.to_owned()))?;

    Ok(NormalizedRequest {
        key: CacheKey::new(channel, format),
        source_ref: source_ref.clone(),
    })
}

/// Inverse of `CacheKey::artifact_file_name`, used by the startup disk scan.
/// Files that do not correspond to a configured channel are ignored.
pub fn parse_artifact_file_name(
    name: &str,
    channels: &BTreeMap<String, String>,
) -> Option<CacheKey> {
    let (channel, ext) = name.rsplit_once('.')?;
    let format = OutputFormat::from_ext(ext)?;
    if !channels.contains_key(channel) {
        return None;
    }
    Some(CacheKey::new(channel, format))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> BTreeMap<String, String> {
        BTreeMap::from([(
            "comedy".to_owned(),
            "https://youtube.com/@malayalamcomedyscene5334/videos".to_owned(),
        )])
    }

    #[test]
    fn normalize_resolves_configured_channel() {
        let req = normalize("comedy.mp4", &channels()).unwrap();
        assert_eq!(req.key, CacheKey::new("comedy", OutputFormat::Mp4));
        assert!(req.source_ref.contains("malayalamcomedyscene5334"));
    }

    #[test]
    fn normalize_rejects_unknown_channel() {
        let err = normalize("news.mp4", &channels()).unwrap_err();
        assert_eq!(err, StreamError::NotFound("news.mp4".into()));
    }

    #[test]
    fn normalize_rejects_unknown_extension() {
        assert!(normalize("comedy.avi", &channels()).is_err());
        assert!(normalize("comedy", &channels()).is_err());
    }

    #[test]
    fn formats_are_distinct_keys() {
        let mp4 = normalize("comedy.mp4", &channels()).unwrap();
        let webm = normalize("comedy.webm", &channels()).unwrap();
        assert_ne!(mp4.key, webm.key);
        assert_ne!(
            mp4.key.artifact_file_name(),
            webm.key.artifact_file_name()
        );
    }

    #[test]
    fn artifact_file_name_round_trips() {
        let key = CacheKey::new("comedy", OutputFormat::Webm);
        let parsed = parse_artifact_file_name(&key.artifact_file_name(), &channels()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_ignores_unconfigured_files() {
        assert!(parse_artifact_file_name("stray.mp4", &channels()).is_none());
        assert!(parse_artifact_file_name("comedy.part", &channels()).is_none());
    }
}
