//! External acquisition layer.
//!
//! The cache store and the refresh scheduler only ever see the two traits
//! below; the yt-dlp implementation is one choice of collaborator. Fetches
//! are expected to be killable: the store enforces the fetch timeout by
//! dropping the future, and `kill_on_drop` reaps the subprocess when that
//! happens so no orphaned downloader keeps writing to the partial file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::process::Command;

use crate::key::OutputFormat;

/// Produces a complete artifact at `dest` or fails. `dest` is always a
/// staging path owned by the caller; publication into the serving directory
/// happens after this returns.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        source_ref: &str,
        format: OutputFormat,
        dest: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Cheap upstream freshness check used only by the refresh scheduler.
pub trait FreshnessProbe: Send + Sync {
    fn latest_source_ref(&self, channel_url: &str)
    -> impl Future<Output = Result<ProbeResult>> + Send;
}

/// Outcome of one freshness probe: the concrete locator of the newest
/// upstream entry, plus the channel avatar when the upstream reports one.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub source_ref: String,
    pub avatar_url: Option<String>,
}

/// yt-dlp–backed implementation of both traits.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    cookies_file: Option<PathBuf>,
}

/// Only the fields we read out of `--dump-single-json` output; everything
/// else the tool prints is ignored.
#[derive(Deserialize)]
struct ChannelProbeJson {
    #[serde(default)]
    entries: Vec<ProbeEntryJson>,
    #[serde(default)]
    uploader_thumbnail: Option<String>,
}

#[derive(Deserialize)]
struct ProbeEntryJson {
    id: Option<String>,
}

impl YtDlp {
    pub fn new(cookies_file: Option<PathBuf>) -> Self {
        Self::with_program("yt-dlp", cookies_file)
    }

    /// Points the adapter at a specific executable instead of whatever is on
    /// `PATH`. Tests use this to substitute a stub script.
    pub fn with_program(program: impl Into<PathBuf>, cookies_file: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies_file,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--no-warnings")
            .arg("--no-progress")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cookies) = &self.cookies_file {
            if cookies.exists() {
                cmd.arg("--cookies").arg(cookies);
            }
        }
        cmd
    }
}

impl Fetcher for YtDlp {
    async fn fetch(&self, source_ref: &str, format: OutputFormat, dest: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("--playlist-items")
            .arg("1")
            .arg("--format")
            .arg(format.selector())
            .arg("--merge-output-format")
            .arg(format.ext())
            .arg("--output")
            .arg(dest)
            .arg(source_ref)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .with_context(|| format!("running {} for {}", self.program.display(), source_ref))?;

        if !output.status.success() {
            bail!(
                "downloader exited with {} for {}: {}",
                output.status,
                source_ref,
                stderr_tail(&output.stderr)
            );
        }
        if !dest.exists() {
            bail!(
                "downloader reported success for {} but produced no file at {}",
                source_ref,
                dest.display()
            );
        }
        Ok(())
    }
}

impl FreshnessProbe for YtDlp {
    async fn latest_source_ref(&self, channel_url: &str) -> Result<ProbeResult> {
        let mut cmd = self.command();
        cmd.arg("--dump-single-json")
            .arg("--flat-playlist")
            .arg("--playlist-end")
            .arg("1")
            .arg(channel_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .with_context(|| format!("probing {}", channel_url))?;

        if !output.status.success() {
            bail!(
                "probe exited with {} for {}: {}",
                output.status,
                channel_url,
                stderr_tail(&output.stderr)
            );
        }

        let parsed: ChannelProbeJson = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing probe output for {}", channel_url))?;

        let id = parsed
            .entries
            .first()
            .and_then(|entry| entry.id.as_deref())
            .filter(|id| !id.is_empty())
            .with_context(|| format!("no entries in probe output for {}", channel_url))?;

        Ok(ProbeResult {
            source_ref: format!("https://www.youtube.com/watch?v={id}"),
            avatar_url: parsed
                .uploader_thumbnail
                .filter(|url| !url.is_empty()),
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    match text.trim().lines().last() {
        Some(line) => line.to_owned(),
        None => "(no diagnostic output)".to_owned(),
    }
}
