#![forbid(unsafe_code)]

//! One-shot cache warmer. Walks every configured channel, probes the newest
//! upstream entry, and builds its artifact through the same cache path the
//! server uses. Suitable for cron or a post-install step; one channel
//! failing never aborts the run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::process::{Command, Stdio};

use tubecast::{
    config,
    fetcher::{FreshnessProbe, YtDlp},
    key::{CacheKey, OutputFormat},
    security::ensure_not_root,
    store::CacheStore,
};

#[derive(Parser)]
#[command(
    name = "tubecast-prefetch",
    about = "Warms the stream cache for every configured channel"
)]
struct Args {
    /// Path to the env-style service config.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Container format to warm.
    #[arg(long, default_value = "mp4")]
    format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    ensure_not_root("tubecast-prefetch")?;
    let format = OutputFormat::from_ext(&args.format)
        .with_context(|| format!("unsupported format: {}", args.format))?;

    ensure_program_available("yt-dlp")?;
    let cfg = config::load_service_config(&args.config)?;

    let store = Arc::new(CacheStore::new(
        &cfg.media_root,
        cfg.expiry_age,
        cfg.fetch_timeout,
    )?);
    let restored = store.rebuild_from_disk(&cfg.channels)?;
    let fetcher = Arc::new(YtDlp::new(cfg.cookies_file.clone()));

    println!("===================================");
    println!("Tubecast cache warmer");
    println!("===================================");
    println!("Media root: {}", cfg.media_root.display());
    println!("Channels: {}", cfg.channels.len());
    println!("Restored from disk: {}", restored);
    println!();

    let total = cfg.channels.len();
    let mut failures = 0;
    for (index, (name, channel_url)) in cfg.channels.iter().enumerate() {
        let current = index + 1;
        println!("[{}/{}] Warming {}.{}", current, total, name, format.ext());

        // A failed probe is not fatal: the channel URL itself still lets the
        // downloader grab the newest entry.
        let source_ref = match fetcher.latest_source_ref(channel_url).await {
            Ok(result) => result.source_ref,
            Err(err) => {
                eprintln!("  Warning: probe failed for {}, using channel URL: {:#}", name, err);
                channel_url.clone()
            }
        };

        let key = CacheKey::new(name.clone(), format);
        match store.get_or_build(&key, &source_ref, &fetcher).await {
            Ok(path) => println!("  Ready: {}", path.display()),
            Err(err) => {
                failures += 1;
                eprintln!("  Warning: could not warm {}: {}", name, err);
            }
        }
    }

    println!();
    if failures == 0 {
        println!("All {} channel(s) warmed.", total);
    } else {
        println!("Warmed {} channel(s), {} failed.", total - failures, failures);
    }

    Ok(())
}

/// Runs `<name> --version` to fail loudly when the downloader is missing.
fn ensure_program_available(name: &str) -> Result<()> {
    let status = Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", name),
        Err(err) => bail!("{} is not installed or not in PATH: {}", name, err),
    }
}
