use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubecast-env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 1800;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 1800;
pub const DEFAULT_EXPIRY_AGE_SECS: u64 = 10800;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_JITTER_MIN_SECS: u64 = 5;
pub const DEFAULT_JITTER_MAX_SECS: u64 = 10;

/// Randomized delay bounds applied between per-channel probes inside one
/// refresh sweep, so every configured channel does not hit the upstream at
/// the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl JitterRange {
    pub fn none() -> Self {
        Self {
            min_secs: 0,
            max_secs: 0,
        }
    }
}

/// Raw `KEY=VALUE` contents of the env file; everything optional so the
/// loader can layer defaults on top.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub media_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub channels_file: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub refresh_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub expiry_age_secs: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub jitter_min_secs: Option<u64>,
    pub jitter_max_secs: Option<u64>,
}

/// Fully resolved runtime configuration shared by both binaries.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub cookies_file: Option<PathBuf>,
    pub refresh_interval: Duration,
    pub cleanup_interval: Duration,
    pub expiry_age: Duration,
    pub fetch_timeout: Duration,
    pub jitter: JitterRange,
    pub channels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ChannelsFile {
    #[serde(default)]
    channels: BTreeMap<String, String>,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key {
                "MEDIA_ROOT" => cfg.media_root = Some(PathBuf::from(value)),
                "TUBECAST_HOST" => cfg.host = Some(value.to_string()),
                "TUBECAST_PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("Parsing TUBECAST_PORT from {}", path.display()))?;
                    cfg.port = Some(port);
                }
                "CHANNELS_FILE" => cfg.channels_file = Some(PathBuf::from(value)),
                "COOKIES_FILE" => cfg.cookies_file = Some(PathBuf::from(value)),
                "REFRESH_INTERVAL" => {
                    cfg.refresh_interval_secs = Some(parse_secs(value, key, path)?);
                }
                "CLEANUP_INTERVAL" => {
                    cfg.cleanup_interval_secs = Some(parse_secs(value, key, path)?);
                }
                "EXPIRE_AGE" => cfg.expiry_age_secs = Some(parse_secs(value, key, path)?),
                "FETCH_TIMEOUT" => {
                    cfg.fetch_timeout_secs = Some(parse_secs(value, key, path)?);
                }
                "JITTER_MIN" => cfg.jitter_min_secs = Some(parse_secs(value, key, path)?),
                "JITTER_MAX" => cfg.jitter_max_secs = Some(parse_secs(value, key, path)?),
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

fn parse_secs(value: &str, key: &str, path: &Path) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Parsing {} from {}", key, path.display()))
}

pub fn load_service_config(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?
        .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?;
    let media_root = cfg
        .media_root
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set in {}", path.display()))?;

    let channels_file = cfg
        .channels_file
        .unwrap_or_else(|| media_root.join("channels.toml"));
    let channels = read_channels(&channels_file)?;
    if channels.is_empty() {
        return Err(anyhow!(
            "No channels configured in {}",
            channels_file.display()
        ));
    }

    let jitter = JitterRange {
        min_secs: cfg.jitter_min_secs.unwrap_or(DEFAULT_JITTER_MIN_SECS),
        max_secs: cfg.jitter_max_secs.unwrap_or(DEFAULT_JITTER_MAX_SECS),
    };
    if jitter.min_secs > jitter.max_secs {
        return Err(anyhow!(
            "JITTER_MIN ({}) exceeds JITTER_MAX ({}) in {}",
            jitter.min_secs,
            jitter.max_secs,
            path.display()
        ));
    }

    Ok(ServiceConfig {
        media_root,
        host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cfg.port.unwrap_or(DEFAULT_PORT),
        cookies_file: cfg.cookies_file,
        refresh_interval: Duration::from_secs(
            cfg.refresh_interval_secs
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
        ),
        cleanup_interval: Duration::from_secs(
            cfg.cleanup_interval_secs
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS),
        ),
        expiry_age: Duration::from_secs(cfg.expiry_age_secs.unwrap_or(DEFAULT_EXPIRY_AGE_SECS)),
        fetch_timeout: Duration::from_secs(
            cfg.fetch_timeout_secs
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
        ),
        jitter,
        channels,
    })
}

/// Channel map lives in its own TOML file so the service can be re-pointed
/// at new channels without touching the env file.
pub fn read_channels(path: &Path) -> Result<BTreeMap<String, String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let parsed: ChannelsFile =
        toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(parsed.channels)
}
