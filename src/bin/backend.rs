#![forbid(unsafe_code)]

//! HTTP surface of the media cache.
//!
//! `GET /{channel}.{ext}` resolves a stream through the cache (paying the
//! fetch latency once per cold key) and serves it with byte-range support;
//! `GET /` is a side-effect-free index over the cache. The refresh and
//! reaper loops run as background tasks owned by this process.

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, sync::Arc, time::SystemTime};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tracing::info;

use tubecast::{
    config::{self, ServiceConfig},
    error::StreamError,
    fetcher::YtDlp,
    key::{self, OutputFormat},
    range, reaper, refresh,
    security::ensure_not_root,
    store::{CacheStore, EntrySnapshot, EntryStatus},
    thumbs::ThumbnailCache,
};

#[derive(Parser)]
#[command(name = "tubecast-backend", about = "Caching stream server for configured channels")]
struct Args {
    /// Path to the env-style service config.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Clone)]
struct AppState {
    store: Arc<CacheStore>,
    fetcher: Arc<YtDlp>,
    thumbs: Arc<ThumbnailCache>,
    channels: Arc<BTreeMap<String, String>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        let status = match &err {
            StreamError::NotFound(_) => StatusCode::NOT_FOUND,
            StreamError::MalformedRange(_) => StatusCode::BAD_REQUEST,
            StreamError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            StreamError::Fetch { .. }
            | StreamError::Timeout { .. }
            | StreamError::Filesystem { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    ensure_not_root("tubecast-backend")?;
    let cfg = config::load_service_config(&args.config)?;

    let store = Arc::new(CacheStore::new(
        &cfg.media_root,
        cfg.expiry_age,
        cfg.fetch_timeout,
    )?);
    let restored = store.rebuild_from_disk(&cfg.channels)?;
    info!(restored, channels = cfg.channels.len(), "cache store initialized");

    let fetcher = Arc::new(YtDlp::new(cfg.cookies_file.clone()));
    let thumbs = Arc::new(ThumbnailCache::new(&cfg.media_root)?);
    let channels = Arc::new(cfg.channels.clone());

    spawn_background_loops(&cfg, &store, &fetcher, &thumbs, &channels);

    let state = AppState {
        store,
        fetcher,
        thumbs,
        channels,
    };

    let app = Router::new()
        .route("/", get(list_streams))
        .route("/{name}", get(stream_media).delete(remove_stream))
        .route("/{channel}/thumbnail", get(channel_thumbnail))
        .with_state(state);

    let addr = SocketAddr::new(
        cfg.host.parse().context("parsing TUBECAST_HOST")?,
        cfg.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("stream server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running stream server")?;

    Ok(())
}

fn spawn_background_loops(
    cfg: &ServiceConfig,
    store: &Arc<CacheStore>,
    fetcher: &Arc<YtDlp>,
    thumbs: &Arc<ThumbnailCache>,
    channels: &Arc<BTreeMap<String, String>>,
) {
    tokio::spawn(refresh::run(
        Arc::clone(store),
        Arc::clone(channels),
        Arc::clone(fetcher),
        Arc::clone(fetcher),
        Arc::clone(thumbs),
        cfg.refresh_interval,
        cfg.jitter,
    ));
    tokio::spawn(reaper::run(
        Arc::clone(store),
        cfg.media_root.clone(),
        cfg.cleanup_interval,
    ));
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Serialize)]
struct StreamSummary {
    name: String,
    format: OutputFormat,
    status: EntryStatus,
    url: String,
    thumbnail_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_fetched_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_checked_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

/// Cache index, built exclusively from `Peek`: browsing never fetches.
async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamSummary>> {
    let mut snapshots = state.store.peek_all();
    snapshots.sort_by(|a, b| b.last_fetched_at.cmp(&a.last_fetched_at));
    Json(snapshots.into_iter().map(summarize).collect())
}

fn summarize(snapshot: EntrySnapshot) -> StreamSummary {
    let size_bytes = snapshot
        .artifact
        .as_deref()
        .and_then(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len());
    StreamSummary {
        name: snapshot.key.channel.clone(),
        format: snapshot.key.format,
        status: snapshot.status,
        url: format!("/{}", snapshot.key.artifact_file_name()),
        thumbnail_url: format!("/{}/thumbnail", snapshot.key.channel),
        size_bytes,
        last_fetched_at: snapshot.last_fetched_at.map(to_rfc3339),
        last_checked_at: snapshot.last_checked_at.map(to_rfc3339),
        last_error: snapshot.last_error,
    }
}

fn to_rfc3339(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339()
}

async fn stream_media(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let request = key::normalize(&name, &state.channels)?;
    let artifact = state
        .store
        .get_or_build(&request.key, &request.source_ref, &state.fetcher)
        .await?;

    let range_header = match headers.get(header::RANGE) {
        None => None,
        Some(value) => Some(value.to_str().map_err(|_| {
            StreamError::MalformedRange("header is not valid ASCII".to_owned())
        })?),
    };
    let response = range::file_response(&artifact, range_header).await?;
    Ok(response)
}

async fn remove_stream(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let request = key::normalize(&name, &state.channels)?;
    if state.store.invalidate(&request.key) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("nothing cached for that stream"))
    }
}

async fn channel_thumbnail(
    State(state): State<AppState>,
    AxumPath(channel): AxumPath<String>,
) -> ApiResult<Response> {
    if !state.channels.contains_key(&channel) {
        return Err(ApiError::not_found("unknown channel"));
    }
    let Some(path) = state.thumbs.ensure(&channel).await else {
        return Err(ApiError::not_found("no thumbnail available"));
    };
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|err| ApiError::internal(format!("reading thumbnail: {err}")))?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response())
}
