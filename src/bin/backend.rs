use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use songgrab_tools::{
    config::{self, DetectorSettings, RuntimeConfig},
    detector::{DuplicateCheckRequest, DuplicateDetector, DuplicateReport, InputError},
    logging,
    media::{OutputFormat, VideoEntry},
    packaging::{self, ARCHIVE_NAME},
    session::{self, DownloadSession, SessionStore, safe_file_name},
    ytdlp::{Resolution, YtDlp},
};
use tokio::{fs::File, signal, task};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP API for resolving, checking and downloading songs")]
struct Args {
    /// Env-style config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// TOML file with detector settings (threshold, mode, noise patterns)
    #[arg(long)]
    detector_config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    detector: Arc<DuplicateDetector>,
    ytdlp: Arc<YtDlp>,
    sessions: Arc<SessionStore>,
    runtime: Arc<RuntimeConfig>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

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

impl From<InputError> for ApiError {
    fn from(err: InputError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut runtime = config::load_runtime_config_from(&args.config)?;
    if let Some(host) = args.host {
        runtime.songgrab_host = host;
    }
    if let Some(port) = args.port {
        runtime.songgrab_port = port;
    }
    let detector_path = args.detector_config.or_else(|| runtime.detector_config.clone());
    let detector = DetectorSettings::load_optional(detector_path.as_deref())?
        .build()
        .context("building duplicate detector")?;

    let ytdlp = YtDlp::new(&runtime.ytdlp_path)
        .with_ffmpeg_location(runtime.ffmpeg_location.clone());
    if let Err(err) = ytdlp.ensure_available() {
        warn!("{err:#}; link resolution and downloads will fail");
    }

    let addr = SocketAddr::new(
        runtime
            .songgrab_host
            .parse::<IpAddr>()
            .with_context(|| format!("parsing host {}", runtime.songgrab_host))?,
        runtime.songgrab_port,
    );

    let state = AppState {
        detector: Arc::new(detector),
        ytdlp: Arc::new(ytdlp),
        sessions: Arc::new(SessionStore::new()),
        runtime: Arc::new(runtime),
    };

    let app = Router::new()
        .route("/api/fetch-info", post(fetch_info))
        .route("/api/check-duplicates", post(check_duplicates))
        .route("/api/download", post(start_download))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/retry", post(retry_download))
        .route("/api/sessions/{id}/archive", get(download_archive))
        .route("/downloads/{id}/{file}", get(download_file))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Deserialize)]
struct FetchInfoRequest {
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct FetchInfoResponse {
    videos: Vec<VideoEntry>,
    count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

async fn fetch_info(
    State(state): State<AppState>,
    Json(request): Json<FetchInfoRequest>,
) -> ApiResult<Json<FetchInfoResponse>> {
    let urls: Vec<String> = request
        .urls
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();
    if urls.is_empty() {
        return Err(ApiError::bad_request("No URLs provided"));
    }

    let ytdlp = state.ytdlp.clone();
    let limit = request.limit;
    let Resolution { videos, errors } =
        task::spawn_blocking(move || ytdlp.resolve_all(&urls, limit))
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))?;

    if videos.is_empty() {
        let detail = if errors.is_empty() {
            String::new()
        } else {
            format!(": {}", errors.join("; "))
        };
        return Err(ApiError::bad_request(format!("No videos found{detail}")));
    }

    Ok(Json(FetchInfoResponse {
        count: videos.len(),
        videos,
        errors,
    }))
}

async fn check_duplicates(
    State(state): State<AppState>,
    Json(request): Json<DuplicateCheckRequest>,
) -> ApiResult<Json<DuplicateReport>> {
    let check = request.validate()?;

    let mut detector = (*state.detector).clone();
    if let Some(threshold) = check.threshold {
        detector = detector.with_threshold(threshold);
    }
    if let Some(mode) = check.mode {
        detector = detector.with_mode(mode);
    }

    let report = detector.detect(&check.candidates);
    info!(
        candidates = check.candidates.len(),
        groups = report.duplicate_groups.len(),
        "duplicate check"
    );
    Ok(Json(report))
}

#[derive(Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    videos: Vec<VideoEntry>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    download_path: Option<PathBuf>,
}

async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadSession>> {
    if request.videos.is_empty() {
        return Err(ApiError::bad_request("No videos selected"));
    }
    let format = match request.format.as_deref() {
        Some(raw) => raw
            .parse::<OutputFormat>()
            .map_err(|err| ApiError::bad_request(err.to_string()))?,
        None => OutputFormat::default(),
    };

    let id = state.sessions.next_id();
    let base = request
        .download_path
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| state.runtime.download_root.clone());
    let dir = base.join(&id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| ApiError::internal(format!("creating {}: {err}", dir.display())))?;

    info!(session = %id, count = request.videos.len(), %format, "starting downloads");
    let ytdlp = state.ytdlp.clone();
    let workers = state.runtime.max_parallel_downloads;
    let videos = request.videos;
    let session = task::spawn_blocking(move || {
        let results = session::download_batch(&*ytdlp, &videos, &dir, format, workers);
        DownloadSession::new(id, dir, format, results)
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))?;

    info!(
        session = %session.id,
        succeeded = session.successful_count,
        total = session.total_count,
        "downloads finished"
    );
    state.sessions.insert(session.clone());
    Ok(Json(session))
}

async fn get_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadSession>> {
    state.session(&id).map(Json)
}

#[derive(Deserialize)]
struct RetryRequest {
    position: usize,
}

async fn retry_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<Json<DownloadSession>> {
    let current = state.session(&id)?;
    if request.position >= current.results.len() {
        return Err(ApiError::bad_request(format!(
            "position {} is out of range",
            request.position
        )));
    }

    let ytdlp = state.ytdlp.clone();
    let sessions = state.sessions.clone();
    let updated = task::spawn_blocking(move || sessions.retry(&*ytdlp, &id, request.position))
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(Json(updated))
}

async fn download_archive(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let current = state.session(&id)?;
    let dir = current.download_dir.clone();
    let archive = dir.join(ARCHIVE_NAME);

    let written = task::spawn_blocking({
        let archive = archive.clone();
        move || packaging::write_archive(&dir, &archive)
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))?;
    if let Err(err) = written {
        warn!(session = %id, "archive failed: {err:#}");
        return Err(ApiError::not_found("no downloaded files to package"));
    }

    let mime = "application/gzip".parse().ok();
    stream_file(archive, mime, Some(&format!("songs_{id}.tar.gz"))).await
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath((id, file)): AxumPath<(String, String)>,
) -> ApiResult<Response> {
    let current = state.session(&id)?;
    let name = safe_file_name(&file).ok_or_else(|| ApiError::bad_request("invalid file name"))?;
    let path = current.download_dir.join(name);
    stream_file(path, None, Some(name)).await
}

impl AppState {
    fn session(&self, id: &str) -> ApiResult<DownloadSession> {
        self.sessions
            .get(id)
            .ok_or_else(|| ApiError::not_found("session not found"))
    }
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    attachment: Option<&str>,
) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = attachment
        && let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}
