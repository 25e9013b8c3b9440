#![forbid(unsafe_code)]

//! Axum backend exposing `POST /formats` and `POST /download`.
//!
//! Both endpoints take a YouTube page URL. `/formats` lists the video-only and
//! audio-only renditions yt-dlp knows about; `/download` fetches one of each
//! and muxes them into `<video id>.mp4` inside the output directory.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{FromRequest, Request, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};
use tubemux::{
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    error::ServiceError,
    extractor::YtDlp,
    fetcher::Fetcher,
    formats::{FormatsResponse, ItagParam, QualityRequest},
    muxer::Ffmpeg,
    paths::OutputPaths,
    pipeline::{DownloadRequest, MediaService},
    preflight::{ensure_not_root, ensure_program_available},
    telemetry::{LogLevel, init_tracing},
    video_url::validate_url,
};

const INVALID_URL_MESSAGE: &str = "URL inválida.";
const INVALID_ITAG_MESSAGE: &str = "Formato solicitado inválido.";
const SUCCESS_MESSAGE: &str = "Video descargado y procesado exitosamente.";
const NO_SUITABLE_FORMAT_MESSAGE: &str =
    "No se pudieron encontrar formatos adecuados de video y audio.";
const FORMATS_ERROR_PREFIX: &str = "Error al obtener los formatos";
const MUX_ERROR_PREFIX: &str = "Error al combinar video y audio";
const PROCESS_ERROR_PREFIX: &str = "Error al procesar el video";

#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "Lists and downloads YouTube renditions")]
struct BackendArgs {
    /// dotenv file read for TUBEMUX_* settings.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Directory receiving temporary and muxed files.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// yt-dlp executable.
    #[arg(long = "yt-dlp")]
    ytdlp: Option<PathBuf>,
    /// ffmpeg executable.
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    /// Skip the refusal to run as root (containers).
    #[arg(long)]
    allow_root: bool,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            output_dir: self.output_dir.clone(),
            host: self.host.clone(),
            port: self.port,
            ytdlp: self.ytdlp.clone(),
            ffmpeg: self.ffmpeg.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEMUX_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    service: MediaService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormatsRequest {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadVideoRequest {
    url: Option<String>,
    /// Kept raw so a malformed itag is reported after the URL check.
    video_itag: Option<serde_json::Value>,
    audio_itag: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    message: String,
    file: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn invalid_url() -> Self {
        Self::bad_request(INVALID_URL_MESSAGE)
    }

    /// Maps a `/formats` failure.
    fn from_formats_error(err: ServiceError) -> Self {
        if err.is_client_error() {
            warn!("rejected /formats request: {err}");
            return Self::invalid_url();
        }
        error!("{FORMATS_ERROR_PREFIX}: {err}");
        Self::internal(format!("{FORMATS_ERROR_PREFIX}: {err}"))
    }

    /// Maps a `/download` failure onto the message of the stage that failed.
    fn from_download_error(err: ServiceError) -> Self {
        let api_error = match &err {
            ServiceError::InvalidUrl(_) => Self::invalid_url(),
            ServiceError::NoSuitableFormat { .. } => Self::internal(NO_SUITABLE_FORMAT_MESSAGE),
            ServiceError::MuxFailed(detail) => {
                Self::internal(format!("{MUX_ERROR_PREFIX}: {detail}"))
            }
            ServiceError::ExtractionFailure(_) | ServiceError::DownloadFailed { .. } => {
                Self::internal(format!("{PROCESS_ERROR_PREFIX}: {err}"))
            }
        };
        match &err {
            ServiceError::DownloadFailed { path, .. } => {
                error!(path = %path.display(), "/download failed: {err}")
            }
            _ if err.is_client_error() => warn!("rejected /download request: {err}"),
            _ => error!("/download failed: {err}"),
        }
        api_error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` whose rejections (missing body, wrong content type, mistyped
/// fields) are answered like a missing URL.
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                warn!("rejected request body: {}", rejection.body_text());
                Err(ApiError::invalid_url())
            }
        }
    }
}

fn require_url(url: Option<String>) -> ApiResult<String> {
    url.filter(|url| validate_url(url))
        .ok_or_else(ApiError::invalid_url)
}

/// Accepts a number, a string, `null` or nothing; anything else is a 400.
fn parse_itag(value: Option<serde_json::Value>) -> ApiResult<Option<QualityRequest>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value::<ItagParam>(value)
            .map(|itag| itag.to_request())
            .map_err(|err| {
                warn!("rejected itag: {err}");
                ApiError::bad_request(INVALID_ITAG_MESSAGE)
            }),
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/formats", post(list_formats))
        .route("/download", post(download_video))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing(args.log_level)?;

    if !args.allow_root {
        ensure_not_root("backend")?;
    }

    let config = resolve_runtime_config(args.overrides())?;
    let host = parse_host_arg(&config.host)?;
    let state = build_state(&config).await?;
    let app = build_router(state);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        output_dir = %config.output_dir.display(),
        "API server listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn build_state(config: &RuntimeConfig) -> Result<AppState> {
    ensure_program_available(&config.ytdlp, "--version").await?;
    ensure_program_available(&config.ffmpeg, "-version").await?;

    // Created once; every request afterwards assumes it exists.
    let paths = OutputPaths::prepare(&config.output_dir)?;
    let client = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;

    Ok(AppState {
        service: MediaService::new(
            YtDlp::new(&config.ytdlp),
            Fetcher::new(client),
            Ffmpeg::new(&config.ffmpeg),
            paths,
        ),
    })
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn list_formats(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<FormatsRequest>,
) -> ApiResult<Json<FormatsResponse>> {
    let url = require_url(payload.url)?;
    let response = state
        .service
        .list_formats(&url)
        .await
        .map_err(ApiError::from_formats_error)?;
    Ok(Json(response))
}

async fn download_video(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<DownloadVideoRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let url = require_url(payload.url)?;
    let request = DownloadRequest {
        url,
        video: parse_itag(payload.video_itag)?,
        audio: parse_itag(payload.audio_itag)?,
    };

    // Detached from the connection: a client hanging up does not cancel a
    // download or mux that already started.
    let service = state.service.clone();
    let outcome = tokio::spawn(async move { service.download(request).await })
        .await
        .map_err(|err| {
            error!("/download task failed: {err}");
            ApiError::internal(format!("{PROCESS_ERROR_PREFIX}: {err}"))
        })?
        .map_err(ApiError::from_download_error)?;

    info!(
        video_id = %outcome.video_id,
        video_itag = %outcome.video_itag,
        audio_itag = %outcome.audio_itag,
        output = %outcome.output.display(),
        "download request completed"
    );
    let file = outcome
        .output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Json(DownloadResponse {
        message: SUCCESS_MESSAGE.to_string(),
        file,
    }))
}
