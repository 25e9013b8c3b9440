#![forbid(unsafe_code)]

//! yt-dlp backed metadata client.
//!
//! `yt-dlp --dump-single-json` reports every format together with its direct
//! media URL and the headers the origin expects, which is all the downloader
//! needs. Only the fields we read are modelled; everything is optional because
//! older uploads frequently lack metadata.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ServiceError, ServiceResult};
use crate::formats::EncodingDescriptor;

/// Subset of the yt-dlp info JSON.
#[derive(Debug, Deserialize)]
struct InfoJson {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    format_id: Option<String>,
    format_note: Option<String>,
    ext: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    tbr: Option<f64>,
    abr: Option<f64>,
    url: Option<String>,
    protocol: Option<String>,
    http_headers: Option<HashMap<String, String>>,
    downloader_options: Option<DownloaderOptions>,
}

#[derive(Debug, Deserialize)]
struct DownloaderOptions {
    http_chunk_size: Option<u64>,
}

/// Resolved metadata for one video.
#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub formats: Vec<EncodingDescriptor>,
}

/// Handle on the yt-dlp executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs yt-dlp against `url` and returns every format it knows about.
    pub async fn fetch_info(&self, url: &str) -> ServiceResult<VideoInfo> {
        let started = Instant::now();
        debug!(program = %self.program.display(), url, "fetching video metadata");
        let output = Command::new(&self.program)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                ServiceError::ExtractionFailure(format!(
                    "launching {}: {err}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(ServiceError::ExtractionFailure(if detail.is_empty() {
                format!("yt-dlp exited with {}", output.status)
            } else {
                detail.to_string()
            }));
        }

        let info = parse_info_json(&output.stdout)?;
        info!(
            video_id = info.id.as_deref().unwrap_or("?"),
            formats = info.formats.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "metadata resolved"
        );
        Ok(info)
    }
}

fn parse_info_json(raw: &[u8]) -> ServiceResult<VideoInfo> {
    let info: InfoJson = serde_json::from_slice(raw).map_err(|err| {
        ServiceError::ExtractionFailure(format!("parsing yt-dlp metadata response: {err}"))
    })?;
    Ok(VideoInfo {
        id: info.id,
        title: info.title,
        formats: info
            .formats
            .into_iter()
            .filter_map(build_descriptor)
            .collect(),
    })
}

/// Translates a yt-dlp format entry into an [`EncodingDescriptor`]. Entries
/// without a `format_id` cannot be requested again and are dropped.
fn build_descriptor(format: FormatInfo) -> Option<EncodingDescriptor> {
    let itag = format.format_id.filter(|id| !id.trim().is_empty())?;
    let video_codec = real_codec(format.vcodec);
    let audio_codec = real_codec(format.acodec);
    let has_video = video_codec.is_some();
    let has_audio = audio_codec.is_some();

    let codecs = {
        let parts: Vec<&str> = [video_codec.as_deref(), audio_codec.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    };
    let container = format.ext.filter(|ext| !ext.is_empty() && ext != "none");
    let mime_type = match (&container, &codecs) {
        (Some(ext), Some(codecs)) => Some(format!(
            "{}/{}; codecs=\"{codecs}\"",
            if has_video { "video" } else { "audio" },
            mime_subtype(ext)
        )),
        _ => None,
    };
    let quality_label = format
        .format_note
        .filter(|note| note.starts_with(|c: char| c.is_ascii_digit()))
        .or_else(|| format.height.map(|height| format!("{height}p")));

    Some(EncodingDescriptor {
        itag,
        container,
        quality_label: if has_video { quality_label } else { None },
        codecs,
        mime_type,
        bitrate: positive_rate(format.tbr).map(|kbps| (kbps * 1000.0).round() as u64),
        fps: positive_rate(format.fps).map(|fps| fps.round() as u32),
        width: format.width,
        height: format.height,
        video_codec,
        audio_bitrate: positive_rate(format.abr).map(|kbps| kbps.round() as u64),
        audio_codec,
        has_video,
        has_audio,
        url: format.url,
        protocol: format.protocol,
        http_headers: format.http_headers.unwrap_or_default(),
        chunk_size: format
            .downloader_options
            .and_then(|options| options.http_chunk_size)
            .filter(|size| *size > 0),
    })
}

fn real_codec(value: Option<String>) -> Option<String> {
    value.filter(|codec| !codec.is_empty() && codec != "none")
}

fn positive_rate(value: Option<f64>) -> Option<f64> {
    value.filter(|rate| rate.is_finite() && *rate > 0.0)
}

fn mime_subtype(ext: &str) -> &str {
    match ext {
        "m4a" | "mp4" => "mp4",
        "weba" | "webm" => "webm",
        "3gp" => "3gpp",
        other => other,
    }
}
