#![forbid(unsafe_code)]

//! Format ordering and selection.
//!
//! Everything in here works on [`EncodingDescriptor`]s already resolved by the
//! extractor, so the rules can be exercised without touching the network.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

const UNKNOWN: &str = "unknown";

/// One encoded rendition of the source video, as reported by the extractor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingDescriptor {
    pub itag: String,
    pub container: Option<String>,
    pub quality_label: Option<String>,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    /// Total bitrate in bits per second.
    pub bitrate: Option<u64>,
    pub fps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
    /// Audio bitrate in kbit/s.
    pub audio_bitrate: Option<u64>,
    pub audio_codec: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub http_headers: HashMap<String, String>,
    /// Byte size of each ranged request, when the host expects chunked fetches.
    pub chunk_size: Option<u64>,
}

impl EncodingDescriptor {
    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }

    /// Leading integer of the quality label (`"1080p60"` → 1080), 0 otherwise.
    pub fn quality_rank(&self) -> u64 {
        self.quality_label
            .as_deref()
            .map(leading_integer)
            .unwrap_or(0)
    }

    /// Extension used for temporary files holding this encoding.
    pub fn file_extension(&self) -> &str {
        self.container
            .as_deref()
            .filter(|ext| !ext.is_empty())
            .unwrap_or("mp4")
    }
}

/// Parses the leading integer of `value` the way a lenient `parseInt` would.
/// Negative or missing numbers rank as 0.
pub fn leading_integer(value: &str) -> u64 {
    let trimmed = value.trim_start();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let digits: String = unsigned.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u64>().unwrap_or(0)
}

fn compare_video(a: &EncodingDescriptor, b: &EncodingDescriptor) -> Ordering {
    b.quality_rank()
        .cmp(&a.quality_rank())
        .then_with(|| b.bitrate.unwrap_or(0).cmp(&a.bitrate.unwrap_or(0)))
}

fn compare_audio(a: &EncodingDescriptor, b: &EncodingDescriptor) -> Ordering {
    b.audio_bitrate
        .unwrap_or(0)
        .cmp(&a.audio_bitrate.unwrap_or(0))
}

/// Video-only and audio-only candidates, best first.
#[derive(Debug, Clone, Default)]
pub struct FormatListing {
    pub video: Vec<EncodingDescriptor>,
    pub audio: Vec<EncodingDescriptor>,
}

impl FormatListing {
    pub fn from_formats(formats: &[EncodingDescriptor]) -> Self {
        let mut video: Vec<EncodingDescriptor> = formats
            .iter()
            .filter(|format| format.is_video_only())
            .cloned()
            .collect();
        video.sort_by(compare_video);

        let mut audio: Vec<EncodingDescriptor> = formats
            .iter()
            .filter(|format| format.is_audio_only())
            .cloned()
            .collect();
        audio.sort_by(compare_audio);

        Self { video, audio }
    }

    pub fn to_response(&self) -> FormatsResponse {
        FormatsResponse {
            video_formats: self.video.iter().map(VideoFormat::from).collect(),
            audio_formats: self.audio.iter().map(AudioFormat::from).collect(),
        }
    }
}

/// Body returned by `POST /formats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormatsResponse {
    pub video_formats: Vec<VideoFormat>,
    pub audio_formats: Vec<AudioFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormat {
    pub itag: String,
    pub container: String,
    pub quality_label: String,
    pub codecs: String,
    pub mime_type: String,
    pub bitrate: u64,
    pub fps: u32,
    pub video_codec: String,
    pub resolution: String,
}

impl From<&EncodingDescriptor> for VideoFormat {
    fn from(format: &EncodingDescriptor) -> Self {
        Self {
            itag: format.itag.clone(),
            container: or_unknown(format.container.as_deref()),
            quality_label: or_unknown(format.quality_label.as_deref()),
            codecs: or_unknown(format.codecs.as_deref()),
            mime_type: or_unknown(format.mime_type.as_deref()),
            bitrate: format.bitrate.unwrap_or(0),
            fps: format.fps.unwrap_or(0),
            video_codec: or_unknown(format.video_codec.as_deref()),
            resolution: format!(
                "{}x{}",
                dimension(format.width),
                dimension(format.height)
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub itag: String,
    pub container: String,
    pub codecs: String,
    pub mime_type: String,
    pub audio_bitrate: u64,
    pub audio_codec: String,
}

impl From<&EncodingDescriptor> for AudioFormat {
    fn from(format: &EncodingDescriptor) -> Self {
        Self {
            itag: format.itag.clone(),
            container: or_unknown(format.container.as_deref()),
            codecs: or_unknown(format.codecs.as_deref()),
            mime_type: or_unknown(format.mime_type.as_deref()),
            audio_bitrate: format.audio_bitrate.unwrap_or(0),
            audio_codec: or_unknown(format.audio_codec.as_deref()),
        }
    }
}

fn or_unknown(value: Option<&str>) -> String {
    value
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

fn dimension(value: Option<u32>) -> String {
    match value {
        Some(value) if value > 0 => value.to_string(),
        _ => UNKNOWN.to_string(),
    }
}

/// Which half of the mux a selection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Caller-supplied format request: an exact itag or a quality keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityRequest {
    Itag(String),
    Highest,
    Lowest,
    HighestVideo,
    LowestVideo,
    HighestAudio,
    LowestAudio,
}

impl QualityRequest {
    /// Returns `None` for blank input, which callers treat as "pick the best".
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        let request = match trimmed.to_ascii_lowercase().as_str() {
            "highest" => Self::Highest,
            "lowest" => Self::Lowest,
            "highestvideo" => Self::HighestVideo,
            "lowestvideo" => Self::LowestVideo,
            "highestaudio" => Self::HighestAudio,
            "lowestaudio" => Self::LowestAudio,
            _ => Self::Itag(trimmed.to_string()),
        };
        Some(request)
    }
}

/// Raw `videoItag`/`audioItag` value; clients send either a number or a string.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ItagParam {
    Number(u64),
    Text(String),
}

impl ItagParam {
    /// Zero and the empty string count as "not provided".
    pub fn to_request(&self) -> Option<QualityRequest> {
        match self {
            Self::Number(0) => None,
            Self::Number(value) => Some(QualityRequest::Itag(value.to_string())),
            Self::Text(value) => QualityRequest::parse(value),
        }
    }
}

/// Picks the format for one half of the mux.
///
/// Without a request the best entry of the sorted listing wins. An itag is
/// matched against every format, including muxed ones.
pub fn select_format(
    kind: MediaKind,
    request: Option<&QualityRequest>,
    listing: &FormatListing,
    all_formats: &[EncodingDescriptor],
) -> ServiceResult<EncodingDescriptor> {
    let own_list = match kind {
        MediaKind::Video => &listing.video,
        MediaKind::Audio => &listing.audio,
    };
    let chosen = match request {
        None | Some(QualityRequest::Highest) => own_list.first(),
        Some(QualityRequest::Lowest) => own_list.last(),
        Some(QualityRequest::HighestVideo) => listing.video.first(),
        Some(QualityRequest::LowestVideo) => listing.video.last(),
        Some(QualityRequest::HighestAudio) => listing.audio.first(),
        Some(QualityRequest::LowestAudio) => listing.audio.last(),
        Some(QualityRequest::Itag(itag)) => all_formats.iter().find(|format| &format.itag == itag),
    };

    chosen.cloned().ok_or_else(|| ServiceError::NoSuitableFormat {
        kind: kind.as_str(),
        reason: match request {
            Some(QualityRequest::Itag(itag)) => format!("no such format found: {itag}"),
            _ => "no candidates available".to_string(),
        },
    })
}
