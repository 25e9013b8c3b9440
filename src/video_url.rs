#![forbid(unsafe_code)]

//! Recognises YouTube watch/short/embed URLs and extracts the canonical video
//! id used to name output files.

use std::fmt;

use url::Url;

use crate::error::{ServiceError, ServiceResult};

const QUERY_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "gaming.youtube.com",
];
const PATH_HOSTS: &[&str] = &["youtube.com", "www.youtube.com"];
const PATH_PREFIXES: &[&str] = &["embed", "v", "shorts", "live"];
const SHORT_HOST: &str = "youtu.be";
const ID_LEN: usize = 11;

/// Canonical 11-character video id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoId(String);

impl VideoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns `true` when `raw` is a supported video page URL.
pub fn validate_url(raw: &str) -> bool {
    parse_video_id(raw).is_ok()
}

/// Parses `raw` and returns the video id it points at.
pub fn parse_video_id(raw: &str) -> ServiceResult<VideoId> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|err| ServiceError::InvalidUrl(format!("{trimmed}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ServiceError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .map(|host| host.to_ascii_lowercase())
        .ok_or_else(|| ServiceError::InvalidUrl(format!("{trimmed}: missing host")))?;

    let candidate = id_from_query(&url, &host).or_else(|| id_from_path(&url, &host));
    let Some(candidate) = candidate else {
        return Err(ServiceError::InvalidUrl(format!(
            "no video id found in {trimmed}"
        )));
    };

    if !is_valid_id(&candidate) {
        return Err(ServiceError::InvalidUrl(format!(
            "video id {candidate} does not match the expected format"
        )));
    }
    Ok(VideoId(candidate))
}

fn id_from_query(url: &Url, host: &str) -> Option<String> {
    if !QUERY_HOSTS.contains(&host) {
        return None;
    }
    url.query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn id_from_path(url: &Url, host: &str) -> Option<String> {
    let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
    if host == SHORT_HOST {
        return segments.next().map(str::to_string);
    }
    if !PATH_HOSTS.contains(&host) {
        return None;
    }
    let prefix = segments.next()?;
    if !PATH_PREFIXES.contains(&prefix) {
        return None;
    }
    segments.next().map(str::to_string)
}

fn is_valid_id(value: &str) -> bool {
    value.len() == ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
