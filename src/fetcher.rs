#![forbid(unsafe_code)]

//! Streams one encoding from its direct URL into a local file.

use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::error::{ServiceError, ServiceResult};
use crate::formats::{EncodingDescriptor, MediaKind};

/// One transfer: which encoding of which page goes to which file.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub source_url: String,
    pub format: EncodingDescriptor,
    pub destination: PathBuf,
    pub kind: MediaKind,
}

/// What a finished transfer wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Writes the job's encoding to its destination, replacing any existing
    /// file. A failed transfer leaves whatever was written on disk.
    pub async fn fetch(&self, job: DownloadJob) -> ServiceResult<DownloadReport> {
        let started = Instant::now();
        let result = self.stream_to_file(&job).await;
        match &result {
            Ok(report) => info!(
                kind = job.kind.as_str(),
                itag = %job.format.itag,
                path = %report.path.display(),
                seconds = %format!("{:.2}", started.elapsed().as_secs_f64()),
                size_mb = %format!("{:.2}", report.bytes as f64 / (1024.0 * 1024.0)),
                "download finished"
            ),
            Err(err) => error!(
                kind = job.kind.as_str(),
                itag = %job.format.itag,
                path = %job.destination.display(),
                source = %job.source_url,
                "download failed: {err}"
            ),
        }
        result
    }

    /// Downloads in one GET, or in `Range` requests of `chunk_size` bytes
    /// when the format asks for chunked fetches.
    async fn stream_to_file(&self, job: &DownloadJob) -> ServiceResult<DownloadReport> {
        let path = job.destination.as_path();
        let url = direct_url(&job.format).map_err(|reason| failed(path, reason))?;

        let mut file: Option<File> = None;
        let mut bytes = 0u64;
        loop {
            let range = job.format.chunk_size.map(|size| (bytes, bytes + size - 1));
            let mut request = self.client.get(url);
            for (name, value) in &job.format.http_headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some((start, end)) = range {
                request = request.header(RANGE, format!("bytes={start}-{end}"));
            }
            let response = request
                .send()
                .await
                .map_err(|err| failed(path, err.to_string()))?;

            // A previous chunk ended exactly at the end of the body.
            if bytes > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
                break;
            }
            let response = response
                .error_for_status()
                .map_err(|err| failed(path, err.to_string()))?;
            let partial = response.status() == StatusCode::PARTIAL_CONTENT;
            if bytes > 0 && !partial {
                return Err(failed(path, "server ignored the range request"));
            }
            let total = partial
                .then(|| content_range_total(response.headers()))
                .flatten();

            let out = match &mut file {
                Some(out) => out,
                None => file.insert(
                    File::create(path)
                        .await
                        .map_err(|err| failed(path, format!("creating file: {err}")))?,
                ),
            };
            let written = write_body(response, out, path).await?;
            bytes += written;
            debug!(path = %path.display(), written, bytes, "chunk written");

            let Some((start, end)) = range else {
                break;
            };
            let done = match total {
                Some(total) => bytes >= total,
                None => written < end - start + 1,
            };
            if !partial || written == 0 || done {
                break;
            }
        }

        if let Some(file) = &mut file {
            file.flush()
                .await
                .map_err(|err| failed(path, format!("flushing file: {err}")))?;
        }
        Ok(DownloadReport {
            path: job.destination.clone(),
            bytes,
        })
    }
}

async fn write_body(response: Response, file: &mut File, path: &Path) -> ServiceResult<u64> {
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let data = chunk.map_err(|err| failed(path, err.to_string()))?;
        file.write_all(&data)
            .await
            .map_err(|err| failed(path, format!("writing file: {err}")))?;
        written += data.len() as u64;
    }
    Ok(written)
}

/// Total length from `Content-Range: bytes 0-99/1234`, if the server knows it.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .parse()
        .ok()
}

fn direct_url(format: &EncodingDescriptor) -> Result<&str, String> {
    let url = format
        .url
        .as_deref()
        .ok_or_else(|| format!("format {} has no direct url", format.itag))?;
    if let Some(protocol) = format.protocol.as_deref()
        && !matches!(protocol, "http" | "https")
    {
        return Err(format!(
            "format {} uses unsupported protocol {protocol}",
            format.itag
        ));
    }
    Ok(url)
}

fn failed(path: &Path, reason: impl Into<String>) -> ServiceError {
    ServiceError::DownloadFailed {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
