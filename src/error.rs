#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

/// Failures a request can run into, one variant per pipeline stage.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid video url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    ExtractionFailure(String),
    #[error("no suitable {kind} format: {reason}")]
    NoSuitableFormat { kind: &'static str, reason: String },
    /// `path` is the local destination; it stays out of the message.
    #[error("download failed: {reason}")]
    DownloadFailed { path: PathBuf, reason: String },
    #[error("{0}")]
    MuxFailed(String),
}

impl ServiceError {
    /// `true` for failures caused by caller input rather than a collaborator.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidUrl(_))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
