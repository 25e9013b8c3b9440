#![forbid(unsafe_code)]

//! ffmpeg stream-copy mux of one video-only and one audio-only file.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};

/// Inputs and outputs of one mux run.
#[derive(Debug, Clone)]
pub struct MuxJob {
    pub video: PathBuf,
    pub audio: PathBuf,
    /// File ffmpeg writes to.
    pub staged: PathBuf,
    /// Final location; the staged file is renamed here on success.
    pub output: PathBuf,
}

/// Handle on the ffmpeg executable.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Muxes without re-encoding, publishes the output and removes both inputs.
    ///
    /// On failure nothing is cleaned up: the inputs stay and the staged file
    /// may be partially written.
    pub async fn mux(&self, job: &MuxJob) -> ServiceResult<PathBuf> {
        debug!(
            video = %job.video.display(),
            audio = %job.audio.display(),
            staged = %job.staged.display(),
            "starting ffmpeg"
        );
        let output = Command::new(&self.program)
            .args(mux_args(job))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                ServiceError::MuxFailed(format!("launching {}: {err}", self.program.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(ServiceError::MuxFailed(if detail.is_empty() {
                format!("ffmpeg exited with {}", output.status)
            } else {
                detail.to_string()
            }));
        }

        fs::rename(&job.staged, &job.output).await.map_err(|err| {
            ServiceError::MuxFailed(format!(
                "moving {} to {}: {err}",
                job.staged.display(),
                job.output.display()
            ))
        })?;
        info!(output = %job.output.display(), "video and audio combined");

        for input in [&job.video, &job.audio] {
            if let Err(err) = fs::remove_file(input).await {
                warn!(path = %input.display(), "failed to remove temporary file: {err}");
            }
        }
        Ok(job.output.clone())
    }
}

fn mux_args(job: &MuxJob) -> Vec<&OsStr> {
    let flag = OsStr::new;
    vec![
        flag("-y"),
        flag("-nostdin"),
        flag("-loglevel"),
        flag("error"),
        flag("-i"),
        job.video.as_os_str(),
        flag("-i"),
        job.audio.as_os_str(),
        flag("-map"),
        flag("0:v:0"),
        flag("-map"),
        flag("1:a:0"),
        flag("-c"),
        flag("copy"),
        job.staged.as_os_str(),
    ]
}
