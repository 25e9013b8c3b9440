#![forbid(unsafe_code)]

//! On-disk layout of the output directory.
//!
//! Temporary and staged files carry a per-request token so two requests for
//! the same video never write to the same path. Only the final `<id>.mp4` is
//! shared, and it is replaced by rename.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::formats::{EncodingDescriptor, MediaKind};
use crate::video_url::VideoId;

pub const OUTPUT_EXTENSION: &str = "mp4";

/// Output directory that is known to exist.
#[derive(Debug)]
pub struct OutputPaths {
    root: PathBuf,
    epoch: i64,
    counter: AtomicUsize,
}

impl OutputPaths {
    /// Creates `root` if needed. Called once at start-up.
    pub fn prepare(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
        Ok(Self {
            root,
            epoch: Utc::now().timestamp_millis(),
            counter: AtomicUsize::new(1),
        })
    }

    /// Allocates the paths used by a single download request.
    pub fn for_request(&self, id: &VideoId) -> RequestPaths {
        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        RequestPaths {
            root: self.root.clone(),
            id: id.as_str().to_string(),
            token: format!("{}-{serial}", self.epoch),
        }
    }
}

/// Paths owned by one `/download` request.
#[derive(Debug, Clone)]
pub struct RequestPaths {
    root: PathBuf,
    id: String,
    token: String,
}

impl RequestPaths {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// `<id>_<token>_<kind>.<ext>`
    pub fn temp_file(&self, kind: MediaKind, format: &EncodingDescriptor) -> PathBuf {
        self.root.join(format!(
            "{}_{}_{}.{}",
            self.id,
            self.token,
            kind.as_str(),
            format.file_extension()
        ))
    }

    /// Where ffmpeg writes before the rename onto [`Self::final_output`].
    pub fn staged_output(&self) -> PathBuf {
        self.root.join(format!("{}_{}.{OUTPUT_EXTENSION}", self.id, self.token))
    }

    pub fn final_output(&self) -> PathBuf {
        self.root.join(format!("{}.{OUTPUT_EXTENSION}", self.id))
    }
}
