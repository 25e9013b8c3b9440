#![forbid(unsafe_code)]

//! Shared building blocks for the tubemux backend: URL parsing, yt-dlp
//! metadata, format ordering, streaming downloads and the ffmpeg mux step.

pub mod config;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod formats;
pub mod muxer;
pub mod paths;
pub mod pipeline;
pub mod preflight;
pub mod telemetry;
pub mod video_url;
