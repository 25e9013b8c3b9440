#![forbid(unsafe_code)]

//! The two operations behind the HTTP endpoints.
//!
//! `/download` walks Validating → ResolvingMetadata → SelectingFormats →
//! Downloading (video and audio in parallel) → Muxing → CleaningUp. The first
//! failing stage ends the request; nothing is retried.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{ServiceError, ServiceResult};
use crate::extractor::YtDlp;
use crate::fetcher::{DownloadJob, DownloadReport, Fetcher};
use crate::formats::{FormatListing, FormatsResponse, MediaKind, QualityRequest, select_format};
use crate::muxer::{Ffmpeg, MuxJob};
use crate::paths::OutputPaths;
use crate::video_url::{VideoId, parse_video_id};

/// What the caller asked `/download` to do.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub video: Option<QualityRequest>,
    pub audio: Option<QualityRequest>,
}

/// Result of a successful `/download`.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub video_id: VideoId,
    pub output: PathBuf,
    pub video_itag: String,
    pub audio_itag: String,
}

#[derive(Debug, Clone)]
pub struct MediaService {
    inner: Arc<MediaServiceInner>,
}

#[derive(Debug)]
struct MediaServiceInner {
    extractor: YtDlp,
    fetcher: Fetcher,
    muxer: Ffmpeg,
    paths: OutputPaths,
}

impl MediaService {
    pub fn new(extractor: YtDlp, fetcher: Fetcher, muxer: Ffmpeg, paths: OutputPaths) -> Self {
        Self {
            inner: Arc::new(MediaServiceInner {
                extractor,
                fetcher,
                muxer,
                paths,
            }),
        }
    }

    /// Lists video-only and audio-only formats for `url`, best first.
    pub async fn list_formats(&self, url: &str) -> ServiceResult<FormatsResponse> {
        let video_id = parse_video_id(url)?;
        let info = self.inner.extractor.fetch_info(url.trim()).await?;
        let listing = FormatListing::from_formats(&info.formats);
        info!(
            video_id = %video_id,
            video = listing.video.len(),
            audio = listing.audio.len(),
            "formats listed"
        );
        Ok(listing.to_response())
    }

    /// Downloads the selected video and audio formats and muxes them into
    /// `<id>.mp4`.
    pub async fn download(&self, request: DownloadRequest) -> ServiceResult<DownloadOutcome> {
        let video_id = parse_video_id(&request.url)?;
        let url = request.url.trim().to_string();

        let info = self.inner.extractor.fetch_info(&url).await?;
        let listing = FormatListing::from_formats(&info.formats);
        let video_format = select_format(
            MediaKind::Video,
            request.video.as_ref(),
            &listing,
            &info.formats,
        )?;
        let audio_format = select_format(
            MediaKind::Audio,
            request.audio.as_ref(),
            &listing,
            &info.formats,
        )?;
        info!(
            video_id = %video_id,
            video_itag = %video_format.itag,
            audio_itag = %audio_format.itag,
            "formats selected"
        );

        let paths = self.inner.paths.for_request(&video_id);
        let video_job = DownloadJob {
            source_url: url.clone(),
            destination: paths.temp_file(MediaKind::Video, &video_format),
            format: video_format,
            kind: MediaKind::Video,
        };
        let audio_job = DownloadJob {
            source_url: url,
            destination: paths.temp_file(MediaKind::Audio, &audio_format),
            format: audio_format,
            kind: MediaKind::Audio,
        };
        let video_itag = video_job.format.itag.clone();
        let audio_itag = audio_job.format.itag.clone();

        // Each transfer runs as its own task: if one fails the other is
        // detached, not cancelled, and finishes writing in the background.
        let video_task = self.spawn_fetch(video_job);
        let audio_task = self.spawn_fetch(audio_job);
        let (video, audio) = tokio::try_join!(join_fetch(video_task), join_fetch(audio_task))?;

        let output = self
            .inner
            .muxer
            .mux(&MuxJob {
                video: video.path,
                audio: audio.path,
                staged: paths.staged_output(),
                output: paths.final_output(),
            })
            .await
            .inspect_err(|err| error!(video_id = %video_id, "mux failed: {err}"))?;

        Ok(DownloadOutcome {
            video_id,
            output,
            video_itag,
            audio_itag,
        })
    }

    fn spawn_fetch(&self, job: DownloadJob) -> JoinHandle<ServiceResult<DownloadReport>> {
        let fetcher = self.inner.fetcher.clone();
        tokio::spawn(async move { fetcher.fetch(job).await })
    }
}

async fn join_fetch(
    task: JoinHandle<ServiceResult<DownloadReport>>,
) -> ServiceResult<DownloadReport> {
    match task.await {
        Ok(result) => result,
        Err(err) => Err(ServiceError::DownloadFailed {
            path: PathBuf::new(),
            reason: format!("download task aborted: {err}"),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};
    use reqwest::Client;
    use std::fs;
    use std::net::SocketAddr;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    const WATCH_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    const CONCAT_FFMPEG: &str = r#"inputs=""
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-i" ]; then
    shift
    inputs="$inputs $1"
  fi
  out="$1"
  shift
done
cat $inputs > "$out""#;

    struct Harness {
        dir: TempDir,
        service: MediaService,
        calls: PathBuf,
    }

    impl Harness {
        fn output_dir(&self) -> PathBuf {
            self.dir.path().join("videos")
        }

        fn output_files(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.output_dir())
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        fn ffmpeg_ran(&self) -> bool {
            self.calls.exists()
        }
    }

    fn install_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    /// The 1080p/480p + 128k/160k scenario, served by the test origin.
    fn scenario_json(addr: SocketAddr, video_path: &str) -> String {
        format!(
            r#"{{"id":"dQw4w9WgXcQ","title":"Sample","formats":[
{{"format_id":"135","ext":"mp4","vcodec":"avc1.4d401e","acodec":"none","height":480,"width":854,"format_note":"480p","tbr":1500,"url":"http://{addr}/v480","protocol":"http"}},
{{"format_id":"140","ext":"m4a","vcodec":"none","acodec":"mp4a.40.2","abr":128,"url":"http://{addr}/a128","protocol":"http"}},
{{"format_id":"137","ext":"mp4","vcodec":"avc1.640028","acodec":"none","height":1080,"width":1920,"format_note":"1080p","tbr":5000,"url":"http://{addr}{video_path}","protocol":"http"}},
{{"format_id":"251","ext":"webm","vcodec":"none","acodec":"opus","abr":160,"url":"http://{addr}/a160","protocol":"http"}}
]}}"#
        )
    }

    async fn spawn_origin() -> SocketAddr {
        let app = Router::new()
            .route("/v1080", get(|| async { "V1080" }))
            .route("/v480", get(|| async { "V480" }))
            .route("/a128", get(|| async { "A128" }))
            .route(
                "/a160",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    "A160"
                }),
            )
            .route(
                "/broken",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "nope") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn harness(video_path: &str, ffmpeg_body: &str) -> Harness {
        let addr = spawn_origin().await;
        let dir = tempdir().unwrap();
        let ytdlp = dir.path().join("yt-dlp");
        let ffmpeg = dir.path().join("ffmpeg");
        let calls = dir.path().join("ffmpeg.calls");
        install_script(
            &ytdlp,
            &format!("cat <<'JSON'\n{}\nJSON", scenario_json(addr, video_path)),
        );
        install_script(
            &ffmpeg,
            &format!("touch '{}'\n{ffmpeg_body}", calls.display()),
        );

        let paths = OutputPaths::prepare(dir.path().join("videos")).unwrap();
        let service = MediaService::new(
            YtDlp::new(ytdlp),
            Fetcher::new(Client::builder().no_proxy().build().unwrap()),
            Ffmpeg::new(ffmpeg),
            paths,
        );
        Harness {
            dir,
            service,
            calls,
        }
    }

    #[tokio::test]
    async fn list_formats_orders_scenario() {
        let h = harness("/v1080", CONCAT_FFMPEG).await;
        let response = h.service.list_formats(WATCH_URL).await.unwrap();
        let video: Vec<_> = response
            .video_formats
            .iter()
            .map(|f| f.quality_label.as_str())
            .collect();
        let audio: Vec<_> = response
            .audio_formats
            .iter()
            .map(|f| f.audio_bitrate)
            .collect();
        assert_eq!(video, ["1080p", "480p"]);
        assert_eq!(audio, [160, 128]);
        assert_eq!(response.video_formats[0].bitrate, 5_000_000);
    }

    #[tokio::test]
    async fn download_defaults_to_best_formats_and_cleans_up() {
        let h = harness("/v1080", CONCAT_FFMPEG).await;
        let outcome = h
            .service
            .download(DownloadRequest {
                url: WATCH_URL.into(),
                ..DownloadRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.video_itag, "137");
        assert_eq!(outcome.audio_itag, "251");
        assert_eq!(outcome.output, h.output_dir().join("dQw4w9WgXcQ.mp4"));
        assert_eq!(fs::read_to_string(&outcome.output).unwrap(), "V1080A160");
        assert_eq!(h.output_files(), ["dQw4w9WgXcQ.mp4"]);
    }

    #[tokio::test]
    async fn download_honours_requested_itags() {
        let h = harness("/v1080", CONCAT_FFMPEG).await;
        let outcome = h
            .service
            .download(DownloadRequest {
                url: WATCH_URL.into(),
                video: QualityRequest::parse("135"),
                audio: QualityRequest::parse("lowest"),
            })
            .await
            .unwrap();
        assert_eq!(outcome.video_itag, "135");
        assert_eq!(outcome.audio_itag, "140");
        assert_eq!(fs::read_to_string(&outcome.output).unwrap(), "V480A128");
    }

    #[tokio::test]
    async fn unknown_itag_fails_before_downloading() {
        let h = harness("/v1080", CONCAT_FFMPEG).await;
        let err = h
            .service
            .download(DownloadRequest {
                url: WATCH_URL.into(),
                video: QualityRequest::parse("999"),
                audio: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoSuitableFormat { .. }));
        assert!(h.output_files().is_empty());
    }

    #[tokio::test]
    async fn download_failure_never_reaches_mux() {
        let h = harness("/broken", CONCAT_FFMPEG).await;
        let err = h
            .service
            .download(DownloadRequest {
                url: WATCH_URL.into(),
                ..DownloadRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DownloadFailed { .. }));
        assert!(!h.ffmpeg_ran());
    }

    #[tokio::test]
    async fn mux_failure_leaves_temp_files() {
        let h = harness("/v1080", "echo 'mux exploded' >&2\nexit 1").await;
        let err = h
            .service
            .download(DownloadRequest {
                url: WATCH_URL.into(),
                ..DownloadRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::MuxFailed(_)));
        assert!(h.ffmpeg_ran());

        let files = h.output_files();
        assert!(files.iter().any(|name| name.ends_with("_video.mp4")));
        assert!(files.iter().any(|name| name.ends_with("_audio.webm")));
        assert!(!files.contains(&"dQw4w9WgXcQ.mp4".to_string()));
    }

    #[tokio::test]
    async fn invalid_url_touches_nothing() {
        let h = harness("/v1080", CONCAT_FFMPEG).await;
        fs::remove_file(h.dir.path().join("yt-dlp")).unwrap();

        let err = h
            .service
            .list_formats("https://vimeo.com/12345")
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        let err = h
            .service
            .download(DownloadRequest {
                url: "not a url".into(),
                ..DownloadRequest::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(h.output_files().is_empty());
        assert!(!h.ffmpeg_ran());
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_video_do_not_collide() {
        let h = harness("/v1080", CONCAT_FFMPEG).await;
        let request = DownloadRequest {
            url: WATCH_URL.into(),
            ..DownloadRequest::default()
        };
        let (first, second) = tokio::join!(
            h.service.download(request.clone()),
            h.service.download(request)
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(h.output_files(), ["dQw4w9WgXcQ.mp4"]);
        assert_eq!(
            fs::read_to_string(h.output_dir().join("dQw4w9WgXcQ.mp4")).unwrap(),
            "V1080A160"
        );
    }
}
