use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::header::{RANGE, USER_AGENT};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::browser::FALLBACK_USER_AGENT;
use crate::error::ExtractError;
use crate::storage::TempStorage;

/// Downloads one stream to a local file.
#[async_trait]
pub trait StreamFetcher: Send + Sync {
    /// Returns the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ExtractError>;
}

/// Combines a video-only and an audio-only file into one container.
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> anyhow::Result<()>;
}

// ============================================================================
// HTTP fetcher
// ============================================================================

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StreamFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ExtractError> {
        let failed = |reason: String| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .header(USER_AGENT, FALLBACK_USER_AGENT)
            .header(RANGE, "bytes=0-")
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(failed(format!("unexpected status {}", status)));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}

// ============================================================================
// ffmpeg remuxer
// ============================================================================

pub struct FfmpegRemuxer {
    ffmpeg_path: String,
}

impl FfmpegRemuxer {
    /// Uses `path` when given, else the first `ffmpeg` on `PATH`.
    pub fn new(path: Option<&Path>) -> Self {
        let ffmpeg_path = match path {
            Some(p) => p.to_string_lossy().to_string(),
            None => which::which("ffmpeg").map_or_else(|_| "ffmpeg".to_string(), |p| p.to_string_lossy().to_string()),
        };
        Self { ffmpeg_path }
    }

    fn build_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(video.to_string_lossy().to_string());
        args.push("-i".to_string());
        args.push(audio.to_string_lossy().to_string());
        args.extend(
            ["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac", "-shortest"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> anyhow::Result<()> {
        let args = Self::build_args(video, audio, output);
        debug!("Running {} {}", self.ffmpeg_path, args.join(" "));

        let result = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last_line = stderr.lines().last().unwrap_or_default();
            return Err(anyhow!("ffmpeg exited with status {}: {}", result.status, last_line));
        }
        if !output.exists() {
            return Err(anyhow!("ffmpeg reported success but wrote no output"));
        }
        Ok(())
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// Removes its file when dropped unless kept.
struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed temp file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", self.path.display(), e),
        }
    }
}

pub struct RemuxOrchestrator {
    storage: TempStorage,
    fetcher: Arc<dyn StreamFetcher>,
    remuxer: Arc<dyn Remuxer>,
}

impl RemuxOrchestrator {
    pub fn new(storage: TempStorage, fetcher: Arc<dyn StreamFetcher>, remuxer: Arc<dyn Remuxer>) -> Self {
        Self {
            storage,
            fetcher,
            remuxer,
        }
    }

    /// Downloads both streams concurrently and merges them into a new file
    /// under the temp directory. Inputs are deleted on every exit path; the
    /// output only survives success.
    pub async fn merge(&self, video_url: &str, audio_url: &str) -> Result<PathBuf, ExtractError> {
        let video = TempFile::new(self.storage.unique_path("video", "mp4"));
        let audio = TempFile::new(self.storage.unique_path("audio", "m4a"));

        info!("Downloading video and audio streams for merge");
        let (video_bytes, audio_bytes) = tokio::try_join!(
            self.fetcher.fetch(video_url, video.path()),
            self.fetcher.fetch(audio_url, audio.path()),
        )?;
        debug!("Fetched {} video bytes, {} audio bytes", video_bytes, audio_bytes);

        let output = TempFile::new(self.storage.unique_path("merged", "mp4"));
        self.remuxer
            .remux(video.path(), audio.path(), output.path())
            .await
            .map_err(|e| ExtractError::RemuxFailed(e.to_string()))?;

        info!("Merged output at {}", output.path().display());
        Ok(output.keep())
    }
}
