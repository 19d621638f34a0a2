use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::HOST, HeaderMap},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::browser::SessionSource;
use crate::config::AppConfig;
use crate::error::ExtractError;
use crate::extractor::{self, VideoData};
use crate::remux::RemuxOrchestrator;
use crate::storage::TempStorage;

pub struct AppState {
    pub config: AppConfig,
    pub sessions: Arc<dyn SessionSource>,
    pub storage: TempStorage,
    pub remux: RemuxOrchestrator,
}

#[derive(Deserialize, ToSchema)]
pub struct FetchVideoRequest {
    /// Address of the page hosting the video.
    pub url: String,
}

#[derive(Serialize, ToSchema)]
pub struct FetchVideoResponse {
    #[schema(example = "success")]
    pub status: String,
    pub data: VideoData,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
    pub quality: Option<String>,
    pub merge_audio: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    Merged,
    VideoOnly,
    AudioOnly,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownloadData {
    pub download_url: String,
    pub quality: String,
    #[serde(rename = "type")]
    pub kind: DownloadKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    pub merged: bool,
}

#[derive(Serialize, ToSchema)]
pub struct DownloadResponse {
    #[schema(example = "success")]
    pub status: String,
    pub data: DownloadData,
}

/// Shape of every failed response.
#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    #[schema(example = "error")]
    pub status: String,
    pub message: String,
}

#[utoipa::path(
    post,
    path = "/fetch-video-data",
    request_body = FetchVideoRequest,
    responses(
        (status = 200, description = "Streams found", body = FetchVideoResponse),
        (status = 400, description = "Missing or malformed url", body = ErrorBody),
        (status = 404, description = "Video not found or inaccessible", body = ErrorBody),
        (status = 500, description = "Unexpected failure", body = ErrorBody)
    ),
    tag = "media"
)]
pub async fn fetch_video_data(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FetchVideoRequest>, JsonRejection>,
) -> Result<Json<FetchVideoResponse>, ExtractError> {
    let Json(payload) = payload?;
    let address = payload.url.trim();
    if !(address.starts_with("http://") || address.starts_with("https://")) {
        return Err(ExtractError::InvalidRequest("url must be an http(s) address".to_string()));
    }

    info!("Fetching video data for {}", address);
    let data = extractor::extract(state.sessions.as_ref(), address, &state.config).await?;

    Ok(Json(FetchVideoResponse {
        status: "success".to_string(),
        data,
    }))
}

#[utoipa::path(
    post,
    path = "/download-video",
    request_body = DownloadRequest,
    responses(
        (status = 200, description = "Download ready", body = DownloadResponse),
        (status = 400, description = "Malformed body or no stream given", body = ErrorBody),
        (status = 500, description = "A stream could not be fetched", body = ErrorBody)
    ),
    tag = "media"
)]
pub async fn download_video(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ExtractError> {
    let Json(payload) = payload?;
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let video_url = non_empty(payload.video_url);
    let audio_url = non_empty(payload.audio_url);
    let quality = non_empty(payload.quality).unwrap_or_else(|| "available".to_string());
    let merge = payload.merge_audio.unwrap_or(false);

    let data = match (video_url, audio_url) {
        (None, None) => {
            return Err(ExtractError::InvalidRequest("videoUrl or audioUrl is required".to_string()));
        }
        (None, Some(audio)) => DownloadData {
            download_url: audio,
            quality,
            kind: DownloadKind::AudioOnly,
            audio_url: None,
            merged: false,
        },
        (Some(video), Some(audio)) if merge => match state.remux.merge(&video, &audio).await {
            Ok(path) => {
                let base = base_url(&state.config, &headers);
                let download_url = state
                    .storage
                    .public_url(&base, &path)
                    .ok_or_else(|| anyhow::anyhow!("merged file has no usable name: {}", path.display()))?;
                DownloadData {
                    download_url,
                    quality,
                    kind: DownloadKind::Merged,
                    audio_url: None,
                    merged: true,
                }
            }
            Err(ExtractError::RemuxFailed(reason)) => {
                warn!("Remux failed, returning separate streams: {}", reason);
                DownloadData {
                    download_url: video,
                    quality,
                    kind: DownloadKind::VideoOnly,
                    audio_url: Some(audio),
                    merged: false,
                }
            }
            Err(e) => return Err(e),
        },
        (Some(video), audio) => DownloadData {
            download_url: video,
            quality,
            kind: DownloadKind::VideoOnly,
            audio_url: audio,
            merged: false,
        },
    };

    Ok(Json(DownloadResponse {
        status: "success".to_string(),
        data,
    }))
}

/// `PUBLIC_BASE_URL` when configured, else `http://<Host header>`.
fn base_url(config: &AppConfig, headers: &HeaderMap) -> String {
    if let Some(base) = &config.public_base_url {
        return base.clone();
    }
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| format!("localhost:{}", config.port));
    format!("http://{}", host)
}
