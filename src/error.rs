use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Everything an extraction or download request can fail with.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Navigation failed, a login wall persisted, or the site said the
    /// content does not exist, on every address variant tried.
    #[error("page unavailable: {0}")]
    PageUnavailable(String),

    #[error("video not found or inaccessible")]
    NoCandidatesFound,

    /// Recovered by the download handler: the caller gets the unmerged URLs.
    #[error("remux failed: {0}")]
    RemuxFailed(String),

    #[error("download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("browser error: {0}")]
    Browser(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExtractError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ExtractError::PageUnavailable(_) | ExtractError::NoCandidatesFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn user_message(&self) -> String {
        match self {
            ExtractError::PageUnavailable(_) => {
                "The page could not be opened. Make sure the video is public and the link is correct.".to_string()
            }
            ExtractError::NoCandidatesFound => "Video not found or inaccessible".to_string(),
            other => other.to_string(),
        }
    }
}

/// Unreadable request bodies are answered with the same envelope as
/// every other failure.
impl From<JsonRejection> for ExtractError {
    fn from(rejection: JsonRejection) -> Self {
        ExtractError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ExtractError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::warn!("request rejected: {}", self);
        }
        let body = Json(json!({
            "status": "error",
            "message": self.user_message(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_family_maps_to_404() {
        assert_eq!(ExtractError::NoCandidatesFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ExtractError::PageUnavailable("login wall".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn download_failure_is_a_server_error() {
        let err = ExtractError::DownloadFailed {
            url: "https://video.example/v.mp4".into(),
            reason: "HTTP 403".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("HTTP 403"));
    }

    #[test]
    fn invalid_request_is_a_client_error() {
        let err = ExtractError::InvalidRequest("missing url".into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn no_candidates_response_is_a_404_envelope() {
        let response = ExtractError::NoCandidatesFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Video not found or inaccessible");
    }
}
