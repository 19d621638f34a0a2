use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::browser::{open_page, SessionSource};
use crate::candidate::{quality_label, StreamCandidate};
use crate::collector::{collect, page_metadata, inspect_dom_video};
use crate::config::AppConfig;
use crate::error::ExtractError;
use crate::selector::{quality_ladder, select, Confidence, SelectionContext};
use crate::target::{mark_matches, resolve_target};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QualityOption {
    pub quality: Option<u32>,
    pub url: String,
    pub label: String,
}

/// Payload of a successful `fetch-video-data` call.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoData {
    pub name: String,
    pub thumbnail: Option<String>,
    pub video_url: Option<String>,
    pub qualities: Vec<QualityOption>,
    pub audio_url: Option<String>,
    pub duration: Option<f64>,
    pub description: Option<String>,
    pub quality: String,
    #[schema(value_type = String, example = "medium")]
    pub confidence: Confidence,
    /// `page_source`, `dom` or `network`.
    pub method: String,
}

/// Opens the page, collects candidates and picks the streams to return.
/// The page session is closed on every exit path.
pub async fn extract(
    source: &dyn SessionSource,
    address: &str,
    config: &AppConfig,
) -> Result<VideoData, ExtractError> {
    let page = open_page(source, address, config).await?;
    let session = page.session.shared();

    let html = session.content().unwrap_or_else(|e| {
        warn!("Could not read page content: {}", e);
        String::new()
    });
    let mut metadata = page_metadata(&html);

    let mut collection = collect(&session, &page.address, config).await?;

    let target = resolve_target(address);
    let matched = mark_matches(&mut collection.candidates, target.as_ref());
    info!(
        "Target {:?}: {} of {} candidates match",
        target.as_ref().map(|t| t.as_str()),
        matched,
        collection.candidates.len()
    );

    let context = SelectionContext {
        interaction_at: collection.interaction_at,
    };
    let selection = select(collection.candidates.as_slice(), &context);

    let method_source = selection.chosen_video.as_ref().or(selection.chosen_audio.as_ref());
    let Some(method_source) = method_source else {
        return Err(ExtractError::NoCandidatesFound);
    };
    let method = method_source.origin.method().to_string();

    if metadata.thumbnail.is_none() || metadata.duration.is_none() {
        let dom = match collection.dom_video.clone() {
            Some(dom) => Some(dom),
            None => inspect_dom_video(&session).await,
        };
        if let Some(dom) = dom {
            metadata.thumbnail = metadata.thumbnail.or(dom.poster);
            metadata.duration = metadata.duration.or(dom.duration);
        }
    }

    let qualities = match &selection.chosen_video {
        Some(chosen) => quality_ladder(collection.candidates.as_slice(), chosen)
            .into_iter()
            .map(quality_option)
            .collect(),
        None => Vec::new(),
    };

    Ok(VideoData {
        name: metadata.title.unwrap_or_else(|| "Video".to_string()),
        thumbnail: metadata.thumbnail,
        video_url: selection.chosen_video.as_ref().map(|c| c.url.clone()),
        qualities,
        audio_url: selection.chosen_audio.as_ref().map(|c| c.url.clone()),
        duration: metadata.duration,
        description: metadata.description,
        quality: quality_label(selection.chosen_video.as_ref().and_then(|c| c.quality_hint)),
        confidence: selection.confidence,
        method,
    })
}

fn quality_option(candidate: &StreamCandidate) -> QualityOption {
    QualityOption {
        quality: candidate.quality_hint,
        url: candidate.url.clone(),
        label: quality_label(candidate.quality_hint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakeSession, FakeSource};
    use crate::browser::ObservedResponse;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const ADDRESS: &str = "https://www.facebook.com/reel/1234567890123";

    fn fast_config() -> AppConfig {
        AppConfig {
            settle_delay: Duration::ZERO,
            network_wait: Duration::ZERO,
            ..AppConfig::default()
        }
    }

    fn ready_page() -> FakeSession {
        let html = r#"<html><head>
            <meta property="og:title" content="Sunset timelapse">
            <meta property="og:image" content="https://img.example/thumb.jpg">
            <script type="application/ld+json">{"@type":"VideoObject","duration":"PT42S"}</script>
            </head><body><video></video></body></html>"#;
        FakeSession::default().page(ADDRESS, ADDRESS, html)
    }

    #[tokio::test]
    async fn script_data_alone_answers_the_request() {
        let scripts = json!([
            {"type": "application/ld+json",
             "text": r#"{"@type":"VideoObject","contentUrl":"https://cdn.example/1234567890123_hd.mp4","height":720}"#},
            {"type": "", "text": r#"{"playable_url":"https:\/\/cdn.example\/1234567890123_sd.mp4"}"#}
        ]);
        let session = ready_page().eval("querySelectorAll('script')", Value::String(scripts.to_string()));
        let subscribed = session.subscribed.clone();
        let closed = session.closed.clone();
        let source = FakeSource::new(session);

        let data = extract(&source, ADDRESS, &fast_config()).await.unwrap();

        assert!(!subscribed.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(data.video_url.as_deref(), Some("https://cdn.example/1234567890123_hd.mp4"));
        assert_eq!(data.quality, "720p");
        assert_eq!(data.confidence, Confidence::High);
        assert_eq!(data.method, "page_source");
        assert_eq!(data.name, "Sunset timelapse");
        assert_eq!(data.duration, Some(42.0));
        assert_eq!(data.qualities.len(), 2);
        assert_eq!(data.qualities[0].label, "720p");
    }

    #[tokio::test]
    async fn empty_page_is_a_not_found_error() {
        let session = ready_page();
        let closed = session.closed.clone();
        let source = FakeSource::new(session);

        let err = extract(&source, ADDRESS, &fast_config()).await.err().unwrap();
        assert!(matches!(err, ExtractError::NoCandidatesFound));
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn network_evidence_is_paired_with_audio() {
        let observed = |url: &str, mime: &str, length: &str| ObservedResponse {
            url: url.to_string(),
            mime_type: mime.to_string(),
            status: 206,
            headers: HashMap::from([("content-range".to_string(), format!("bytes 0-99/{length}"))]),
            observed_at: Utc::now(),
        };
        let session = ready_page()
            .response(observed("https://cdn.example/v_720p.mp4?bytestart=0&byteend=99", "video/mp4", "40000000"))
            .response(observed("https://cdn.example/a.mp4?bytestart=0&byteend=99", "audio/mp4", "3000000"));
        let source = FakeSource::new(session);

        let data = extract(&source, ADDRESS, &fast_config()).await.unwrap();
        assert_eq!(data.method, "network");
        assert_eq!(data.video_url.as_deref(), Some("https://cdn.example/v_720p.mp4"));
        assert_eq!(data.audio_url.as_deref(), Some("https://cdn.example/a.mp4"));
        assert_eq!(data.thumbnail.as_deref(), Some("https://img.example/thumb.jpg"));
    }
}
