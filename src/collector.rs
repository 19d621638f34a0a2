use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::browser::{ObservedResponse, PageSession};
use crate::candidate::{
    parse_quality, unescape_url, CandidateOrigin, CandidateSet, ContainerHint, MediaKind, StreamCandidate,
};
use crate::config::AppConfig;
use crate::error::ExtractError;

const SCRIPTS_JS: &str = r#"
    (() => JSON.stringify(
        Array.from(document.querySelectorAll('script')).map(s => ({
            type: s.type || '',
            text: s.textContent || ''
        }))
    ))();
"#;

const DOM_VIDEO_JS: &str = r#"
    (() => {
        const v = document.querySelector('video');
        if (!v) return JSON.stringify(null);
        return JSON.stringify({
            src: v.currentSrc || v.src || '',
            height: v.videoHeight || 0,
            duration: isFinite(v.duration) ? v.duration : null,
            poster: v.poster || null
        });
    })();
"#;

/// Mutes and starts the first player, then nudges the page so lazy
/// players attach their streams.
const INTERACTION_JS: &str = r#"
    (() => {
        const v = document.querySelector('video');
        if (v) {
            v.muted = true;
            const p = v.play();
            if (p && p.catch) p.catch(() => {});
        }
        window.scrollBy(0, 300);
        return 'interacted';
    })();
"#;

/// A structured JSON field known to carry a stream address.
struct FieldRule {
    field: &'static str,
    kind: MediaKind,
    quality: Option<u32>,
    container: ContainerHint,
}

const FIELD_RULES: &[FieldRule] = &[
    FieldRule { field: "playable_url_quality_hd", kind: MediaKind::Video, quality: Some(720), container: ContainerHint::Progressive },
    FieldRule { field: "browser_native_hd_url", kind: MediaKind::Video, quality: Some(720), container: ContainerHint::Progressive },
    FieldRule { field: "hd_src_no_ratelimit", kind: MediaKind::Video, quality: Some(720), container: ContainerHint::Progressive },
    FieldRule { field: "hd_src", kind: MediaKind::Video, quality: Some(720), container: ContainerHint::Progressive },
    FieldRule { field: "playable_url", kind: MediaKind::Video, quality: Some(360), container: ContainerHint::Progressive },
    FieldRule { field: "browser_native_sd_url", kind: MediaKind::Video, quality: Some(360), container: ContainerHint::Progressive },
    FieldRule { field: "sd_src_no_ratelimit", kind: MediaKind::Video, quality: Some(360), container: ContainerHint::Progressive },
    FieldRule { field: "sd_src", kind: MediaKind::Video, quality: Some(360), container: ContainerHint::Progressive },
    FieldRule { field: "video_url", kind: MediaKind::Video, quality: None, container: ContainerHint::Unknown },
    FieldRule { field: "audio_url", kind: MediaKind::Audio, quality: None, container: ContainerHint::Unknown },
];

static FIELD_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    FIELD_RULES
        .iter()
        .map(|rule| Regex::new(&format!(r#""{}"\s*:\s*("(?:[^"\\]|\\.)*")"#, regex::escape(rule.field))).unwrap())
        .collect()
});

static BARE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?:(?:\\?/){2}[^"'\s<>()]+?\.(?:mp4|m4v|m4a|webm)(?:\?[^"'\s<>()]*)?"#).unwrap()
});

/// Bare URLs only count when one of these appears shortly before them.
const URL_KEYWORDS: &[&str] = &["video", "playable", "src", "audio", "media", "stream"];
const KEYWORD_WINDOW: usize = 80;

static ISO_DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$").unwrap()
});

static OG_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[property='og:title']").unwrap());
static OG_IMAGE: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[property='og:image']").unwrap());
static OG_DESCRIPTION: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[property='og:description']").unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static JSON_LD: Lazy<Selector> = Lazy::new(|| Selector::parse("script[type='application/ld+json']").unwrap());

// ============================================================================
// Results
// ============================================================================

/// Details of the page's first `<video>` element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomVideo {
    pub src: String,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub poster: Option<String>,
}

/// Human-facing details of the page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub candidates: CandidateSet,
    pub interaction_at: Option<DateTime<Utc>>,
    pub dom_video: Option<DomVideo>,
    /// Strategies that ran, in order.
    pub strategies: Vec<&'static str>,
}

// ============================================================================
// Strategy 1: script-embedded extraction
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptBlock {
    pub kind: String,
    pub text: String,
}

/// Runs every extraction rule over the script blocks, highest priority
/// first: JSON-LD, then structured fields, then bare URLs near keywords.
pub fn candidates_from_scripts(blocks: &[ScriptBlock], observed_at: DateTime<Utc>) -> Vec<StreamCandidate> {
    let mut found = Vec::new();

    for block in blocks.iter().filter(|b| b.kind.contains("ld+json")) {
        found.extend(json_ld_candidates(&block.text, observed_at));
    }

    for block in blocks {
        for (rule, re) in FIELD_RULES.iter().zip(FIELD_REGEXES.iter()) {
            for caps in re.captures_iter(&block.text) {
                // A literal that fails to parse is skipped, not fatal.
                let Ok(raw) = serde_json::from_str::<String>(&caps[1]) else {
                    continue;
                };
                let url = raw.replace("&amp;", "&");
                if !is_http(&url) {
                    continue;
                }
                let candidate = StreamCandidate::from_url(&url, CandidateOrigin::ScriptField, observed_at)
                    .with_kind(rule.kind)
                    .with_quality(rule.quality);
                let candidate = if rule.container != ContainerHint::Unknown {
                    candidate.with_container(rule.container)
                } else {
                    candidate
                };
                found.push(candidate);
            }
        }
    }

    for block in blocks {
        for m in BARE_URL_RE.find_iter(&block.text) {
            if !near_keyword(&block.text, m.start()) {
                continue;
            }
            let url = unescape_url(m.as_str());
            if is_http(&url) {
                found.push(StreamCandidate::from_url(&url, CandidateOrigin::ScriptPattern, observed_at));
            }
        }
    }

    found
}

fn json_ld_candidates(text: &str, observed_at: DateTime<Utc>) -> Vec<StreamCandidate> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    let Some(video) = find_video_object(&value) else {
        return Vec::new();
    };
    let Some(url) = video.get("contentUrl").and_then(Value::as_str).filter(|u| is_http(u)) else {
        return Vec::new();
    };
    let height = json_number(video.get("height"))
    .or_else(|| video.get("videoQuality").and_then(Value::as_str).and_then(parse_quality))
    .or_else(|| json_number(video.get("width")).and_then(height_from_width));

    vec![StreamCandidate::from_url(url, CandidateOrigin::JsonLd, observed_at)
        .with_kind(MediaKind::Video)
        .with_quality(height)
        .with_container(ContainerHint::Progressive)]
}

/// `720`, `"720"` and `"720px"` all read as 720.
fn json_number(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().map(|v| v as u32),
        Value::String(s) => s.trim_end_matches("px").trim().parse().ok(),
        _ => None,
    }
}

/// Height of a 16:9 frame `width` pixels wide.
fn height_from_width(width: u32) -> Option<u32> {
    let height = width.checked_mul(9)? / 16;
    (144..=4320).contains(&height).then_some(height)
}

fn find_video_object(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_video_object),
        Value::Object(map) => {
            let is_video = match map.get("@type") {
                Some(Value::String(t)) => t == "VideoObject",
                Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some("VideoObject")),
                _ => false,
            };
            if is_video {
                Some(value)
            } else {
                map.get("@graph").and_then(find_video_object)
            }
        }
        _ => None,
    }
}

fn near_keyword(text: &str, match_start: usize) -> bool {
    let mut window_start = match_start.saturating_sub(KEYWORD_WINDOW);
    while !text.is_char_boundary(window_start) {
        window_start -= 1;
    }
    let window = text[window_start..match_start].to_lowercase();
    URL_KEYWORDS.iter().any(|k| window.contains(k))
}

fn is_http(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

/// Evaluated scripts hand back `JSON.stringify` output; decode it.
fn decode_eval(value: Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::Null),
        other => other,
    }
}

/// headless_chrome calls block the calling thread; run them off the
/// runtime so strategy timeouts can fire while a page hangs.
async fn evaluate_blocking(session: &Arc<dyn PageSession>, script: &'static str) -> anyhow::Result<Value> {
    let session = session.clone();
    tokio::task::spawn_blocking(move || session.evaluate(script)).await?
}

pub async fn script_blocks(session: &Arc<dyn PageSession>) -> Vec<ScriptBlock> {
    let value = match evaluate_blocking(session, SCRIPTS_JS).await {
        Ok(v) => decode_eval(v),
        Err(e) => {
            warn!("Script scan failed: {}", e);
            return Vec::new();
        }
    };
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| ScriptBlock {
                    kind: item.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
                    text: item.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Strategy 2: DOM video element
// ============================================================================

pub async fn inspect_dom_video(session: &Arc<dyn PageSession>) -> Option<DomVideo> {
    let value = match evaluate_blocking(session, DOM_VIDEO_JS).await {
        Ok(v) => decode_eval(v),
        Err(e) => {
            warn!("DOM inspection failed: {}", e);
            return None;
        }
    };
    let obj = value.as_object()?;
    Some(DomVideo {
        src: obj.get("src").and_then(Value::as_str).unwrap_or_default().to_string(),
        height: obj
            .get("height")
            .and_then(Value::as_u64)
            .filter(|h| *h > 0)
            .map(|h| h as u32),
        duration: obj.get("duration").and_then(Value::as_f64).filter(|d| *d > 0.0),
        poster: obj
            .get("poster")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(String::from),
    })
}

/// `blob:` sources are MSE buffers and cannot be fetched.
pub fn candidate_from_dom(video: &DomVideo, observed_at: DateTime<Utc>) -> Option<StreamCandidate> {
    if !is_http(&video.src) {
        return None;
    }
    Some(
        StreamCandidate::from_url(&video.src, CandidateOrigin::Dom, observed_at)
            .with_kind(MediaKind::Video)
            .with_quality(video.height),
    )
}

// ============================================================================
// Strategy 3: network observation
// ============================================================================

/// Flags a response as a media candidate from its headers alone.
pub fn candidate_from_response(response: &ObservedResponse) -> Option<StreamCandidate> {
    if response.status >= 400 || !is_http(&response.url) {
        return None;
    }
    let mime = response.mime_type.to_lowercase();
    if mime.starts_with("image/") || mime.starts_with("text/") {
        return None;
    }

    let lower_url = response.url.to_lowercase();
    let path = lower_url.split('?').next().unwrap_or_default();
    let media_mime = mime.starts_with("video/")
        || mime.starts_with("audio/")
        || mime.contains("dash+xml")
        || mime.contains("mpegurl");
    let media_path = [".mp4", ".m4s", ".m4a", ".m4v", ".webm"].iter().any(|ext| path.ends_with(ext))
        || lower_url.contains("videoplayback");
    if !media_mime && !media_path {
        return None;
    }

    let mut candidate = StreamCandidate::from_url(&response.url, CandidateOrigin::Network, response.observed_at)
        .with_content_length(total_length(response));
    if mime.starts_with("audio/") {
        candidate = candidate.with_kind(MediaKind::Audio);
    }
    Some(candidate)
}

/// Full asset size: the `Content-Range` total when the response is a
/// byte window, else `Content-Length`.
fn total_length(response: &ObservedResponse) -> Option<u64> {
    response
        .headers
        .get("content-range")
        .and_then(|range| range.rsplit('/').next())
        .and_then(|total| total.trim().parse().ok())
        .or_else(|| {
            response
                .headers
                .get("content-length")
                .and_then(|len| len.trim().parse().ok())
        })
}

/// Subscribes to responses, reloads the page and plays the video.
/// Returns the interaction timestamp.
async fn observe_network(
    session: &Arc<dyn PageSession>,
    address: &str,
    wait: Duration,
    sink: Arc<Mutex<Vec<StreamCandidate>>>,
) -> anyhow::Result<DateTime<Utc>> {
    let callback_sink = sink.clone();
    session.on_response(Box::new(move |response: ObservedResponse| {
        if let Some(candidate) = candidate_from_response(&response) {
            debug!("Media response: {} ({})", candidate.url, response.mime_type);
            callback_sink
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(candidate);
        }
    }))?;

    let reload = session.clone();
    let address = address.to_string();
    tokio::task::spawn_blocking(move || reload.navigate(&address)).await??;
    sleep(wait / 2).await;

    let interaction_at = Utc::now();
    if let Err(e) = evaluate_blocking(session, INTERACTION_JS).await {
        warn!("Interaction script failed: {}", e);
    }
    sleep(wait).await;
    Ok(interaction_at)
}

// ============================================================================
// Orchestration
// ============================================================================

/// Runs the strategies in priority order, each bounded by the strategy
/// timeout; a strategy that yields a quality hint or an audio stream ends
/// the search.
pub async fn collect(
    session: &Arc<dyn PageSession>,
    address: &str,
    config: &AppConfig,
) -> Result<Collection, ExtractError> {
    let mut collection = Collection::default();

    info!("Trying strategy 1: page source extraction...");
    collection.strategies.push("page_source");
    let scripted = timeout(config.strategy_timeout, async {
        let blocks = script_blocks(session).await;
        candidates_from_scripts(&blocks, Utc::now())
    })
    .await
    .unwrap_or_else(|_| {
        warn!("Page source extraction timed out");
        Vec::new()
    });
    info!("Page source yielded {} candidates", scripted.len());
    collection.candidates.extend(scripted);
    if collection.candidates.is_conclusive() {
        return Ok(collection);
    }

    info!("Trying strategy 2: DOM extraction...");
    collection.strategies.push("dom");
    let dom = timeout(config.strategy_timeout, inspect_dom_video(session))
        .await
        .unwrap_or_else(|_| {
            warn!("DOM extraction timed out");
            None
        });
    if let Some(video) = &dom {
        if let Some(candidate) = candidate_from_dom(video, Utc::now()) {
            collection.candidates.insert(candidate);
        }
    }
    collection.dom_video = dom;
    if collection.candidates.is_conclusive() {
        return Ok(collection);
    }

    info!("Trying strategy 3: network monitoring...");
    collection.strategies.push("network");
    let sink = Arc::new(Mutex::new(Vec::new()));
    match timeout(
        config.strategy_timeout,
        observe_network(session, address, config.network_wait, sink.clone()),
    )
    .await
    {
        Ok(Ok(interaction_at)) => collection.interaction_at = Some(interaction_at),
        Ok(Err(e)) => warn!("Network monitoring failed: {}", e),
        Err(_) => warn!("Network monitoring timed out"),
    }
    let observed = std::mem::take(&mut *sink.lock().unwrap_or_else(|e| e.into_inner()));
    info!("Network monitoring observed {} media responses", observed.len());
    collection.candidates.extend(observed);

    if collection.candidates.is_empty() {
        return Err(ExtractError::NoCandidatesFound);
    }
    Ok(collection)
}

// ============================================================================
// Page metadata
// ============================================================================

/// Title, thumbnail, description and duration from Open Graph tags and
/// JSON-LD, falling back to `<title>`.
pub fn page_metadata(html: &str) -> PageMetadata {
    let document = Html::parse_document(html);
    let meta = |selector: &Selector| {
        document
            .select(selector)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let json_ld: Vec<Value> = document
        .select(&JSON_LD)
        .filter_map(|el| serde_json::from_str(&el.text().collect::<String>()).ok())
        .collect();
    let video_object = json_ld.iter().find_map(find_video_object);
    let ld_str = |key: &str| {
        video_object
            .and_then(|v| v.get(key))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Array(items) => items.first().and_then(Value::as_str).map(String::from),
                _ => None,
            })
    };

    let title = meta(&OG_TITLE).or_else(|| ld_str("name")).or_else(|| {
        document
            .select(&TITLE)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    });

    PageMetadata {
        title,
        thumbnail: meta(&OG_IMAGE).or_else(|| ld_str("thumbnailUrl")),
        description: meta(&OG_DESCRIPTION).or_else(|| ld_str("description")),
        duration: ld_str("duration").as_deref().and_then(parse_iso_duration),
    }
}

/// `PT1M30.5S` -> 90.5 seconds.
pub fn parse_iso_duration(text: &str) -> Option<f64> {
    let caps = ISO_DURATION_RE.captures(text.trim())?;
    let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok()).unwrap_or(0.0);
    let total = part(1) * 86_400.0 + part(2) * 3_600.0 + part(3) * 60.0 + part(4);
    (total > 0.0).then_some(total)
}
