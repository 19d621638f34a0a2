use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::target::EmbeddedParams;

/// Query parameters that only carry a session-specific byte window.
const BYTE_RANGE_PARAMS: &[&str] = &["bytestart", "byteend", "range", "rn", "rbuf"];

static QUALITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|[^0-9a-z])(\d{3,4})p(?:[^0-9a-z]|$)").unwrap());

static BITRATE_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&](?:bitrate|br)=(\d+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHint {
    /// Single file, directly playable.
    Progressive,
    /// DASH-style chunk or manifest; not playable on its own.
    Segmented,
    Unknown,
}

impl ContainerHint {
    /// Ordering used by the selector tie-break.
    pub fn rank(self) -> u8 {
        match self {
            ContainerHint::Progressive => 2,
            ContainerHint::Unknown => 1,
            ContainerHint::Segmented => 0,
        }
    }
}

/// Which collection rule produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    JsonLd,
    ScriptField,
    ScriptPattern,
    Dom,
    Network,
}

impl CandidateOrigin {
    /// Strategy name reported to API clients.
    pub fn method(self) -> &'static str {
        match self {
            CandidateOrigin::JsonLd | CandidateOrigin::ScriptField | CandidateOrigin::ScriptPattern => "page_source",
            CandidateOrigin::Dom => "dom",
            CandidateOrigin::Network => "network",
        }
    }
}

/// A discovered media URL plus whatever metadata could be inferred about it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCandidate {
    pub url: String,
    pub media_kind: MediaKind,
    pub quality_hint: Option<u32>,
    pub bitrate_hint: Option<u64>,
    pub container_hint: ContainerHint,
    pub content_length: Option<u64>,
    pub asset_id: Option<String>,
    pub matches_target: bool,
    pub observed_at: DateTime<Utc>,
    pub origin: CandidateOrigin,
}

impl StreamCandidate {
    /// Builds a candidate from a raw address, inferring kind, quality,
    /// bitrate, container and asset id from the URL and its embedded
    /// parameters. Collectors refine the guesses with the `with_*` methods.
    pub fn from_url(raw_url: &str, origin: CandidateOrigin, observed_at: DateTime<Utc>) -> Self {
        let url = strip_byte_range(raw_url);
        let embedded = EmbeddedParams::from_url(&url);

        let tag = embedded.as_ref().and_then(|p| p.vencode_tag.clone()).unwrap_or_default();
        let lower_url = url.to_lowercase();

        let media_kind = if tag.contains("audio") || looks_like_audio_url(&lower_url) {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };

        let quality_hint = if media_kind == MediaKind::Video {
            parse_quality(&tag).or_else(|| parse_quality(url_path(&url)))
        } else {
            None
        };

        let bitrate_hint = embedded
            .as_ref()
            .and_then(|p| p.bitrate)
            .or_else(|| {
                BITRATE_PARAM_RE
                    .captures(&url)
                    .and_then(|c| c[1].parse().ok())
            });

        let container_hint = infer_container(raw_url, &tag);
        let asset_id = embedded.and_then(|p| p.asset_id);

        Self {
            url,
            media_kind,
            quality_hint,
            bitrate_hint,
            container_hint,
            content_length: None,
            asset_id,
            matches_target: false,
            observed_at,
            origin,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.media_kind = kind;
        if kind == MediaKind::Audio {
            self.quality_hint = None;
        }
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: Option<u32>) -> Self {
        if quality.is_some() && self.media_kind == MediaKind::Video {
            self.quality_hint = quality;
        }
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: ContainerHint) -> Self {
        self.container_hint = container;
        self
    }

    #[must_use]
    pub fn with_content_length(mut self, length: Option<u64>) -> Self {
        if length.is_some() {
            self.content_length = length;
        }
        self
    }

    pub fn dedup_key(&self) -> (MediaKind, &str) {
        (self.media_kind, self.url.as_str())
    }
}

/// Candidates deduplicated by `(kind, url-without-byte-range)`.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    items: Vec<StreamCandidate>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a candidate; a duplicate only takes the slot when it has a
    /// higher bitrate. Metadata missing on the winner is kept from the loser.
    pub fn insert(&mut self, candidate: StreamCandidate) {
        let existing = self
            .items
            .iter_mut()
            .find(|c| c.dedup_key() == candidate.dedup_key());

        match existing {
            None => self.items.push(candidate),
            Some(slot) => {
                if candidate.bitrate_hint > slot.bitrate_hint {
                    let loser = std::mem::replace(slot, candidate);
                    merge_missing(slot, &loser);
                } else {
                    merge_missing(slot, &candidate);
                }
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = StreamCandidate>>(&mut self, candidates: I) {
        for candidate in candidates {
            self.insert(candidate);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamCandidate> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamCandidate> {
        self.items.iter_mut()
    }

    pub fn as_slice(&self) -> &[StreamCandidate] {
        &self.items
    }

    /// True when a strategy found enough to stop looking: at least one
    /// candidate with a quality hint, or any audio stream.
    pub fn is_conclusive(&self) -> bool {
        self.items
            .iter()
            .any(|c| c.quality_hint.is_some() || c.media_kind == MediaKind::Audio)
    }
}

fn merge_missing(winner: &mut StreamCandidate, loser: &StreamCandidate) {
    winner.quality_hint = winner.quality_hint.or(loser.quality_hint);
    winner.content_length = winner.content_length.or(loser.content_length);
    if winner.asset_id.is_none() {
        winner.asset_id = loser.asset_id.clone();
    }
    if winner.container_hint == ContainerHint::Unknown {
        winner.container_hint = loser.container_hint;
    }
    if loser.observed_at < winner.observed_at {
        winner.observed_at = loser.observed_at;
    }
}

/// Drops byte-window query parameters, leaving the rest of the address
/// byte-for-byte intact (signed URLs break if re-encoded).
pub fn strip_byte_range(url: &str) -> String {
    let (without_fragment, _) = url.split_once('#').unwrap_or((url, ""));
    let Some((base, query)) = without_fragment.split_once('?') else {
        return without_fragment.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            !pair.is_empty() && !BYTE_RANGE_PARAMS.contains(&key)
        })
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

/// Undoes JSON string escaping (`\/`, `%`, ...) and HTML `&amp;`
/// found on addresses lifted out of script text.
pub fn unescape_url(raw: &str) -> String {
    let quoted = format!("\"{}\"", raw);
    let decoded = serde_json::from_str::<String>(&quoted).unwrap_or_else(|_| raw.replace("\\/", "/"));
    decoded.replace("&amp;", "&")
}

/// Largest plausible `NNNp` height mentioned in `text`.
pub fn parse_quality(text: &str) -> Option<u32> {
    QUALITY_RE
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .filter(|h| (144..=4320).contains(h))
        .max()
}

/// `"720p"`, or `"available"` when the height is unknown.
pub fn quality_label(hint: Option<u32>) -> String {
    match hint {
        Some(h) => format!("{}p", h),
        None => "available".to_string(),
    }
}

fn url_path(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn looks_like_audio_url(lower_url: &str) -> bool {
    let path = url_path(lower_url);
    path.ends_with(".m4a")
        || path.ends_with(".aac")
        || path.ends_with(".mp3")
        || path.ends_with(".opus")
        || lower_url.contains("mime=audio")
        || lower_url.contains("audio_only")
}

fn infer_container(raw_url: &str, tag: &str) -> ContainerHint {
    let lower = raw_url.to_lowercase();
    let path = url_path(&lower);
    if tag.contains("progressive") {
        return ContainerHint::Progressive;
    }
    if tag.contains("dash")
        || path.ends_with(".m4s")
        || path.ends_with(".mpd")
        || path.ends_with(".m3u8")
        || lower.contains("bytestart=")
        || lower.contains("?range=")
        || lower.contains("&range=")
    {
        return ContainerHint::Segmented;
    }
    ContainerHint::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str) -> StreamCandidate {
        StreamCandidate::from_url(url, CandidateOrigin::Network, Utc::now())
    }

    #[test]
    fn strips_only_byte_range_params() {
        assert_eq!(
            strip_byte_range("https://cdn.example/v.mp4?oh=abc&bytestart=0&byteend=999&oe=1"),
            "https://cdn.example/v.mp4?oh=abc&oe=1"
        );
        assert_eq!(
            strip_byte_range("https://cdn.example/v.mp4?bytestart=100&byteend=200"),
            "https://cdn.example/v.mp4"
        );
        assert_eq!(strip_byte_range("https://cdn.example/v.mp4#t=3"), "https://cdn.example/v.mp4");
    }

    #[test]
    fn strip_keeps_encoded_values_untouched() {
        let url = "https://cdn.example/v.mp4?efg=eyJ2IjoxfQ%3D%3D&_nc_ht=a~b&range=0-1";
        assert_eq!(strip_byte_range(url), "https://cdn.example/v.mp4?efg=eyJ2IjoxfQ%3D%3D&_nc_ht=a~b");
    }

    #[test]
    fn duplicates_keep_the_higher_bitrate() {
        let mut set = CandidateSet::new();
        set.insert(candidate("https://cdn.example/v.mp4?bitrate=500000&bytestart=0&byteend=10"));
        set.insert(candidate("https://cdn.example/v.mp4?bitrate=500000&bytestart=11&byteend=20"));
        assert_eq!(set.len(), 1);

        let mut low = candidate("https://cdn.example/x.mp4?bytestart=0");
        low.bitrate_hint = Some(100);
        let mut high = candidate("https://cdn.example/x.mp4?bytestart=500");
        high.bitrate_hint = Some(900);
        set.insert(low);
        set.insert(high);

        assert_eq!(set.len(), 2);
        let kept = set.iter().find(|c| c.url == "https://cdn.example/x.mp4").unwrap();
        assert_eq!(kept.bitrate_hint, Some(900));
    }

    #[test]
    fn same_url_different_kind_is_not_a_duplicate() {
        let mut set = CandidateSet::new();
        set.insert(candidate("https://cdn.example/s.mp4"));
        set.insert(candidate("https://cdn.example/s.mp4").with_kind(MediaKind::Audio));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn losing_duplicate_still_contributes_content_length() {
        let mut set = CandidateSet::new();
        let mut winner = candidate("https://cdn.example/a.mp4");
        winner.bitrate_hint = Some(2_000);
        let loser = candidate("https://cdn.example/a.mp4?bytestart=0").with_content_length(Some(42));
        set.insert(loser);
        set.insert(winner);
        let only = set.iter().next().unwrap();
        assert_eq!(only.bitrate_hint, Some(2_000));
        assert_eq!(only.content_length, Some(42));
    }

    #[test]
    fn unescapes_json_and_html_escapes() {
        assert_eq!(
            unescape_url(r"https:\/\/video.example\/v.mp4?a=1&b=2"),
            "https://video.example/v.mp4?a=1&b=2"
        );
        assert_eq!(unescape_url("https://x.example/v.mp4?a=1&amp;b=2"), "https://x.example/v.mp4?a=1&b=2");
        assert_eq!(unescape_url(r"https:\/\/x.example\/bad\q"), "https://x.example/bad\\q");
    }

    #[test]
    fn quality_parsing_picks_plausible_heights() {
        assert_eq!(parse_quality("dash_h264-basic-gen2_720p"), Some(720));
        assert_eq!(parse_quality("/v/1080p/clip_480p.mp4"), Some(1080));
        assert_eq!(parse_quality("/v/clip.mp4"), None);
        assert_eq!(parse_quality("/v/9999p.mp4"), None);
    }

    #[test]
    fn infers_container_and_kind_from_url() {
        let seg = candidate("https://cdn.example/chunk_720p.m4s");
        assert_eq!(seg.container_hint, ContainerHint::Segmented);
        assert_eq!(seg.quality_hint, Some(720));

        let audio = candidate("https://cdn.example/track.m4a");
        assert_eq!(audio.media_kind, MediaKind::Audio);
        assert_eq!(audio.quality_hint, None);

        let plain = candidate("https://cdn.example/v.mp4");
        assert_eq!(plain.container_hint, ContainerHint::Unknown);
        assert_eq!(plain.media_kind, MediaKind::Video);
    }

    #[test]
    fn conclusive_requires_quality_or_audio() {
        let mut set = CandidateSet::new();
        set.insert(candidate("https://cdn.example/v.mp4"));
        assert!(!set.is_conclusive());
        set.insert(candidate("https://cdn.example/v_360p.mp4"));
        assert!(set.is_conclusive());
    }

    #[test]
    fn labels_quality() {
        assert_eq!(quality_label(Some(1080)), "1080p");
        assert_eq!(quality_label(None), "available");
    }

    #[test]
    fn origins_report_their_strategy() {
        let reported: Vec<&str> = [
            CandidateOrigin::JsonLd,
            CandidateOrigin::ScriptField,
            CandidateOrigin::ScriptPattern,
            CandidateOrigin::Dom,
            CandidateOrigin::Network,
        ]
        .into_iter()
        .map(CandidateOrigin::method)
        .collect();
        assert_eq!(reported, ["page_source", "page_source", "page_source", "dom", "network"]);
    }
}
