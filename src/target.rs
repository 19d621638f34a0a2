use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde_json::Value;

use crate::candidate::CandidateSet;

/// Identifiers shorter than this are only matched verbatim.
const SUFFIX_LEN: usize = 8;

/// Path rules, tried in order before any query parameter.
static PATH_RULES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("videos", Regex::new(r"/videos/(?:[^/?#]+/)*?(\d{5,})").unwrap()),
        ("reel", Regex::new(r"/reels?/(\d{5,})").unwrap()),
        ("share", Regex::new(r"/share/[vr]/([A-Za-z0-9_-]{6,})").unwrap()),
        ("shortcode", Regex::new(r"/(?:p|reel|reels|tv)/([A-Za-z0-9_-]{6,})").unwrap()),
        ("status", Regex::new(r"/status(?:es)?/(\d{5,})").unwrap()),
        ("video", Regex::new(r"/video/(\d{5,})").unwrap()),
    ]
});

const QUERY_RULES: &[&str] = &["v", "video_id", "story_fbid", "fbid", "id"];

/// Shortest query value accepted as an id; shorter ones would correlate
/// with almost any URL.
const MIN_QUERY_ID_LEN: usize = 5;

/// Short string believed to name the requested content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the target identifier from a user-supplied address.
///
/// `None` means "cannot correlate": selection falls back to heuristics.
pub fn resolve_target(address: &str) -> Option<TargetId> {
    let url = Url::parse(address.trim()).ok()?;
    let path = url.path();

    for (name, rule) in PATH_RULES.iter() {
        if let Some(caps) = rule.captures(path) {
            tracing::debug!("Target id from path rule '{}': {}", name, &caps[1]);
            return Some(TargetId::new(&caps[1]));
        }
    }

    for &key in QUERY_RULES {
        if let Some((_, value)) = url.query_pairs().find(|(k, v)| k == key && v.chars().count() >= MIN_QUERY_ID_LEN) {
            tracing::debug!("Target id from query parameter '{}': {}", key, value);
            return Some(TargetId::new(value.into_owned()));
        }
    }

    None
}

/// Hints decoded from the `efg` parameter some CDNs append to media URLs
/// (percent-encoded base64 of a JSON object).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddedParams {
    pub vencode_tag: Option<String>,
    pub asset_id: Option<String>,
    pub video_id: Option<String>,
    pub bitrate: Option<u64>,
}

impl EmbeddedParams {
    pub fn from_url(url: &str) -> Option<Self> {
        let raw = query_value(url, "efg")?;
        let unescaped = urlencoding::decode(raw).ok()?;
        let bytes = decode_base64(unescaped.trim())?;
        let value: Value = serde_json::from_slice(&bytes).ok()?;
        Self::from_json(&value)
    }

    fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let field = |key: &str| -> Option<String> {
            match obj.get(key)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };

        let video_id = field("video_id");
        let asset_id = field("xpv_asset_id")
            .or_else(|| field("asset_id"))
            .or_else(|| video_id.clone());

        Some(Self {
            vencode_tag: field("vencode_tag").map(|t| t.to_lowercase()),
            asset_id,
            video_id,
            bitrate: field("bitrate").and_then(|b| b.parse().ok()),
        })
    }

    fn ids(&self) -> impl Iterator<Item = &str> {
        self.asset_id.iter().chain(self.video_id.iter()).map(String::as_str)
    }
}

/// True when the candidate address can be tied to the target: the id
/// appears verbatim, its 8-character tail appears, or an embedded asset id
/// equals it or shares that tail.
pub fn correlates(candidate_url: &str, target: &TargetId) -> bool {
    let id = target.as_str();
    if id.is_empty() {
        return false;
    }
    if candidate_url.contains(id) {
        return true;
    }
    if id.len() > SUFFIX_LEN && candidate_url.contains(tail(id, SUFFIX_LEN)) {
        return true;
    }
    EmbeddedParams::from_url(candidate_url)
        .map(|params| params.ids().any(|asset| asset == id || shares_suffix(asset, id)))
        .unwrap_or(false)
}

/// Sets `matches_target` on every candidate; returns how many matched.
pub fn mark_matches(candidates: &mut CandidateSet, target: Option<&TargetId>) -> usize {
    let Some(target) = target else {
        return 0;
    };
    let mut matched = 0;
    for candidate in candidates.iter_mut() {
        candidate.matches_target = correlates(&candidate.url, target);
        if candidate.matches_target {
            matched += 1;
        }
    }
    matched
}

fn shares_suffix(a: &str, b: &str) -> bool {
    a.len() >= SUFFIX_LEN && b.len() >= SUFFIX_LEN && tail(a, SUFFIX_LEN) == tail(b, SUFFIX_LEN)
}

fn tail(s: &str, n: usize) -> &str {
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

fn query_value<'a>(url: &'a str, key: &str) -> Option<&'a str> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn decode_base64(input: &str) -> Option<Vec<u8>> {
    [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(input).ok())
}
