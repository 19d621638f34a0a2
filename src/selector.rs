use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

use crate::candidate::{MediaKind, StreamCandidate};

/// Score per megabyte of observed content length in an asset group.
const SIZE_WEIGHT_PER_MB: f64 = 1.0;
/// Score per distinct variant (quality rung) in an asset group.
const VARIANT_WEIGHT: f64 = 5.0;
/// Max pixel height is divided by this before being added.
const QUALITY_DIVISOR: f64 = 100.0;
/// Bonus for the first two asset groups the page loaded.
const FIRST_OBSERVED_BONUS: f64 = 10.0;
const FIRST_OBSERVED_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Which selection rule produced the chosen video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    TargetMatch,
    SingleAsset,
    AssetGroupScore,
    PostInteraction,
    HighestQuality,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// When the page was nudged into playing; later responses are more
    /// likely to belong to the requested video.
    pub interaction_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub chosen_video: Option<StreamCandidate>,
    pub chosen_audio: Option<StreamCandidate>,
    pub confidence: Confidence,
    pub rule: Option<SelectionRule>,
}

/// Candidates sharing one decoded asset id.
#[derive(Debug, Clone)]
pub struct AssetGroup<'a> {
    pub asset_id: &'a str,
    pub members: Vec<&'a StreamCandidate>,
    pub first_seen: DateTime<Utc>,
}

impl AssetGroup<'_> {
    pub fn total_content_length(&self) -> u64 {
        self.members.iter().filter_map(|c| c.content_length).sum()
    }

    pub fn max_quality(&self) -> Option<u32> {
        self.members.iter().filter_map(|c| c.quality_hint).max()
    }
}

/// Tie-break used by every video rule: quality, then progressive over
/// segmented, then bitrate.
pub fn compare_video(a: &StreamCandidate, b: &StreamCandidate) -> Ordering {
    a.quality_hint
        .cmp(&b.quality_hint)
        .then(a.container_hint.rank().cmp(&b.container_hint.rank()))
        .then(a.bitrate_hint.cmp(&b.bitrate_hint))
}

fn compare_audio(a: &StreamCandidate, b: &StreamCandidate) -> Ordering {
    a.bitrate_hint
        .cmp(&b.bitrate_hint)
        .then(a.observed_at.cmp(&b.observed_at))
}

fn best_video<'a, I>(candidates: I) -> Option<&'a StreamCandidate>
where
    I: IntoIterator<Item = &'a StreamCandidate>,
{
    candidates.into_iter().max_by(|a, b| compare_video(a, b))
}

fn best_audio<'a, I>(candidates: I) -> Option<&'a StreamCandidate>
where
    I: IntoIterator<Item = &'a StreamCandidate>,
{
    candidates.into_iter().max_by(|a, b| compare_audio(a, b))
}

/// Groups candidates by asset id, in the order the groups were first seen.
/// Candidates without an asset id are left out.
pub fn asset_groups<'a>(candidates: &[&'a StreamCandidate]) -> Vec<AssetGroup<'a>> {
    let mut groups: Vec<AssetGroup<'a>> = Vec::new();
    for &candidate in candidates {
        let Some(asset_id) = candidate.asset_id.as_deref() else {
            continue;
        };
        match groups.iter_mut().find(|g| g.asset_id == asset_id) {
            Some(group) => {
                group.first_seen = group.first_seen.min(candidate.observed_at);
                group.members.push(candidate);
            }
            None => groups.push(AssetGroup {
                asset_id,
                members: vec![candidate],
                first_seen: candidate.observed_at,
            }),
        }
    }
    groups.sort_by_key(|g| g.first_seen);
    groups
}

/// Scores an asset group; `observed_rank` is the group's position in
/// first-seen order (0 = loaded first). Bigger, richer, earlier groups win.
pub fn score_group(group: &AssetGroup<'_>, observed_rank: usize) -> f64 {
    let megabytes = group.total_content_length() as f64 / 1_000_000.0;
    let variants = group.members.len() as f64;
    let quality = group.max_quality().unwrap_or(0) as f64;
    let bonus = if observed_rank < FIRST_OBSERVED_SLOTS { FIRST_OBSERVED_BONUS } else { 0.0 };

    megabytes * SIZE_WEIGHT_PER_MB + variants * VARIANT_WEIGHT + quality / QUALITY_DIVISOR + bonus
}

/// Reduces the candidate set to one video and one audio stream.
///
/// Video rules, first applicable wins: target match (high), single asset
/// group (medium), best-scoring asset group (medium), observed after the
/// interaction (medium), highest quality overall (low).
pub fn select(candidates: &[StreamCandidate], ctx: &SelectionContext) -> SelectionResult {
    let videos: Vec<&StreamCandidate> = candidates
        .iter()
        .filter(|c| c.media_kind == MediaKind::Video)
        .collect();

    let (chosen_video, rule) = choose_video(&videos, ctx);
    let confidence = match (chosen_video, rule) {
        (Some(video), _) if video.matches_target => Confidence::High,
        (Some(_), Some(SelectionRule::HighestQuality)) | (None, _) => Confidence::Low,
        (Some(_), _) => Confidence::Medium,
    };

    let chosen_audio = choose_audio(candidates, chosen_video);

    if let Some(rule) = rule {
        tracing::info!(
            "Selected video via {:?} ({:?} confidence) from {} video / {} total candidates",
            rule,
            confidence,
            videos.len(),
            candidates.len()
        );
    }

    SelectionResult {
        chosen_video: chosen_video.cloned(),
        chosen_audio: chosen_audio.cloned(),
        confidence,
        rule,
    }
}

fn choose_video<'a>(
    videos: &[&'a StreamCandidate],
    ctx: &SelectionContext,
) -> (Option<&'a StreamCandidate>, Option<SelectionRule>) {
    if let Some(best) = best_video(videos.iter().copied().filter(|c| c.matches_target)) {
        return (Some(best), Some(SelectionRule::TargetMatch));
    }

    let groups = asset_groups(videos);
    if groups.len() == 1 {
        return (best_video(groups[0].members.iter().copied()), Some(SelectionRule::SingleAsset));
    }
    if groups.len() > 1 {
        let winner = groups
            .iter()
            .enumerate()
            .map(|(rank, group)| (score_group(group, rank), group))
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, group)| group);
        if let Some(group) = winner {
            tracing::debug!("Asset group {} won with {} variants", group.asset_id, group.members.len());
            return (best_video(group.members.iter().copied()), Some(SelectionRule::AssetGroupScore));
        }
    }

    if let Some(interaction_at) = ctx.interaction_at {
        if let Some(best) = best_video(videos.iter().copied().filter(|c| c.observed_at > interaction_at)) {
            return (Some(best), Some(SelectionRule::PostInteraction));
        }
    }

    let fallback = videos.iter().copied().max_by(|a, b| {
        a.quality_hint
            .cmp(&b.quality_hint)
            .then(a.bitrate_hint.cmp(&b.bitrate_hint))
    });
    match fallback {
        Some(best) => (Some(best), Some(SelectionRule::HighestQuality)),
        None => (None, None),
    }
}

/// Audio: target match, then same asset as the chosen video, then highest
/// bitrate (most recent on a tie).
fn choose_audio<'a>(
    candidates: &'a [StreamCandidate],
    video: Option<&StreamCandidate>,
) -> Option<&'a StreamCandidate> {
    let audios: Vec<&StreamCandidate> = candidates
        .iter()
        .filter(|c| c.media_kind == MediaKind::Audio)
        .collect();

    if let Some(best) = best_audio(audios.iter().copied().filter(|c| c.matches_target)) {
        return Some(best);
    }
    if let Some(asset_id) = video.and_then(|v| v.asset_id.as_deref()) {
        if let Some(best) = best_audio(
            audios
                .iter()
                .copied()
                .filter(|c| c.asset_id.as_deref() == Some(asset_id)),
        ) {
            return Some(best);
        }
    }
    best_audio(audios)
}

/// Every video variant belonging to the same asset as `chosen`, best first.
pub fn quality_ladder<'a>(candidates: &'a [StreamCandidate], chosen: &StreamCandidate) -> Vec<&'a StreamCandidate> {
    let mut ladder: Vec<&StreamCandidate> = candidates
        .iter()
        .filter(|c| c.media_kind == MediaKind::Video)
        .filter(|c| match chosen.asset_id.as_deref() {
            Some(asset_id) => c.asset_id.as_deref() == Some(asset_id) || c.url == chosen.url,
            None => c.asset_id.is_none() || c.url == chosen.url,
        })
        .collect();
    ladder.sort_by(|a, b| compare_video(b, a));
    ladder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateOrigin, ContainerHint};
    use chrono::Duration;

    struct Fixture {
        url: &'static str,
        kind: MediaKind,
        quality: Option<u32>,
        bitrate: Option<u64>,
        container: ContainerHint,
        length: Option<u64>,
        asset: Option<&'static str>,
        target: bool,
        at_secs: i64,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                url: "https://cdn.example/v.mp4",
                kind: MediaKind::Video,
                quality: None,
                bitrate: None,
                container: ContainerHint::Unknown,
                length: None,
                asset: None,
                target: false,
                at_secs: 0,
            }
        }
    }

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn make(fixture: Fixture) -> StreamCandidate {
        StreamCandidate {
            url: fixture.url.to_string(),
            media_kind: fixture.kind,
            quality_hint: fixture.quality,
            bitrate_hint: fixture.bitrate,
            container_hint: fixture.container,
            content_length: fixture.length,
            asset_id: fixture.asset.map(String::from),
            matches_target: fixture.target,
            observed_at: base_time() + Duration::seconds(fixture.at_secs),
            origin: CandidateOrigin::Network,
        }
    }

    #[test]
    fn target_matches_are_selected_exclusively() {
        let candidates = vec![
            make(Fixture { url: "https://cdn.example/big.mp4", quality: Some(1080), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/match_360.mp4", quality: Some(360), target: true, ..Default::default() }),
            make(Fixture { url: "https://cdn.example/match_480.mp4", quality: Some(480), target: true, ..Default::default() }),
        ];
        let result = select(&candidates, &SelectionContext::default());
        let video = result.chosen_video.unwrap();
        assert!(video.matches_target);
        assert_eq!(video.url, "https://cdn.example/match_480.mp4");
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.rule, Some(SelectionRule::TargetMatch));
    }

    #[test]
    fn progressive_beats_segmented_at_equal_quality() {
        let candidates = vec![
            make(Fixture {
                url: "https://cdn.example/seg.m4s",
                quality: Some(720),
                bitrate: Some(9_000_000),
                container: ContainerHint::Segmented,
                target: true,
                ..Default::default()
            }),
            make(Fixture {
                url: "https://cdn.example/prog.mp4",
                quality: Some(720),
                bitrate: Some(1_000),
                container: ContainerHint::Progressive,
                target: true,
                ..Default::default()
            }),
        ];
        let result = select(&candidates, &SelectionContext::default());
        assert_eq!(result.chosen_video.unwrap().url, "https://cdn.example/prog.mp4");
    }

    #[test]
    fn single_asset_group_is_never_low_confidence() {
        let candidates = vec![
            make(Fixture { url: "https://cdn.example/a_360.mp4", quality: Some(360), asset: Some("A1"), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/a_720.mp4", quality: Some(720), asset: Some("A1"), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/a.m4a", kind: MediaKind::Audio, asset: Some("A1"), ..Default::default() }),
        ];
        let result = select(&candidates, &SelectionContext::default());
        assert_ne!(result.confidence, Confidence::Low);
        assert_eq!(result.rule, Some(SelectionRule::SingleAsset));
        assert_eq!(result.chosen_video.unwrap().url, "https://cdn.example/a_720.mp4");
        assert_eq!(result.chosen_audio.unwrap().url, "https://cdn.example/a.m4a");
    }

    #[test]
    fn larger_asset_group_wins_over_suggested_clip() {
        let candidates = vec![
            make(Fixture {
                url: "https://cdn.example/suggested.mp4",
                quality: Some(720),
                length: Some(2_000_000),
                asset: Some("SUGGESTED"),
                at_secs: 0,
                ..Default::default()
            }),
            make(Fixture {
                url: "https://cdn.example/main.mp4",
                quality: Some(720),
                length: Some(40_000_000),
                asset: Some("MAIN"),
                at_secs: 1,
                ..Default::default()
            }),
        ];
        let result = select(&candidates, &SelectionContext::default());
        assert_eq!(result.chosen_video.unwrap().url, "https://cdn.example/main.mp4");
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(result.rule, Some(SelectionRule::AssetGroupScore));
    }

    #[test]
    fn score_group_table() {
        let a = make(Fixture { length: Some(10_000_000), quality: Some(720), asset: Some("G"), ..Default::default() });
        let b = make(Fixture { url: "https://cdn.example/b.mp4", length: Some(5_000_000), quality: Some(360), asset: Some("G"), ..Default::default() });
        let c = make(Fixture { asset: Some("H"), ..Default::default() });

        let cases: Vec<(Vec<&StreamCandidate>, usize, f64)> = vec![
            // 15 MB + 2 variants + 720/100 + bonus
            (vec![&a, &b], 0, 15.0 + 10.0 + 7.2 + 10.0),
            (vec![&a, &b], 2, 15.0 + 10.0 + 7.2),
            // unknown length and quality contribute nothing
            (vec![&c], 1, 5.0 + 10.0),
            (vec![&c], 5, 5.0),
        ];
        for (members, rank, expected) in cases {
            let group = AssetGroup { asset_id: "G", members, first_seen: base_time() };
            let score = score_group(&group, rank);
            assert!((score - expected).abs() < 1e-9, "rank {rank}: {score} != {expected}");
        }
    }

    #[test]
    fn post_interaction_candidates_preferred_without_assets() {
        let candidates = vec![
            make(Fixture { url: "https://cdn.example/before.mp4", quality: Some(1080), at_secs: 1, ..Default::default() }),
            make(Fixture { url: "https://cdn.example/after.mp4", quality: Some(480), at_secs: 10, ..Default::default() }),
        ];
        let ctx = SelectionContext { interaction_at: Some(base_time() + Duration::seconds(5)) };
        let result = select(&candidates, &ctx);
        assert_eq!(result.chosen_video.unwrap().url, "https://cdn.example/after.mp4");
        assert_eq!(result.rule, Some(SelectionRule::PostInteraction));
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[test]
    fn fallback_is_highest_quality_then_bitrate_with_low_confidence() {
        let candidates = vec![
            make(Fixture { url: "https://cdn.example/1.mp4", quality: Some(720), bitrate: Some(100), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/2.mp4", quality: Some(720), bitrate: Some(900), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/3.mp4", quality: Some(480), bitrate: Some(5_000), ..Default::default() }),
        ];
        let result = select(&candidates, &SelectionContext::default());
        assert_eq!(result.chosen_video.unwrap().url, "https://cdn.example/2.mp4");
        assert_eq!(result.confidence, Confidence::Low);
    }

    #[test]
    fn audio_falls_back_to_highest_bitrate_most_recent() {
        let candidates = vec![
            make(Fixture { url: "https://cdn.example/v.mp4", quality: Some(720), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/a1.m4a", kind: MediaKind::Audio, bitrate: Some(64_000), at_secs: 1, ..Default::default() }),
            make(Fixture { url: "https://cdn.example/a2.m4a", kind: MediaKind::Audio, bitrate: Some(128_000), at_secs: 2, ..Default::default() }),
            make(Fixture { url: "https://cdn.example/a3.m4a", kind: MediaKind::Audio, bitrate: Some(128_000), at_secs: 3, ..Default::default() }),
        ];
        let result = select(&candidates, &SelectionContext::default());
        assert_eq!(result.chosen_audio.unwrap().url, "https://cdn.example/a3.m4a");
    }

    #[test]
    fn audio_only_page_has_no_video_and_low_confidence() {
        let candidates = vec![make(Fixture { url: "https://cdn.example/a.m4a", kind: MediaKind::Audio, ..Default::default() })];
        let result = select(&candidates, &SelectionContext::default());
        assert!(result.chosen_video.is_none());
        assert!(result.chosen_audio.is_some());
        assert_eq!(result.confidence, Confidence::Low);
    }

    #[test]
    fn ladder_lists_same_asset_best_first() {
        let candidates = vec![
            make(Fixture { url: "https://cdn.example/a_360.mp4", quality: Some(360), asset: Some("A"), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/b_1080.mp4", quality: Some(1080), asset: Some("B"), ..Default::default() }),
            make(Fixture { url: "https://cdn.example/a_720.mp4", quality: Some(720), asset: Some("A"), ..Default::default() }),
        ];
        let ladder = quality_ladder(&candidates, &candidates[0]);
        let urls: Vec<&str> = ladder.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://cdn.example/a_720.mp4", "https://cdn.example/a_360.mp4"]);
    }
}
