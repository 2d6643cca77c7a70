use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::subtitles::SubtitleFormat;

use super::{Candidate, VideoQuery};

/// Additive weights per scored field. The raw sum is clamped into
/// [0, 1000] after the per-provider modifier is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub language_match: i64,
    pub release_group_match: i64,
    pub hearing_impaired_alignment: i64,
    pub source_hash_hint: i64,
    pub year_match: i64,
    pub format_preference: i64,
    pub size_sanity: i64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            language_match: 300,
            release_group_match: 200,
            hearing_impaired_alignment: 100,
            source_hash_hint: 200,
            year_match: 50,
            format_preference: 50,
            size_sanity: 100,
        }
    }
}

/// Subtitle files outside this window are suspicious (truncated uploads,
/// archives mislabeled as subtitles).
const SANE_SIZE_RANGE: std::ops::Range<i64> = 512..2_000_000;

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: i64,
}

pub fn score_candidate(
    query: &VideoQuery,
    candidate: &Candidate,
    weights: &ScoreWeights,
    hearing_impaired_wanted: bool,
    provider_modifier: i64,
) -> i64 {
    let mut score = 0i64;

    if query
        .languages
        .iter()
        .any(|l| l.eq_ignore_ascii_case(&candidate.language))
    {
        score += weights.language_match;
    }
    if let (Some(query_group), Some(candidate_group)) =
        (&query.release_group, &candidate.release_group)
    {
        if query_group.eq_ignore_ascii_case(candidate_group) {
            score += weights.release_group_match;
        }
    }
    if candidate.hearing_impaired == hearing_impaired_wanted {
        score += weights.hearing_impaired_alignment;
    }
    if candidate.matched_by_hash && query.source_hash.is_some() {
        score += weights.source_hash_hint;
    }
    if let (Some(query_year), Some(candidate_year)) = (query.year, candidate.year) {
        if query_year == candidate_year {
            score += weights.year_match;
        }
    }
    if candidate.format == Some(SubtitleFormat::Srt) {
        score += weights.format_preference;
    }
    match candidate.size_bytes {
        Some(size) if SANE_SIZE_RANGE.contains(&size) => score += weights.size_sanity,
        None => score += weights.size_sanity / 2,
        Some(_) => {}
    }

    (score + provider_modifier.clamp(-100, 100)).clamp(0, 1000)
}

/// Score and sort candidates descending, with a stable tie-break on
/// `(provider priority, external_id)`.
pub fn rank(
    query: &VideoQuery,
    candidates: Vec<Candidate>,
    weights: &ScoreWeights,
    hearing_impaired_wanted: bool,
    modifiers: &HashMap<String, i64>,
    priorities: &HashMap<String, i32>,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|candidate| {
            let modifier = modifiers
                .get(&candidate.provider_name)
                .copied()
                .unwrap_or(0);
            let score =
                score_candidate(query, &candidate, weights, hearing_impaired_wanted, modifier);
            ScoredCandidate { candidate, score }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| {
                let pa = priorities.get(&a.candidate.provider_name).copied().unwrap_or(0);
                let pb = priorities.get(&b.candidate.provider_name).copied().unwrap_or(0);
                pb.cmp(&pa)
            })
            .then_with(|| a.candidate.external_id.cmp(&b.candidate.external_id))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> VideoQuery {
        VideoQuery {
            title: "Show".into(),
            year: Some(2020),
            season: Some(1),
            episode: Some(2),
            languages: vec!["en".into()],
            subtitle_type: None,
            release_group: Some("NTb".into()),
            resolution: None,
            source_hash: Some("abcd".into()),
            forced_only: false,
        }
    }

    fn candidate(id: &str) -> Candidate {
        Candidate {
            provider_name: "a".into(),
            external_id: id.into(),
            language: "en".into(),
            release_group: None,
            format: Some(SubtitleFormat::Srt),
            file_name: None,
            year: None,
            size_bytes: Some(40_000),
            foreign_parts_only: false,
            hearing_impaired: false,
            matched_by_hash: false,
            metadata: Default::default(),
        }
    }

    #[test]
    fn score_is_clamped() {
        let weights = ScoreWeights::default();
        let mut best = candidate("1");
        best.release_group = Some("ntb".into());
        best.matched_by_hash = true;
        best.year = Some(2020);
        let score = score_candidate(&query(), &best, &weights, false, 100);
        assert_eq!(score, 1000);

        let mut worst = candidate("2");
        worst.language = "fr".into();
        worst.size_bytes = Some(10);
        worst.format = None;
        worst.hearing_impaired = true;
        let score = score_candidate(&query(), &worst, &weights, false, -100);
        assert_eq!(score, 0);
    }

    #[test]
    fn each_weight_is_order_preserving() {
        let weights = ScoreWeights::default();
        let base = candidate("1");
        let base_score = score_candidate(&query(), &base, &weights, false, 0);

        let mut with_group = base.clone();
        with_group.release_group = Some("NTb".into());
        assert!(score_candidate(&query(), &with_group, &weights, false, 0) > base_score);

        let mut with_hash = base.clone();
        with_hash.matched_by_hash = true;
        assert!(score_candidate(&query(), &with_hash, &weights, false, 0) > base_score);

        let mut with_year = base.clone();
        with_year.year = Some(2020);
        assert!(score_candidate(&query(), &with_year, &weights, false, 0) > base_score);
    }

    #[test]
    fn ranking_breaks_ties_deterministically() {
        let mut priorities = HashMap::new();
        priorities.insert("a".to_string(), 10);
        priorities.insert("b".to_string(), 5);
        let mut from_b = candidate("0");
        from_b.provider_name = "b".into();
        let ranked = rank(
            &query(),
            vec![from_b, candidate("2"), candidate("1")],
            &ScoreWeights::default(),
            false,
            &HashMap::new(),
            &priorities,
        );
        // equal scores: provider priority first, then external id
        assert_eq!(ranked[0].candidate.provider_name, "a");
        assert_eq!(ranked[0].candidate.external_id, "1");
        assert_eq!(ranked[1].candidate.external_id, "2");
        assert_eq!(ranked[2].candidate.provider_name, "b");
    }

    #[test]
    fn hearing_impaired_alignment_cuts_both_ways() {
        let weights = ScoreWeights::default();
        let mut hi = candidate("1");
        hi.hearing_impaired = true;
        let aligned = score_candidate(&query(), &hi, &weights, true, 0);
        let misaligned = score_candidate(&query(), &hi, &weights, false, 0);
        assert!(aligned > misaligned);
    }
}
