//! Result fusion: weighted Reciprocal Rank Fusion plus the deterministic
//! concatenation path (`exact -> lemma -> semantic`, dedup keeps the
//! earliest appearance).

use std::collections::HashMap;

use tomehub_db::models::ChunkHit;

use crate::types::Intent;

pub const RRF_K: usize = 60;

/// Compute weighted RRF scores over ranked key lists.
///
/// When no weights are given, three rankings default to `[0.5, 0.25, 0.25]`
/// (lexical list prioritized); any other count gets equal weights.
pub fn compute_rrf(rankings: &[Vec<String>], k: usize, weights: Option<&[f64]>) -> HashMap<String, f64> {
    let default_weights: Vec<f64> = match weights {
        Some(w) => w.to_vec(),
        None if rankings.len() == 3 => vec![0.5, 0.25, 0.25],
        None => vec![1.0; rankings.len()],
    };

    let mut scores: HashMap<String, f64> = HashMap::new();
    for (idx, ranking) in rankings.iter().enumerate() {
        let weight = default_weights.get(idx).copied().unwrap_or(1.0);
        for (rank, key) in ranking.iter().enumerate() {
            *scores.entry(key.clone()).or_insert(0.0) += weight * (1.0 / (k + rank + 1) as f64);
        }
    }
    scores
}

/// Per-intent bucket weights in `[exact, lemma, semantic]` order.
pub fn intent_weights(intent: Intent) -> [f64; 3] {
    match intent {
        Intent::Direct | Intent::CitationSeeking | Intent::FollowUp => [0.55, 0.30, 0.15],
        Intent::Synthesis | Intent::Narrative | Intent::Societal | Intent::Comparative => {
            [0.20, 0.20, 0.60]
        }
    }
}

/// Source-type ordering inside a bucket: notes first, raw chunks last.
pub fn source_priority(hit: &ChunkHit) -> f64 {
    match hit.source_type.as_str() {
        "HIGHLIGHT" => 1.0,
        "INSIGHT" => 2.0,
        "NOTES" => 3.0,
        _ => {
            if hit.comment.as_deref().is_some_and(|c| !c.is_empty()) {
                2.5
            } else {
                4.0
            }
        }
    }
}

/// Sort a bucket in place by `(source_priority, -score)`.
pub fn sort_bucket(bucket: &mut [ChunkHit]) {
    bucket.sort_by(|a, b| {
        source_priority(a)
            .partial_cmp(&source_priority(b))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
}

/// Strict concatenation with dedup by item key; earliest appearance wins.
pub fn concat_buckets(buckets: Vec<(Vec<ChunkHit>, &str)>) -> Vec<ChunkHit> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for (bucket, fallback_match) in buckets {
        for mut hit in bucket {
            let key = hit.item_key();
            if seen.insert(key) {
                if hit.match_type.is_empty() {
                    hit.match_type = fallback_match.to_string();
                }
                out.push(hit);
            }
        }
    }
    out
}

/// RRF-fuse labelled buckets using per-intent weights.
///
/// Ties break by bucket priority (exact before lemma before semantic), then
/// raw score.
pub fn rrf_fuse_buckets(
    bucket_exact: Vec<ChunkHit>,
    bucket_lemma: Vec<ChunkHit>,
    bucket_semantic: Vec<ChunkHit>,
    intent: Intent,
) -> Vec<ChunkHit> {
    let weights_by_intent = intent_weights(intent);
    let bucket_defs: Vec<(Vec<ChunkHit>, usize, &str, f64)> = vec![
        (bucket_exact, 0, "content_exact", weights_by_intent[0]),
        (bucket_lemma, 1, "content_fuzzy", weights_by_intent[1]),
        (bucket_semantic, 2, "semantic", weights_by_intent[2]),
    ];

    let mut candidate_pool: HashMap<String, (ChunkHit, usize)> = HashMap::new();
    let mut rankings: Vec<Vec<String>> = Vec::new();
    let mut weights: Vec<f64> = Vec::new();

    for (bucket, bucket_priority, fallback_match, weight) in bucket_defs {
        if bucket.is_empty() {
            continue;
        }
        let mut ranking = Vec::with_capacity(bucket.len());
        for hit in bucket {
            let key = hit.item_key();
            ranking.push(key.clone());
            match candidate_pool.get_mut(&key) {
                None => {
                    let mut copied = hit;
                    if copied.match_type.is_empty() {
                        copied.match_type = fallback_match.to_string();
                    }
                    candidate_pool.insert(key, (copied, bucket_priority));
                }
                Some((existing, _)) => {
                    if hit.score > existing.score {
                        existing.score = hit.score;
                    }
                }
            }
        }
        rankings.push(ranking);
        weights.push(weight);
    }

    let rrf_scores = compute_rrf(&rankings, RRF_K, Some(&weights));
    let mut fused: Vec<(ChunkHit, usize, f64)> = rrf_scores
        .into_iter()
        .filter_map(|(key, rrf)| candidate_pool.remove(&key).map(|(hit, prio)| (hit, prio, rrf)))
        .collect();

    fused.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(
                b.0.score
                    .partial_cmp(&a.0.score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });

    fused.into_iter().map(|(hit, _, _)| hit).collect()
}
