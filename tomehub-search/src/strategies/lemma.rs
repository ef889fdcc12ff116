use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tomehub_core::text::{
    contains_inner_substring_only, contains_lemma_stem_boundary, count_lemma_stem_hits,
    filter_query_lemmas, get_lemmas,
};
use tomehub_db::Store;
use tomehub_db::models::{ChunkHit, SearchFilters};

use crate::errors::SearchResult;
use crate::strategies::Strategy;
use crate::types::Intent;

const MAX_LEMMA_CANDIDATES: usize = 5;

/// Lemma-based (fuzzy-ish) matching.
///
/// Candidates are fetched by lemma-token containment, then verified on a
/// stem boundary so `niyet` admits `niyetli` but never `medeniyet`.
pub struct LemmaStrategy {
    store: Arc<dyn Store>,
}

impl LemmaStrategy {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Strategy for LemmaStrategy {
    fn name(&self) -> &'static str {
        "LemmaMatchStrategy"
    }

    async fn search(
        &self,
        query: &str,
        user: &str,
        limit: usize,
        _offset: usize,
        _intent: Intent,
        filters: &SearchFilters,
    ) -> SearchResult<Vec<ChunkHit>> {
        let lemmas = filter_query_lemmas(&get_lemmas(query));
        if lemmas.is_empty() {
            return Ok(Vec::new());
        }
        let candidates: Vec<String> = lemmas.into_iter().take(MAX_LEMMA_CANDIDATES).collect();

        let first_pass = filters.with_exclude_pdf(true);
        let mut rows = self.store.search_lemma(user, &candidates, &first_pass, limit).await?;

        if rows.is_empty() && !filters.scoped() {
            debug!("lemma strategy: no results without PDF content, trying PDF fallback");
            let fallback = filters.with_exclude_pdf(false);
            rows = self.store.search_lemma(user, &candidates, &fallback, limit).await?;
        }

        let mut results = Vec::new();
        for mut hit in rows {
            let haystack = hit.normalized_text.clone().unwrap_or_else(|| hit.text.clone());
            if !candidates.iter().any(|lemma| contains_lemma_stem_boundary(&haystack, lemma)) {
                continue;
            }
            let hit_count = count_lemma_stem_hits(&haystack, &candidates);
            if hit_count == 0 {
                continue;
            }
            // A single lemma whose only occurrence hides inside a longer
            // title token is noise, not a match.
            if candidates.len() == 1
                && hit_count == 1
                && contains_inner_substring_only(&hit.title, &candidates[0])
            {
                continue;
            }

            let title_boost = if candidates
                .iter()
                .any(|lemma| contains_lemma_stem_boundary(&hit.title, lemma))
            {
                4.0
            } else {
                0.0
            };
            hit.score = (70.0 + (hit_count as f64) * 5.0 + title_boost).min(95.0);
            hit.match_type = "lemma_fuzzy".to_string();
            results.push(hit);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_formula_is_capped() {
        let score = |hits: usize, boost: f64| (70.0 + hits as f64 * 5.0 + boost).min(95.0f64);
        assert_eq!(score(1, 0.0), 75.0);
        assert_eq!(score(2, 4.0), 84.0);
        assert_eq!(score(10, 4.0), 95.0);
    }
}
