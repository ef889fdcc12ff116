//! Additive rescue retrieval from the ODL shadow table (secondary PDF
//! extractor output). Only ever adds candidates; never replaces the standard
//! buckets.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use tomehub_core::text::{
    contains_exact_term_boundary, contains_lemma_stem_boundary, count_lemma_stem_hits, deaccent,
    filter_query_lemmas, get_lemmas,
};
use tomehub_db::Store;
use tomehub_db::models::{ChunkHit, ResourceType, SearchFilters};

use crate::errors::SearchResult;
use crate::strategies::Strategy;
use crate::types::Intent;

const PDF_LIKE: &[&str] = &["PDF", "EPUB", "PDF_CHUNK"];

pub struct OdlShadowRescueStrategy {
    store: Arc<dyn Store>,
}

impl OdlShadowRescueStrategy {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The shadow table only serves PDF-like content.
    fn applies_to(filters: &SearchFilters) -> bool {
        if let Some(ct) = filters.content_type.as_deref() {
            if !PDF_LIKE.contains(&ct.trim().to_uppercase().as_str()) {
                return false;
            }
        }
        match &filters.resource_type {
            None => true,
            Some(ResourceType::Book) => true,
            Some(ResourceType::Raw(raw)) => PDF_LIKE.contains(&raw.as_str()),
            Some(_) => false,
        }
    }
}

#[async_trait]
impl Strategy for OdlShadowRescueStrategy {
    fn name(&self) -> &'static str {
        "OdlShadowRescueStrategy"
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
        if !Self::applies_to(filters) {
            return Ok(Vec::new());
        }
        let query_text = query.trim();
        if query_text.is_empty() {
            return Ok(Vec::new());
        }

        let q_deaccented = deaccent(query_text);
        let lemma_candidates: Vec<String> = filter_query_lemmas(&get_lemmas(query_text))
            .into_iter()
            .take(6)
            .collect();

        let rescue_limit = limit.max(1);
        let candidate_limit = (rescue_limit * 24).max(200).min(1200);
        let rows = match self.store.odl_shadow_candidates(user, filters, candidate_limit).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "odl shadow rescue fetch failed");
                return Ok(Vec::new());
            }
        };

        let token_count = query_text.split_whitespace().count();
        let mut out = Vec::new();
        for mut hit in rows {
            if hit.text.is_empty() {
                continue;
            }
            let haystack = hit.normalized_text.clone().unwrap_or_else(|| hit.text.clone());

            let exact_hit = contains_exact_term_boundary(&haystack, &q_deaccented);
            let lemma_hits = if lemma_candidates.is_empty() {
                0
            } else {
                count_lemma_stem_hits(&haystack, &lemma_candidates)
            };
            if !exact_hit && lemma_hits == 0 {
                continue;
            }

            let mut score;
            if exact_hit {
                score = 65.0 + (token_count as f64 * 2.0).min(20.0) + (lemma_hits as f64 * 2.0).min(10.0);
                hit.match_type = "odl_shadow_exact".to_string();
            } else {
                score = 40.0 + (lemma_hits as f64 * 5.0).min(35.0);
                hit.match_type = "odl_shadow_lemma".to_string();
            }

            if !hit.title.is_empty()
                && (contains_exact_term_boundary(&hit.title, &q_deaccented)
                    || lemma_candidates
                        .iter()
                        .any(|lemma| contains_lemma_stem_boundary(&hit.title, lemma)))
            {
                score += 4.0;
            }

            hit.score = score.min(99.0);
            out.push(hit);
            if out.len() >= rescue_limit {
                break;
            }
        }
        Ok(out)
    }
}
