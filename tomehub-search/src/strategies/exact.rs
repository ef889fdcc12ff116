use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tomehub_core::text::{contains_exact_term_boundary, deaccent, normalize_match_text};
use tomehub_db::Store;
use tomehub_db::models::{ChunkHit, SearchFilters};

use crate::errors::SearchResult;
use crate::strategies::Strategy;
use crate::types::Intent;

/// Exact (de-accented) matching with a two-pass retrieval plan.
///
/// The primary pass requires every query token to appear; when it returns
/// fewer than `min_rows` candidates a LIKE-substring pass backfills it,
/// preserving primary order. Every candidate is verified against a word
/// boundary before scoring, so inner-word matches never escape.
pub struct ExactStrategy {
    store: Arc<dyn Store>,
    min_rows: usize,
    single_token_enabled: bool,
}

impl ExactStrategy {
    pub fn new(store: Arc<dyn Store>, min_rows: usize, single_token_enabled: bool) -> Self {
        Self {
            store,
            min_rows: min_rows.clamp(1, 500),
            single_token_enabled,
        }
    }

    fn query_tokens(query: &str) -> Vec<String> {
        normalize_match_text(query)
            .split_whitespace()
            .filter(|t| t.len() >= 2)
            .take(8)
            .map(str::to_string)
            .collect()
    }

    fn merge_prefer_first(primary: Vec<ChunkHit>, secondary: Vec<ChunkHit>, max_rows: usize) -> Vec<ChunkHit> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for hit in primary.into_iter().chain(secondary) {
            if out.len() >= max_rows {
                break;
            }
            if seen.insert(hit.id.clone()) {
                out.push(hit);
            }
        }
        out
    }

    async fn run_passes(
        &self,
        query: &str,
        pattern: &str,
        user: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> SearchResult<(Vec<ChunkHit>, &'static str)> {
        let tokens = Self::query_tokens(query);
        let token_pass_enabled =
            tokens.len() >= 2 || (tokens.len() == 1 && self.single_token_enabled);
        let candidate_cap = (limit * 4).max(limit + 40).min(2500);

        let mut rows = Vec::new();
        let mut match_mode = "exact_deaccented";

        if token_pass_enabled {
            rows = self.store.search_exact_tokens(user, &tokens, filters, limit).await?;
            match_mode = "exact_fulltext";
            if rows.len() < self.min_rows {
                let legacy = self.store.search_exact(user, pattern, filters, limit).await?;
                rows = Self::merge_prefer_first(rows, legacy, candidate_cap);
                match_mode = "exact_fulltext_backfill";
            }
        }

        if rows.is_empty() {
            rows = self.store.search_exact(user, pattern, filters, limit).await?;
            match_mode = "exact_deaccented";
        }

        Ok((rows, match_mode))
    }
}

#[async_trait]
impl Strategy for ExactStrategy {
    fn name(&self) -> &'static str {
        "ExactMatchStrategy"
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
        let pattern = deaccent(query);
        if pattern.trim().is_empty() {
            return Ok(Vec::new());
        }

        let first_pass = filters.with_exclude_pdf(true);
        let (mut rows, mut match_mode) = self.run_passes(query, &pattern, user, limit, &first_pass).await?;

        // Fallback pass with PDF included, only when the query is not scoped.
        if rows.is_empty() && !filters.scoped() {
            debug!("exact strategy: no first-pass results, trying PDF-inclusive fallback");
            let fallback = filters.with_exclude_pdf(false);
            let (fb_rows, fb_mode) = self.run_passes(query, &pattern, user, limit, &fallback).await?;
            rows = fb_rows;
            match_mode = fb_mode;
        }

        let mut results = Vec::new();
        for mut hit in rows {
            let haystack = hit.normalized_text.as_deref().unwrap_or(&hit.text);
            if !contains_exact_term_boundary(haystack, &pattern) {
                continue;
            }
            hit.score = 100.0;
            hit.match_type = match_mode.to_string();
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

    fn hit(id: &str, text: &str) -> ChunkHit {
        ChunkHit {
            id: id.to_string(),
            title: "t".to_string(),
            text: text.to_string(),
            source_type: "PDF_CHUNK".to_string(),
            page_number: None,
            chunk_index: None,
            tags: None,
            summary: None,
            comment: None,
            book_id: None,
            normalized_text: Some(normalize_match_text(text)),
            score: 0.0,
            match_type: String::new(),
        }
    }

    #[test]
    fn tokens_are_capped_and_filtered() {
        let tokens = ExactStrategy::query_tokens("a vicdan, nedir? b c d e f g h i j");
        assert!(tokens.len() <= 8);
        assert!(tokens.iter().all(|t| t.len() >= 2));
        assert!(tokens.contains(&"vicdan".to_string()));
    }

    #[test]
    fn merge_preserves_primary_order() {
        let primary = vec![hit("1", "one"), hit("2", "two")];
        let secondary = vec![hit("2", "two"), hit("3", "three")];
        let merged = ExactStrategy::merge_prefer_first(primary, secondary, 10);
        let ids: Vec<&str> = merged.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
