use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tomehub_db::Store;
use tomehub_db::models::{ChunkHit, LengthFilter, SearchFilters};

use crate::embeddings::Embedder;
use crate::errors::SearchResult;
use crate::strategies::Strategy;
use crate::types::Intent;

/// Vector/semantic search with intent-dependent sweeping.
///
/// Direct-style questions sweep once broadly and once over short chunks;
/// narrative questions prefer long literary passages.
pub struct SemanticStrategy {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    output_dim: usize,
}

impl SemanticStrategy {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, output_dim: usize) -> Self {
        Self { store, embedder, output_dim }
    }

    async fn run_sweeps(
        &self,
        vector: &[f32],
        user: &str,
        limit: usize,
        intent: Intent,
        filters: &SearchFilters,
    ) -> SearchResult<Vec<ChunkHit>> {
        let mut rows = Vec::new();
        match intent {
            Intent::Direct | Intent::FollowUp => {
                let sweep_limit = (limit / 2).max(5);
                rows.extend(self.store.search_vector(user, vector, filters, sweep_limit).await?);
                let short = filters.with_length(Some(LengthFilter::Short));
                rows.extend(self.store.search_vector(user, vector, &short, sweep_limit).await?);
            }
            Intent::Narrative => {
                rows.extend(self.store.search_vector(user, vector, filters, 15).await?);
                let long = filters.with_length(Some(LengthFilter::Long));
                rows.extend(self.store.search_vector(user, vector, &long, 10).await?);
            }
            _ => {
                rows.extend(self.store.search_vector(user, vector, filters, limit).await?);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl Strategy for SemanticStrategy {
    fn name(&self) -> &'static str {
        "SemanticMatchStrategy"
    }

    async fn search(
        &self,
        query: &str,
        user: &str,
        limit: usize,
        _offset: usize,
        intent: Intent,
        filters: &SearchFilters,
    ) -> SearchResult<Vec<ChunkHit>> {
        let embeddings = self
            .embedder
            .embed(&[query.to_string()], "retrieval_query", self.output_dim)
            .await?;
        let Some(vector) = embeddings.into_iter().next().filter(|v| !v.is_empty()) else {
            return Ok(Vec::new());
        };

        let first_pass = filters.with_exclude_pdf(true);
        let mut rows = self.run_sweeps(&vector, user, limit, intent, &first_pass).await?;

        if rows.is_empty() && !filters.scoped() {
            debug!("semantic strategy: no results without PDF content, trying PDF fallback");
            let fallback = filters.with_exclude_pdf(false);
            rows = self.run_sweeps(&vector, user, limit, intent, &fallback).await?;
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut results: Vec<ChunkHit> = Vec::new();
        for mut hit in rows {
            if !seen.insert(hit.id.clone()) {
                continue;
            }
            // The store reports the weighted cosine distance in `score`.
            let dist = hit.score;
            hit.score = ((1.0 - dist) * 100.0).max(0.0);
            hit.match_type = "semantic".to_string();
            hit.normalized_text = None;
            results.push(hit);
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }
}
