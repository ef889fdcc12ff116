//! Typed read/write contract the retrieval core depends on.
//!
//! The SQL dialect behind these queries is an implementation detail; the
//! core only assumes a store can answer them. Every search query must AND
//! in the visibility clause carried by `SearchFilters`.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DbResult;
use crate::models::{
    BookRef, ChunkHit, ExternalEdge, ExternalMeta, GraphHit, KwicContext, SearchFilters,
    SearchLogEntry,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Substring match on `normalized_text` (the LIKE backfill pass).
    async fn search_exact(
        &self,
        user: &str,
        pattern: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>>;

    /// Token-AND match on `normalized_text` (the primary full-text pass).
    async fn search_exact_tokens(
        &self,
        user: &str,
        tokens: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>>;

    /// Candidates whose lemma set contains any of the query lemmas.
    async fn search_lemma(
        &self,
        user: &str,
        lemmas: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>>;

    /// Nearest-neighbour by cosine distance divided by `rag_weight`.
    async fn search_vector(
        &self,
        user: &str,
        query_vec: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>>;

    /// 1-hop traversal: seed concepts -> relations -> neighbor chunks.
    async fn graph_neighbors(
        &self,
        user: &str,
        seeds: &[i64],
        min_strength: f64,
        limit: usize,
        offset: usize,
    ) -> DbResult<Vec<GraphHit>>;

    /// Concept ids whose name or alias contains the needle (case-insensitive).
    async fn concepts_by_text(&self, needle: &str, limit: usize) -> DbResult<Vec<i64>>;

    /// Concept ids matching the given names exactly (case-insensitive).
    async fn concepts_by_names(&self, names: &[String]) -> DbResult<Vec<i64>>;

    /// Concept ids nearest to the query vector over description embeddings.
    async fn concepts_by_vector(&self, query_vec: &[f32], limit: usize) -> DbResult<Vec<i64>>;

    /// `(content_id, concept_name, concept_id)` links for the given chunks.
    async fn concept_links_for_chunks(&self, chunk_ids: &[i64]) -> DbResult<Vec<(i64, String, i64)>>;

    /// `(concept_a, rel_type, concept_b)` bridges touching the given concepts.
    async fn concept_bridges(
        &self,
        concept_ids: &[i64],
        limit: usize,
    ) -> DbResult<Vec<(String, String, String)>>;

    /// Pre-populated external KB edges for a book, newest first.
    async fn external_edges(
        &self,
        user: &str,
        item_id: &str,
        limit: usize,
    ) -> DbResult<Vec<ExternalEdge>>;

    async fn external_meta(&self, user: &str, item_id: &str) -> DbResult<ExternalMeta>;

    /// `(item_id, title, author)` catalog for title resolution.
    async fn book_title_catalog(&self, user: &str) -> DbResult<Vec<BookRef>>;

    /// All book ids the user may run compare retrieval against.
    async fn user_book_ids(&self, user: &str) -> DbResult<HashSet<String>>;

    /// Shadow-table candidates for the ODL rescue strategy (READY items only).
    async fn odl_shadow_candidates(
        &self,
        user: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>>;

    /// Total occurrences of any candidate term within a book's chunks.
    async fn count_term_occurrences(
        &self,
        user: &str,
        book_id: &str,
        candidates: &[String],
    ) -> DbResult<usize>;

    /// KWIC snippets centred on candidate-term occurrences.
    async fn keyword_contexts(
        &self,
        user: &str,
        book_id: &str,
        candidates: &[String],
        limit: usize,
    ) -> DbResult<Vec<KwicContext>>;

    /// Best-effort analytics insert; returns the new log id when available.
    async fn log_search(&self, entry: &SearchLogEntry) -> DbResult<Option<i64>>;

    /// Merge extra diagnostics into an existing log row's strategy details.
    async fn append_log_diagnostics(&self, log_id: i64, diagnostics: &Value) -> DbResult<()>;

    /// Record the model that ultimately produced the answer.
    async fn update_log_model(&self, log_id: i64, model_name: &str) -> DbResult<()>;
}
