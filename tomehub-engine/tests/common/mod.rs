//! Shared harness for engine integration tests: a filter-aware mock store,
//! deterministic collaborators, and canned LLM providers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use tomehub_core::Settings;
use tomehub_core::text::normalize_match_text;
use tomehub_db::error::DbResult;
use tomehub_db::models::{
    BookRef, ChunkHit, ExternalEdge, ExternalMeta, GraphHit, KwicContext, ResourceType,
    SearchFilters, SearchLogEntry,
};
use tomehub_db::store::Store;
use tomehub_engine::context::{ContextAssembler, NoopQueryRewriter};
use tomehub_engine::epistemic::FastPassageClassifier;
use tomehub_engine::llm::LlmRouter;
use tomehub_engine::network::KeywordCoverageClassifier;
use tomehub_engine::providers::{GenerateRequest, LlmProvider, ProviderError, ProviderResponse};
use tomehub_search::cache::MultiLayerCache;
use tomehub_search::embeddings::Embedder;
use tomehub_search::errors::SearchResult;
use tomehub_search::expander::{NoopVariationGenerator, QueryExpander};
use tomehub_search::orchestrator::SearchOrchestrator;
use tomehub_search::spell::NoopSpellChecker;
use tomehub_search::strategies::{
    ExternalKbStrategy, GraphTraverseStrategy, NoopConceptExtractor, SemanticStrategy,
};

pub fn chunk(id: &str, book_id: &str, title: &str, source_type: &str, text: &str) -> ChunkHit {
    ChunkHit {
        id: id.to_string(),
        title: title.to_string(),
        text: text.to_string(),
        source_type: source_type.to_string(),
        page_number: Some(1),
        chunk_index: None,
        tags: None,
        summary: None,
        comment: None,
        book_id: Some(book_id.to_string()),
        normalized_text: Some(normalize_match_text(text)),
        score: 0.0,
        match_type: String::new(),
    }
}

const BOOK_TYPES: &[&str] = &["PDF", "EPUB", "PDF_CHUNK", "BOOK", "HIGHLIGHT", "INSIGHT", "NOTES"];
const NOTES_TYPES: &[&str] = &["HIGHLIGHT", "INSIGHT", "NOTES"];

/// Filter-aware mock store over a canned corpus.
#[derive(Default)]
pub struct MockStore {
    pub corpus: Vec<ChunkHit>,
    pub catalog: Vec<BookRef>,
    pub user_books: HashSet<String>,
    pub term_count: usize,
    pub delay: Option<Duration>,
}

impl MockStore {
    fn matches_filters(hit: &ChunkHit, filters: &SearchFilters) -> bool {
        if let Some(book_id) = filters.book_id.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            if hit.book_id.as_deref() != Some(book_id) {
                return false;
            }
        }
        match &filters.resource_type {
            Some(ResourceType::Book) => {
                if !BOOK_TYPES.contains(&hit.source_type.as_str()) {
                    return false;
                }
            }
            Some(ResourceType::AllNotes) => {
                if !NOTES_TYPES.contains(&hit.source_type.as_str()) {
                    return false;
                }
            }
            Some(other) => {
                if hit.source_type != other.as_str() {
                    return false;
                }
            }
            None => {}
        }
        true
    }

    async fn maybe_delay(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Store for MockStore {
    async fn search_exact(
        &self,
        _user: &str,
        pattern: &str,
        filters: &SearchFilters,
        _limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        self.maybe_delay().await;
        let needle = normalize_match_text(pattern);
        Ok(self
            .corpus
            .iter()
            .filter(|hit| Self::matches_filters(hit, filters))
            .filter(|hit| {
                hit.normalized_text
                    .as_deref()
                    .is_some_and(|n| n.contains(&needle))
            })
            .cloned()
            .collect())
    }

    async fn search_exact_tokens(
        &self,
        _user: &str,
        tokens: &[String],
        filters: &SearchFilters,
        _limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        self.maybe_delay().await;
        Ok(self
            .corpus
            .iter()
            .filter(|hit| Self::matches_filters(hit, filters))
            .filter(|hit| {
                hit.normalized_text
                    .as_deref()
                    .is_some_and(|n| tokens.iter().all(|t| n.contains(t.as_str())))
            })
            .cloned()
            .collect())
    }

    async fn search_lemma(
        &self,
        _user: &str,
        lemmas: &[String],
        filters: &SearchFilters,
        _limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        self.maybe_delay().await;
        Ok(self
            .corpus
            .iter()
            .filter(|hit| Self::matches_filters(hit, filters))
            .filter(|hit| {
                hit.normalized_text
                    .as_deref()
                    .is_some_and(|n| lemmas.iter().any(|l| n.contains(l.as_str())))
            })
            .cloned()
            .collect())
    }

    async fn search_vector(
        &self,
        _user: &str,
        _query_vec: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        self.maybe_delay().await;
        // Deterministic stand-in: every eligible chunk at a fixed distance.
        Ok(self
            .corpus
            .iter()
            .filter(|hit| Self::matches_filters(hit, filters))
            .take(limit)
            .map(|hit| {
                let mut hit = hit.clone();
                hit.score = 0.25;
                hit
            })
            .collect())
    }

    async fn graph_neighbors(
        &self,
        _user: &str,
        _seeds: &[i64],
        _min_strength: f64,
        _limit: usize,
        _offset: usize,
    ) -> DbResult<Vec<GraphHit>> {
        Ok(Vec::new())
    }

    async fn concepts_by_text(&self, _needle: &str, _limit: usize) -> DbResult<Vec<i64>> {
        Ok(Vec::new())
    }

    async fn concepts_by_names(&self, _names: &[String]) -> DbResult<Vec<i64>> {
        Ok(Vec::new())
    }

    async fn concepts_by_vector(&self, _query_vec: &[f32], _limit: usize) -> DbResult<Vec<i64>> {
        Ok(Vec::new())
    }

    async fn concept_links_for_chunks(&self, _chunk_ids: &[i64]) -> DbResult<Vec<(i64, String, i64)>> {
        Ok(Vec::new())
    }

    async fn concept_bridges(
        &self,
        _concept_ids: &[i64],
        _limit: usize,
    ) -> DbResult<Vec<(String, String, String)>> {
        Ok(Vec::new())
    }

    async fn external_edges(&self, _user: &str, _item_id: &str, _limit: usize) -> DbResult<Vec<ExternalEdge>> {
        Ok(Vec::new())
    }

    async fn external_meta(&self, _user: &str, _item_id: &str) -> DbResult<ExternalMeta> {
        Ok(ExternalMeta::default())
    }

    async fn book_title_catalog(&self, _user: &str) -> DbResult<Vec<BookRef>> {
        Ok(self.catalog.clone())
    }

    async fn user_book_ids(&self, _user: &str) -> DbResult<HashSet<String>> {
        Ok(self.user_books.clone())
    }

    async fn odl_shadow_candidates(
        &self,
        _user: &str,
        _filters: &SearchFilters,
        _limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        Ok(Vec::new())
    }

    async fn count_term_occurrences(
        &self,
        _user: &str,
        _book_id: &str,
        _candidates: &[String],
    ) -> DbResult<usize> {
        Ok(self.term_count)
    }

    async fn keyword_contexts(
        &self,
        _user: &str,
        _book_id: &str,
        _candidates: &[String],
        _limit: usize,
    ) -> DbResult<Vec<KwicContext>> {
        Ok(vec![KwicContext {
            page_number: Some(12),
            snippet: "…vicdan kavramı burada geçiyor…".to_string(),
        }])
    }

    async fn log_search(&self, _entry: &SearchLogEntry) -> DbResult<Option<i64>> {
        Ok(Some(7))
    }

    async fn append_log_diagnostics(&self, _log_id: i64, _diagnostics: &Value) -> DbResult<()> {
        Ok(())
    }

    async fn update_log_model(&self, _log_id: i64, _model_name: &str) -> DbResult<()> {
        Ok(())
    }
}

pub struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, inputs: &[String], _task_type: &str, dim: usize) -> SearchResult<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|_| vec![0.1; dim]).collect())
    }
}

/// Provider that records prompts and serves scripted responses.
pub struct RecordingProvider {
    name: &'static str,
    responses: Mutex<Vec<Result<String, u16>>>,
    pub prompts: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl RecordingProvider {
    pub fn new(name: &'static str, responses: Vec<Result<String, u16>>) -> Self {
        Self {
            name,
            responses: Mutex::new(responses),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl LlmProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn generate_text(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().expect("prompts lock").push(request.prompt.clone());
        let mut responses = self.responses.lock().expect("responses lock");
        let scripted = if responses.is_empty() {
            Ok(rich_answer())
        } else {
            responses.remove(0)
        };
        match scripted {
            Ok(text) => Ok(ProviderResponse { text, usage: None }),
            Err(status) => Err(ProviderError::Api {
                status,
                message: "scripted failure".to_string(),
            }),
        }
    }
}

/// A canned answer that satisfies the richness checks.
pub fn rich_answer() -> String {
    format!(
        "## Doğrudan Tanımlar\n{}\n\n## Bağlamsal Analiz\n{}\n\n## Sonuç\n{}",
        "Vicdan, insanın içindeki ahlaki yargı gücüdür. ".repeat(8),
        "Bağlamsal açıdan incelendiğinde bu kavram toplumsal hayatın her alanına dokunur. ".repeat(8),
        "Kısa bir özet paragrafı."
    )
}

/// Fully wired assembler over the mock store.
pub fn build_assembler(settings: Settings, store: Arc<MockStore>) -> Arc<ContextAssembler> {
    let settings = Arc::new(settings);
    let cache = Arc::new(MultiLayerCache::new(Duration::from_secs(settings.cache_l1_ttl_secs)));
    let expander = Arc::new(QueryExpander::new(
        Arc::new(NoopVariationGenerator),
        cache.clone(),
        "v1",
    ));
    let embedder = Arc::new(FixedEmbedder);
    let semantic = Arc::new(SemanticStrategy::new(
        store.clone(),
        embedder.clone(),
        settings.embedding_dim,
    ));
    let orchestrator = Arc::new(SearchOrchestrator::new(
        settings.clone(),
        store.clone(),
        cache.clone(),
        expander,
        Arc::new(NoopSpellChecker),
        Some(semantic),
    ));
    let graph = Arc::new(GraphTraverseStrategy::new(
        store.clone(),
        embedder,
        Arc::new(NoopConceptExtractor),
        cache.clone(),
        settings.concept_strength_min,
        settings.embedding_dim,
    ));
    let external_kb = Arc::new(ExternalKbStrategy::new(store.clone(), &settings));

    Arc::new(ContextAssembler::new(
        settings,
        store,
        orchestrator,
        graph,
        external_kb,
        Arc::new(NoopQueryRewriter),
        Arc::new(FastPassageClassifier),
        Arc::new(KeywordCoverageClassifier),
        cache,
    ))
}

/// LLM router over recording providers.
pub fn build_router(
    settings: &Settings,
    gemini: Arc<RecordingProvider>,
    qwen: Arc<RecordingProvider>,
) -> Arc<LlmRouter> {
    Arc::new(LlmRouter::new(Arc::new(settings.clone()), gemini, qwen))
}
