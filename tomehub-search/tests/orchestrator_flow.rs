//! Orchestrator integration tests over a content-aware mock store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use tomehub_core::Settings;
use tomehub_core::text::{
    contains_lemma_stem_boundary, normalize_match_text,
};
use tomehub_db::error::DbResult;
use tomehub_db::models::{
    BookRef, ChunkHit, ExternalEdge, ExternalMeta, GraphHit, KwicContext, SearchFilters,
    SearchLogEntry,
};
use tomehub_db::store::Store;
use tomehub_search::cache::MultiLayerCache;
use tomehub_search::embeddings::Embedder;
use tomehub_search::errors::SearchResult;
use tomehub_search::expander::{NoopVariationGenerator, QueryExpander, VariationGenerator};
use tomehub_search::orchestrator::SearchOrchestrator;
use tomehub_search::spell::{LexiconSpellChecker, NoopSpellChecker, SpellChecker};
use tomehub_search::strategies::SemanticStrategy;
use tomehub_search::types::{Intent, MixPolicy, SearchRequest};

fn chunk(id: &str, title: &str, source_type: &str, text: &str, distance: f64) -> ChunkHit {
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
        book_id: Some("b1".to_string()),
        normalized_text: Some(normalize_match_text(text)),
        score: distance,
        match_type: String::new(),
    }
}

/// Mock store that filters a canned corpus the way the SQL queries would.
#[derive(Default)]
struct MockStore {
    corpus: Vec<ChunkHit>,
    vector_hits: Vec<ChunkHit>,
}

#[async_trait]
impl Store for MockStore {
    async fn search_exact(
        &self,
        _user: &str,
        pattern: &str,
        _filters: &SearchFilters,
        _limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        let needle = normalize_match_text(pattern);
        Ok(self
            .corpus
            .iter()
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
        _filters: &SearchFilters,
        _limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        Ok(self
            .corpus
            .iter()
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
        _filters: &SearchFilters,
        _limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        // The SQL layer fetches by lemma-token containment; stem-boundary
        // verification happens in the strategy. Simulate the loose fetch.
        Ok(self
            .corpus
            .iter()
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
        _filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        Ok(self.vector_hits.iter().take(limit).cloned().collect())
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
        Ok(Vec::new())
    }

    async fn user_book_ids(&self, _user: &str) -> DbResult<HashSet<String>> {
        Ok(HashSet::new())
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
        Ok(0)
    }

    async fn keyword_contexts(
        &self,
        _user: &str,
        _book_id: &str,
        _candidates: &[String],
        _limit: usize,
    ) -> DbResult<Vec<KwicContext>> {
        Ok(Vec::new())
    }

    async fn log_search(&self, _entry: &SearchLogEntry) -> DbResult<Option<i64>> {
        Ok(Some(1))
    }

    async fn append_log_diagnostics(&self, _log_id: i64, _diagnostics: &Value) -> DbResult<()> {
        Ok(())
    }

    async fn update_log_model(&self, _log_id: i64, _model_name: &str) -> DbResult<()> {
        Ok(())
    }
}

struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, inputs: &[String], _task_type: &str, dim: usize) -> SearchResult<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|_| vec![0.1; dim]).collect())
    }
}

struct SlowGenerator;

#[async_trait]
impl VariationGenerator for SlowGenerator {
    async fn variations(&self, _query: &str, _max: usize) -> SearchResult<Vec<String>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec!["never arrives".to_string()])
    }
}

fn corpus() -> Vec<ChunkHit> {
    vec![
        chunk(
            "1",
            "Vicdan Üzerine",
            "PDF_CHUNK",
            "Vicdan nedir sorusu felsefenin en eski sorularından biridir ve ahlak ile iç içedir.",
            0.0,
        ),
        chunk(
            "2",
            "Vicdan Üzerine",
            "HIGHLIGHT",
            "Vicdan insanın iç sesidir; doğru ile yanlışı ayırt etmeye yarar ve sürekli çalışır.",
            0.0,
        ),
        chunk(
            "3",
            "Medeniyet Tarihi",
            "PDF_CHUNK",
            "Medeniyet tarihi boyunca şehirler ve kurumlar birlikte gelişmiştir; yazı bunun kaydıdır.",
            0.0,
        ),
    ]
}

fn build_orchestrator(
    settings: Settings,
    store: Arc<MockStore>,
    spell: Arc<dyn SpellChecker>,
    generator: Arc<dyn VariationGenerator>,
) -> SearchOrchestrator {
    let settings = Arc::new(settings);
    let cache = Arc::new(MultiLayerCache::new(Duration::from_secs(settings.cache_l1_ttl_secs)));
    let expander = Arc::new(QueryExpander::new(generator, cache.clone(), "v1"));
    let semantic = Arc::new(SemanticStrategy::new(
        store.clone(),
        Arc::new(FixedEmbedder),
        settings.embedding_dim,
    ));
    SearchOrchestrator::new(settings, store, cache, expander, spell, Some(semantic))
}

#[tokio::test]
async fn concat_fusion_orders_exact_before_semantic() {
    let store = Arc::new(MockStore {
        corpus: corpus(),
        vector_hits: vec![chunk(
            "9",
            "Ahlak Felsefesi",
            "PDF_CHUNK",
            "Ahlaki yargılar toplumdan topluma değişebilir ancak bazı ilkeler ortaktır ve süreklidir.",
            0.2,
        )],
    });
    let orchestrator = build_orchestrator(
        Settings::default(),
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(NoopVariationGenerator),
    );

    let mut request = SearchRequest::new("vicdan", "u1");
    request.intent = Intent::Synthesis;
    let outcome = orchestrator.search(&request).await.unwrap();

    assert!(outcome.results.len() >= 3);
    // Exact hits (score 100) come before the semantic tail.
    let semantic_pos = outcome
        .results
        .iter()
        .position(|h| h.match_type == "semantic")
        .unwrap();
    for hit in &outcome.results[..semantic_pos] {
        assert_ne!(hit.match_type, "semantic");
    }
    // HIGHLIGHT sorts before plain PDF chunks inside the exact bucket.
    assert_eq!(outcome.results[0].source_type, "HIGHLIGHT");
    assert_eq!(outcome.metadata.router_reason, "short_query");
}

#[tokio::test]
async fn pagination_keeps_full_total_count() {
    let store = Arc::new(MockStore { corpus: corpus(), vector_hits: Vec::new() });
    let orchestrator = build_orchestrator(
        Settings::default(),
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(NoopVariationGenerator),
    );

    let mut request = SearchRequest::new("vicdan", "u1");
    request.limit = 1;
    request.offset = 0;
    let outcome = orchestrator.search(&request).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert!(outcome.total_count >= 2);
    assert_eq!(outcome.metadata.total_count, outcome.total_count);
}

#[tokio::test]
async fn router_disabled_selects_all_buckets() {
    let settings = Settings {
        search_mode_routing_enabled: false,
        ..Settings::default()
    };
    let store = Arc::new(MockStore { corpus: corpus(), vector_hits: Vec::new() });
    let orchestrator = build_orchestrator(
        settings,
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(NoopVariationGenerator),
    );

    let mut request = SearchRequest::new("hangi sayfa vicdan", "u1");
    request.intent = Intent::Direct;
    let outcome = orchestrator.search(&request).await.unwrap();
    assert_eq!(outcome.metadata.selected_buckets, vec!["exact", "lemma", "semantic"]);
    assert_eq!(outcome.metadata.router_reason, "mode_routing_disabled");
}

#[tokio::test]
async fn inner_word_match_falls_back_to_semantic_safety_net() {
    // Corpus contains `medeniyet` but never `niyet`; DIRECT intent routes
    // lexical-only, stem boundaries reject everything, the safety net runs.
    let store = Arc::new(MockStore {
        corpus: vec![corpus().remove(2)],
        vector_hits: vec![chunk(
            "3",
            "Medeniyet Tarihi",
            "PDF_CHUNK",
            "Medeniyet tarihi boyunca şehirler ve kurumlar birlikte gelişmiştir; yazı bunun kaydıdır.",
            0.3,
        )],
    });
    let orchestrator = build_orchestrator(
        Settings::default(),
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(NoopVariationGenerator),
    );

    let mut request = SearchRequest::new("niyet", "u1");
    request.intent = Intent::Direct;
    let outcome = orchestrator.search(&request).await.unwrap();

    assert_eq!(outcome.metadata.retrieval_steps.initial_lexical_raw_count, 0);
    assert!(outcome
        .metadata
        .executed_strategies
        .iter()
        .any(|s| s == "SemanticMatchStrategy_SafetyFallback"));
    assert!(outcome.metadata.router_reason.ends_with("+semantic_fallback_no_lexical_hits"));
    assert!(!outcome.results.is_empty());
    assert!(outcome.metadata.selected_buckets.iter().any(|b| b == "semantic"));
}

#[tokio::test]
async fn typo_rescue_reruns_lexical_with_corrected_query() {
    let store = Arc::new(MockStore { corpus: corpus(), vector_hits: Vec::new() });
    let spell = Arc::new(LexiconSpellChecker::new(vec![
        "vicdan".to_string(),
        "nedir".to_string(),
        "medeniyet".to_string(),
    ]));
    let orchestrator = build_orchestrator(
        Settings::default(),
        store,
        spell,
        Arc::new(NoopVariationGenerator),
    );

    let mut request = SearchRequest::new("vicdun nedir", "u1");
    request.intent = Intent::Direct;
    let outcome = orchestrator.search(&request).await.unwrap();

    assert!(outcome.metadata.query_correction_applied);
    assert!(outcome.metadata.typo_rescue_applied);
    assert_eq!(outcome.metadata.query_corrected, "vicdan nedir");
    assert!(outcome.metadata.retrieval_steps.typo_rescue_added_exact > 0);
    assert!(!outcome.results.is_empty());
}

#[tokio::test]
async fn expansion_timeout_sets_reason_and_returns_lexical_hits() {
    let settings = Settings {
        l3_perf_expansion_tail_fix_enabled: true,
        ..Settings::default()
    };
    let store = Arc::new(MockStore { corpus: corpus(), vector_hits: Vec::new() });
    let orchestrator = build_orchestrator(
        settings,
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(SlowGenerator),
    );

    let request = SearchRequest::new("vicdan", "u1");
    let outcome = orchestrator.search(&request).await.unwrap();

    assert_eq!(outcome.metadata.expansion_skipped_reason.as_deref(), Some("expansion_timeout"));
    assert!(!outcome.results.is_empty());
}

#[tokio::test]
async fn mix_policy_applies_noise_guard_and_tail_cap() {
    let mut vector_hits = vec![chunk(
        "short",
        "Kısa",
        "PDF_CHUNK",
        "çok kısa metin",
        0.05,
    )];
    for i in 0..10 {
        vector_hits.push(chunk(
            &format!("sem{i}"),
            "Ahlak Felsefesi",
            "PDF_CHUNK",
            &format!(
                "Ahlaki ilkeler üzerine uzun ve anlam yüklü bir pasaj numara {i}; bağlam yeterince zengin ve açıklayıcıdır."
            ),
            0.1 + (i as f64) * 0.01,
        ));
    }
    let store = Arc::new(MockStore { corpus: corpus(), vector_hits });
    let orchestrator = build_orchestrator(
        Settings::default(),
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(NoopVariationGenerator),
    );

    let mut request = SearchRequest::new("vicdan", "u1");
    request.result_mix_policy = Some(MixPolicy::LexicalThenSemanticTail);
    request.semantic_tail_cap = Some(6);
    let outcome = orchestrator.search(&request).await.unwrap();

    // Single-token query: the dynamic cap applies (lexical total < 10 -> 5).
    assert_eq!(outcome.metadata.semantic_tail_policy, "dynamic_single_token");
    assert_eq!(outcome.metadata.semantic_tail_cap, Some(5));
    assert!(outcome.metadata.semantic_tail_added.unwrap() <= 5);
    // The sub-60-char chunk never makes the tail.
    assert!(outcome.results.iter().all(|h| h.id != "short"));
    // Lexical hits precede every semantic-tail hit.
    let first_semantic = outcome.results.iter().position(|h| h.match_type == "semantic");
    if let Some(pos) = first_semantic {
        assert!(outcome.results[..pos].iter().all(|h| h.match_type != "semantic"));
    }
}

#[tokio::test]
async fn cache_roundtrip_returns_identical_payload() {
    let store = Arc::new(MockStore { corpus: corpus(), vector_hits: Vec::new() });
    let orchestrator = build_orchestrator(
        Settings::default(),
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(NoopVariationGenerator),
    );

    let request = SearchRequest::new("vicdan", "u1");
    let first = orchestrator.search(&request).await.unwrap();
    assert!(!first.metadata.cached);

    let second = orchestrator.search(&request).await.unwrap();
    assert!(second.metadata.cached);
    assert_eq!(second.metadata.cache_layer, "L1");
    assert_eq!(first.total_count, second.total_count);
    let ids_first: Vec<&str> = first.results.iter().map(|h| h.id.as_str()).collect();
    let ids_second: Vec<&str> = second.results.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids_first, ids_second);
}

#[tokio::test]
async fn lemma_bucket_rejects_inner_word_matches() {
    // Invariant 3: hits returned by the lemma bucket sit on a stem boundary.
    let store = Arc::new(MockStore { corpus: corpus(), vector_hits: Vec::new() });
    let orchestrator = build_orchestrator(
        Settings::default(),
        store,
        Arc::new(NoopSpellChecker),
        Arc::new(NoopVariationGenerator),
    );

    let mut request = SearchRequest::new("niyet konusu", "u1");
    request.intent = Intent::Direct;
    let outcome = orchestrator.search(&request).await.unwrap();
    for hit in &outcome.results {
        if hit.match_type == "lemma_fuzzy" {
            assert!(contains_lemma_stem_boundary(
                hit.normalized_text.as_deref().unwrap_or(&hit.text),
                "niyet"
            ));
        }
    }
}
