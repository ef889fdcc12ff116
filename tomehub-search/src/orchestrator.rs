//! Coordinator for the search decision system.
//!
//! Owns the full retrieval flow: cache probe, router decision, parallel
//! strategy dispatch with query expansion, typo rescue, lemma-seed fallback,
//! the semantic safety net, fusion, the optional semantic-tail mix policy,
//! pagination, and best-effort analytics.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tomehub_core::text::{deaccent, filter_query_lemmas, get_lemmas, token_count};
use tomehub_core::{FusionMode, RetrievalMode, RouterMode, Settings};
use tomehub_db::Store;
use tomehub_db::models::{ChunkHit, SearchLogEntry};

use crate::cache::{MultiLayerCache, generate_cache_key};
use crate::errors::SearchResult;
use crate::expander::QueryExpander;
use crate::fusion::{concat_buckets, rrf_fuse_buckets, sort_bucket};
use crate::router::{SemanticRouter, StrategyFlags, to_strategy_flags};
use crate::spell::SpellChecker;
use crate::strategies::{
    ExactStrategy, LemmaStrategy, OdlShadowRescueStrategy, SemanticStrategy, Strategy,
};
use crate::types::{BucketCounts, Intent, MixPolicy, SearchMetadata, SearchOutcome, SearchRequest};

const SEMANTIC_MIX_POLICY_VERSION: &str = "v4";
const MAX_PARALLEL_WORKERS: usize = 6;

const NOISE_SOURCE_ALLOWLIST: &[&str] = &[
    "PDF", "EPUB", "PDF_CHUNK", "BOOK", "HIGHLIGHT", "INSIGHT", "NOTES", "PERSONAL_NOTE",
    "ARTICLE", "WEBSITE", "GRAPH_RELATION",
];

pub struct SearchOrchestrator {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    cache: Arc<MultiLayerCache>,
    router: SemanticRouter,
    expander: Arc<QueryExpander>,
    spell_checker: Arc<dyn SpellChecker>,
    exact: Arc<ExactStrategy>,
    lemma: Arc<LemmaStrategy>,
    semantic: Option<Arc<SemanticStrategy>>,
    odl_rescue: Option<Arc<OdlShadowRescueStrategy>>,
    worker_slots: Arc<Semaphore>,
}

impl SearchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        cache: Arc<MultiLayerCache>,
        expander: Arc<QueryExpander>,
        spell_checker: Arc<dyn SpellChecker>,
        semantic: Option<Arc<SemanticStrategy>>,
    ) -> Self {
        let exact = Arc::new(ExactStrategy::new(
            store.clone(),
            settings.search_exact_min_rows,
            settings.search_exact_single_token_enabled,
        ));
        let lemma = Arc::new(LemmaStrategy::new(store.clone()));
        let odl_rescue = settings
            .odl_rescue_enabled
            .then(|| Arc::new(OdlShadowRescueStrategy::new(store.clone())));
        Self {
            settings,
            store,
            cache,
            router: SemanticRouter::new(),
            expander,
            spell_checker,
            exact,
            lemma,
            semantic,
            odl_rescue,
            worker_slots: Arc::new(Semaphore::new(MAX_PARALLEL_WORKERS)),
        }
    }

    fn dynamic_single_token_semantic_cap(lexical_total: usize) -> usize {
        if lexical_total > 30 {
            2
        } else if lexical_total >= 20 {
            3
        } else if lexical_total >= 10 {
            4
        } else {
            5
        }
    }

    fn cache_key_for(&self, request: &SearchRequest, retrieval_mode: RetrievalMode) -> String {
        let s = &self.settings;
        let mut key = generate_cache_key(
            "search",
            &request.query,
            &request.user_id,
            request.filters.book_id.as_deref(),
            request.limit,
            &s.embedding_model_version,
        );
        key.push_str(&format!(
            "_int:{}_off:{}_router:{}",
            request.intent.as_str(),
            request.offset,
            s.search_router_mode.as_str()
        ));
        key.push_str(&format!(
            "_mix:{}_semcap:{}",
            request.result_mix_policy.map(|p| p.as_str()).unwrap_or("none"),
            request
                .semantic_tail_cap
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string())
        ));
        key.push_str(&format!("_mixver:{SEMANTIC_MIX_POLICY_VERSION}"));
        key.push_str(&format!(
            "_rmode:{}_noise:{}_modegate:{}",
            retrieval_mode.as_str(),
            s.search_noise_guard_enabled as u8,
            s.search_mode_routing_enabled as u8
        ));
        key.push_str(&format!("_typo:{}", s.search_typo_rescue_enabled as u8));
        key.push_str(&format!("_lemseed:{}", s.search_lemma_seed_fallback_enabled as u8));
        key.push_str(&format!(
            "_dyntail:{}",
            s.search_dynamic_single_token_semantic_cap_enabled as u8
        ));
        key.push_str(&format!("_vis:{}", request.filters.visibility_scope.as_str()));
        key.push_str(&format!(
            "_ct:{}",
            request.filters.content_type.as_deref().unwrap_or("none")
        ));
        key.push_str(&format!(
            "_it:{}",
            request.filters.ingestion_type.as_deref().unwrap_or("none")
        ));
        key
    }

    fn is_semantic_candidate_eligible(&self, hit: &ChunkHit, noise_guard: bool) -> bool {
        if !noise_guard {
            return true;
        }
        let content = hit.text.trim();
        let content_lc = content.to_lowercase();
        let title_lc = hit.title.trim().to_lowercase();
        let source_type = hit.source_type.trim().to_uppercase();

        if !source_type.is_empty() && !NOISE_SOURCE_ALLOWLIST.contains(&source_type.as_str()) {
            return false;
        }
        if content.chars().count() < 60 {
            return false;
        }
        if content_lc.contains("website deneme") {
            return false;
        }
        if (source_type == "WEBSITE" || source_type == "ARTICLE") && content.chars().count() < 100 {
            return false;
        }
        if content_lc.starts_with("title:") && content.chars().count() < 220 {
            return false;
        }
        if content_lc.starts_with("author:") && content.chars().count() < 220 {
            return false;
        }
        if title_lc.contains("deneme") && content.chars().count() < 180 {
            return false;
        }
        if title_lc.contains("unknown") && content.chars().count() < 220 {
            return false;
        }
        true
    }

    pub async fn search(&self, request: &SearchRequest) -> SearchResult<SearchOutcome> {
        let start = Instant::now();
        let s = self.settings.clone();
        let query_original = request.query.clone();
        let mut query_corrected = query_original.clone();
        let mut query_correction_applied = false;
        let mut typo_rescue_applied = false;
        let mut lemma_seed_fallback_applied = false;
        let mut semantic_tail_policy = "default".to_string();
        let mut expansion_skipped_reason: Option<String> = None;
        let mut strategy_timing_ms: BTreeMap<String, u64> = BTreeMap::new();

        info!(
            query = %request.query,
            user = %request.user_id,
            intent = request.intent.as_str(),
            "search started"
        );

        // Fetch a large pool so fusion stays stable on later pages.
        let internal_pool_limit: usize =
            if matches!(request.intent, Intent::Direct | Intent::CitationSeeking) { 700 } else { 320 };
        let default_semantic_tail_cap = s.search_smart_semantic_tail_cap.max(1);
        let tail_cap_for_fetch = request
            .semantic_tail_cap
            .filter(|c| *c > 0)
            .unwrap_or(default_semantic_tail_cap);
        let semantic_fetch_limit = if request.result_mix_policy == Some(MixPolicy::LexicalThenSemanticTail) {
            // Compact semantic pool for lower latency while preserving tail quality.
            (tail_cap_for_fetch * 6).clamp(24, 72)
        } else {
            20
        };

        // ── Router ───────────────────────────────────────────────────
        let (mut selected_buckets, mut router_reason, retrieval_mode) = if s.search_mode_routing_enabled {
            if s.search_router_mode == RouterMode::RuleBased {
                let decision = self.router.route(&request.query, request.intent, s.search_default_mode);
                (decision.selected_buckets, decision.reason, decision.retrieval_mode)
            } else {
                let mode = s.search_default_mode;
                (
                    SemanticRouter::buckets_for_mode(mode),
                    format!("static_mode:{}", mode.as_str()),
                    mode,
                )
            }
        } else {
            // Hard rollback switch: legacy behavior with all buckets active.
            (
                SemanticRouter::buckets_for_mode(RetrievalMode::Balanced),
                "mode_routing_disabled".to_string(),
                RetrievalMode::Balanced,
            )
        };
        let route_flags = to_strategy_flags(&selected_buckets);

        // ── Cache probe ──────────────────────────────────────────────
        let cache_key = self.cache_key_for(request, retrieval_mode);
        if let Some((cached, layer)) = self.cache.get(&cache_key).await {
            if let Ok(mut outcome) = serde_json::from_value::<SearchOutcome>(cached) {
                info!(query = %request.query, layer, "search cache hit");
                outcome.metadata.cached = true;
                outcome.metadata.cache_layer = layer.to_string();
                outcome.metadata.search_log_id = None;
                return Ok(outcome);
            }
        }

        // ── Parallel strategy dispatch + expansion ───────────────────
        let mut bucket_exact: Vec<ChunkHit> = Vec::new();
        let mut bucket_lemma: Vec<ChunkHit> = Vec::new();
        let mut bucket_semantic: Vec<ChunkHit> = Vec::new();
        let mut executed_strategies: Vec<String> = Vec::new();
        let mut odl_hits: Vec<ChunkHit> = Vec::new();

        let expansion_variation_limit = s.search_semantic_expansion_max_variations.min(3);
        let expansion_handle = if expansion_variation_limit > 0 {
            let expander = self.expander.clone();
            let query = request.query.clone();
            Some(tokio::spawn(async move {
                expander.expand(&query, expansion_variation_limit).await
            }))
        } else {
            expansion_skipped_reason = Some("expansion_disabled".to_string());
            None
        };

        let mut join_set: JoinSet<(&'static str, SearchResult<Vec<ChunkHit>>, u64)> = JoinSet::new();
        let mut spawn_strategy = |strategy: Arc<dyn Strategy>,
                                  label: &'static str,
                                  limit: usize,
                                  join_set: &mut JoinSet<(&'static str, SearchResult<Vec<ChunkHit>>, u64)>| {
            let slots = self.worker_slots.clone();
            let query = request.query.clone();
            let user = request.user_id.clone();
            let filters = request.filters.clone();
            let intent = request.intent;
            join_set.spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                let started = Instant::now();
                let result = strategy.search(&query, &user, limit, 0, intent, &filters).await;
                (label, result, started.elapsed().as_millis() as u64)
            });
        };

        if route_flags.run_exact {
            executed_strategies.push(self.exact.name().to_string());
            spawn_strategy(self.exact.clone(), "ExactMatchStrategy", internal_pool_limit, &mut join_set);
        }
        if route_flags.run_lemma {
            executed_strategies.push(self.lemma.name().to_string());
            spawn_strategy(self.lemma.clone(), "LemmaMatchStrategy", internal_pool_limit, &mut join_set);
        }
        if let Some(semantic) = &self.semantic {
            if route_flags.run_semantic {
                executed_strategies.push(semantic.name().to_string());
                spawn_strategy(semantic.clone(), "SemanticMatchStrategy", semantic_fetch_limit, &mut join_set);
            }
        }
        if let Some(odl) = &self.odl_rescue {
            spawn_strategy(odl.clone(), "OdlShadowRescueStrategy", 8, &mut join_set);
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((label, Ok(hits), elapsed_ms)) => {
                    strategy_timing_ms.insert(label.to_string(), elapsed_ms);
                    if hits.is_empty() {
                        continue;
                    }
                    debug!(strategy = label, count = hits.len(), "strategy returned hits");
                    match label {
                        "ExactMatchStrategy" => bucket_exact.extend(hits),
                        "LemmaMatchStrategy" => bucket_lemma.extend(hits),
                        "SemanticMatchStrategy" => bucket_semantic.extend(hits),
                        "OdlShadowRescueStrategy" => odl_hits.extend(hits),
                        _ => {}
                    }
                }
                Ok((label, Err(err), elapsed_ms)) => {
                    strategy_timing_ms.insert(label.to_string(), elapsed_ms);
                    error!(strategy = label, error = %err, "strategy failed");
                }
                Err(join_err) => error!(error = %join_err, "strategy task panicked"),
            }
        }

        // ── Expansion results ────────────────────────────────────────
        let mut variations: Vec<String> = Vec::new();
        if let Some(handle) = expansion_handle {
            let expansion_timeout = if s.l3_perf_expansion_tail_fix_enabled {
                Duration::from_secs(2)
            } else {
                Duration::from_secs(6)
            };
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(expansion_timeout, handle).await {
                Ok(Ok(Ok(vars))) => variations = vars,
                Ok(Ok(Err(err))) => {
                    warn!(error = %err, "query expansion failed");
                    expansion_skipped_reason = Some("expansion_error".to_string());
                }
                Ok(Err(join_err)) => {
                    warn!(error = %join_err, "query expansion task failed");
                    expansion_skipped_reason = Some("expansion_error".to_string());
                }
                Err(_) => {
                    abort_handle.abort();
                    expansion_skipped_reason = Some("expansion_timeout".to_string());
                }
            }
        }

        // ── Semantic passes for variations ───────────────────────────
        let mut semantic_variation_hits = 0usize;
        let variation_count = variations.len();
        if let Some(semantic) = &self.semantic {
            if route_flags.run_semantic && !variations.is_empty() {
                let variation_fetch_limit = (semantic_fetch_limit / 2).max(12);
                let mut var_set: JoinSet<(SearchResult<Vec<ChunkHit>>, u64)> = JoinSet::new();
                for variation in &variations {
                    let semantic = semantic.clone();
                    let slots = self.worker_slots.clone();
                    let query = variation.clone();
                    let user = request.user_id.clone();
                    let filters = request.filters.clone();
                    let intent = request.intent;
                    var_set.spawn(async move {
                        let _permit = slots.acquire_owned().await.ok();
                        let started = Instant::now();
                        let result = semantic
                            .search(&query, &user, variation_fetch_limit, 0, intent, &filters)
                            .await;
                        (result, started.elapsed().as_millis() as u64)
                    });
                }
                while let Some(joined) = var_set.join_next().await {
                    if let Ok((Ok(hits), elapsed_ms)) = joined {
                        *strategy_timing_ms
                            .entry("SemanticMatchStrategy_Var".to_string())
                            .or_insert(0) += elapsed_ms;
                        semantic_variation_hits += hits.len();
                        bucket_semantic.extend(hits);
                    }
                }
            }
        }

        let initial_exact_raw_count = bucket_exact.len();
        let initial_lemma_raw_count = bucket_lemma.len();
        let initial_lexical_raw_count = initial_exact_raw_count + initial_lemma_raw_count;
        let mut typo_rescue_added_exact = 0usize;
        let mut typo_rescue_added_lemma = 0usize;
        let mut lemma_seed_added = 0usize;

        // ── Typo rescue ──────────────────────────────────────────────
        if s.search_typo_rescue_enabled
            && initial_lexical_raw_count <= 2
            && (route_flags.run_exact || route_flags.run_lemma)
        {
            if let Some(corrected) = self
                .spell_checker
                .correct(&query_original)
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty() && *c != query_original)
            {
                query_corrected = corrected;
                query_correction_applied = true;
                typo_rescue_applied = true;
                let rescue_limit = internal_pool_limit.min(160);

                if route_flags.run_exact {
                    match self
                        .exact
                        .search(&query_corrected, &request.user_id, rescue_limit, 0, request.intent, &request.filters)
                        .await
                    {
                        Ok(rescued) => {
                            typo_rescue_added_exact = rescued.len();
                            bucket_exact.extend(rescued);
                        }
                        Err(err) => error!(error = %err, "typo rescue exact pass failed"),
                    }
                }
                if route_flags.run_lemma {
                    match self
                        .lemma
                        .search(&query_corrected, &request.user_id, rescue_limit, 0, request.intent, &request.filters)
                        .await
                    {
                        Ok(rescued) => {
                            typo_rescue_added_lemma = rescued.len();
                            bucket_lemma.extend(rescued);
                        }
                        Err(err) => error!(error = %err, "typo rescue lemma pass failed"),
                    }
                }
            }
        }

        // ── Lemma-seed fallback ──────────────────────────────────────
        if s.search_lemma_seed_fallback_enabled && route_flags.run_exact && bucket_lemma.is_empty() {
            let source_query = if query_correction_applied { &query_corrected } else { &query_original };
            let raw_lemmas = filter_query_lemmas(&get_lemmas(source_query));
            let mut seed_lemmas: Vec<String> = Vec::new();
            let mut seen_norm = HashSet::new();
            for lemma in raw_lemmas {
                let norm = deaccent(lemma.trim());
                if norm.len() < 3 || !seen_norm.insert(norm) {
                    continue;
                }
                seed_lemmas.push(lemma.trim().to_string());
                if seed_lemmas.len() >= 2 {
                    break;
                }
            }

            if !seed_lemmas.is_empty() {
                lemma_seed_fallback_applied = true;
                let seed_limit = (request.limit * 4).clamp(40, 120);
                for seed in seed_lemmas {
                    match self
                        .exact
                        .search(&seed, &request.user_id, seed_limit, 0, request.intent, &request.filters)
                        .await
                    {
                        Ok(seed_hits) => {
                            lemma_seed_added += seed_hits.len();
                            for mut hit in seed_hits {
                                hit.match_type = "exact_lemma_seed".to_string();
                                bucket_exact.push(hit);
                            }
                        }
                        Err(err) => error!(error = %err, seed = %seed, "lemma-seed fallback failed"),
                    }
                }
            }
        }

        // ── Semantic safety net ──────────────────────────────────────
        // Prevents false "no content" failures for conceptual questions that
        // were misrouted as DIRECT.
        if bucket_exact.is_empty()
            && bucket_lemma.is_empty()
            && bucket_semantic.is_empty()
            && !route_flags.run_semantic
        {
            if let Some(semantic) = &self.semantic {
                warn!(
                    query = %request.query,
                    reason = %router_reason,
                    "router produced zero lexical hits; enabling semantic safety fallback"
                );
                let fallback_limit = internal_pool_limit.clamp(20, 100);
                match semantic
                    .search(&request.query, &request.user_id, fallback_limit, 0, request.intent, &request.filters)
                    .await
                {
                    Ok(fallback_hits) if !fallback_hits.is_empty() => {
                        bucket_semantic.extend(fallback_hits);
                        executed_strategies.push("SemanticMatchStrategy_SafetyFallback".to_string());
                        if !selected_buckets.iter().any(|b| b == "semantic") {
                            selected_buckets.push("semantic".to_string());
                        }
                        router_reason = format!("{router_reason}+semantic_fallback_no_lexical_hits");
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "semantic safety fallback failed"),
                }
            }
        }

        let bucket_raw_counts = BucketCounts {
            initial_exact_raw_count,
            initial_lemma_raw_count,
            initial_lexical_raw_count,
            exact_raw_count: bucket_exact.len(),
            lemma_raw_count: bucket_lemma.len(),
            semantic_raw_count: bucket_semantic.len(),
            semantic_variation_query_count: variation_count,
            semantic_variation_hit_count: semantic_variation_hits,
            typo_rescue_added_exact,
            typo_rescue_added_lemma,
            lemma_seed_added_exact: lemma_seed_added,
            odl_rescue_added: odl_hits.len(),
        };

        // ── Fusion ───────────────────────────────────────────────────
        let fusion_mode = s.retrieval_fusion_mode;
        let mut final_list = match fusion_mode {
            FusionMode::Rrf => {
                rrf_fuse_buckets(bucket_exact, bucket_lemma, bucket_semantic, request.intent)
            }
            FusionMode::Concat => {
                sort_bucket(&mut bucket_exact);
                sort_bucket(&mut bucket_lemma);
                sort_bucket(&mut bucket_semantic);
                concat_buckets(vec![
                    (bucket_exact, "content_exact"),
                    (bucket_lemma, "content_fuzzy"),
                    (bucket_semantic, "semantic"),
                ])
            }
        };

        // ODL rescue is strictly additive: merged after fusion, never
        // replacing an existing candidate.
        let odl_rescue_applied = !odl_hits.is_empty();
        let mut odl_rescue_added = 0usize;
        if odl_rescue_applied {
            let existing: HashSet<String> = final_list.iter().map(|h| h.item_key()).collect();
            for hit in odl_hits {
                if !existing.contains(&hit.item_key()) {
                    final_list.push(hit);
                    odl_rescue_added += 1;
                }
            }
        }

        // ── Mix policy ───────────────────────────────────────────────
        let noise_guard_applied = s.search_noise_guard_enabled;
        let mut lexical_total: Option<usize> = None;
        let mut semantic_total_raw: Option<usize> = None;
        let mut semantic_tail_added: Option<usize> = None;
        let mut semantic_tail_cap_value: Option<usize> = None;
        let mut mix_policy_applied: Option<String> = None;

        if request.result_mix_policy == Some(MixPolicy::LexicalThenSemanticTail) {
            let mut cap = request
                .semantic_tail_cap
                .filter(|c| *c > 0)
                .unwrap_or(default_semantic_tail_cap);

            let mut lexical_list: Vec<ChunkHit> = Vec::new();
            let mut semantic_list_raw: Vec<ChunkHit> = Vec::new();
            let mut seen_keys = HashSet::new();
            for hit in final_list {
                if !seen_keys.insert(hit.item_key()) {
                    continue;
                }
                if hit.match_type.to_lowercase().contains("semantic") {
                    semantic_list_raw.push(hit);
                } else {
                    lexical_list.push(hit);
                }
            }

            let lexical_source_types: HashSet<String> = lexical_list
                .iter()
                .filter(|h| !h.source_type.is_empty())
                .map(|h| h.source_type.to_uppercase())
                .collect();

            let mut semantic_list: Vec<ChunkHit> = semantic_list_raw
                .iter()
                .filter(|hit| self.is_semantic_candidate_eligible(hit, noise_guard_applied))
                .cloned()
                .collect();
            semantic_list.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

            // Adaptive confidence floor keeps low-score noise out while still
            // allowing a tail for low-score corpora.
            let mut semantic_scored: Vec<ChunkHit> = semantic_list.clone();
            if noise_guard_applied {
                if let Some(top) = semantic_list.first().map(|h| h.score).filter(|s| *s > 0.0) {
                    let floor = (top * 0.35).max(2.0);
                    semantic_scored.retain(|h| h.score >= floor);
                }
            }
            if semantic_scored.is_empty() && !semantic_list.is_empty() {
                semantic_scored = semantic_list.iter().take(cap.max(3)).cloned().collect();
            }

            // Prefer source types already present in the lexical hits.
            let semantic_ordered: Vec<ChunkHit> = if lexical_source_types.is_empty() {
                semantic_scored
            } else {
                let (preferred, secondary): (Vec<ChunkHit>, Vec<ChunkHit>) = semantic_scored
                    .into_iter()
                    .partition(|h| lexical_source_types.contains(&h.source_type.to_uppercase()));
                preferred.into_iter().chain(secondary).collect()
            };

            semantic_total_raw = Some(semantic_list_raw.len());
            lexical_total = Some(lexical_list.len());
            if s.search_dynamic_single_token_semantic_cap_enabled && token_count(&query_original) == 1 {
                semantic_tail_policy = "dynamic_single_token".to_string();
                cap = Self::dynamic_single_token_semantic_cap(lexical_list.len());
            }
            semantic_tail_cap_value = Some(cap);
            let tail: Vec<ChunkHit> = semantic_ordered.into_iter().take(cap).collect();
            semantic_tail_added = Some(tail.len());
            final_list = lexical_list;
            final_list.extend(tail);
            mix_policy_applied = Some(MixPolicy::LexicalThenSemanticTail.as_str().to_string());
        }

        // ── Pagination ───────────────────────────────────────────────
        let total_found = final_list.len();
        let top_candidates: Vec<ChunkHit> = final_list
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .collect();

        let duration_ms = start.elapsed().as_millis() as u64;

        let mut metadata = SearchMetadata {
            total_count: total_found,
            cached: false,
            cache_layer: "MISS".to_string(),
            search_log_id: None,
            duration_ms,
            retrieval_fusion_mode: fusion_mode.as_str().to_string(),
            retrieval_path: "hybrid".to_string(),
            retrieval_steps: bucket_raw_counts,
            router_mode: s.search_router_mode.as_str().to_string(),
            router_reason: router_reason.clone(),
            retrieval_mode: retrieval_mode.as_str().to_string(),
            selected_buckets: selected_buckets.clone(),
            executed_strategies: executed_strategies.clone(),
            lexical_total,
            semantic_total_raw,
            semantic_tail_cap: semantic_tail_cap_value,
            semantic_tail_added,
            semantic_tail_policy,
            result_mix_policy: mix_policy_applied,
            query_original: query_original.clone(),
            query_corrected: query_corrected.clone(),
            query_correction_applied,
            typo_rescue_applied,
            lemma_seed_fallback_applied,
            visibility_scope: request.filters.visibility_scope.as_str().to_string(),
            content_type_filter: request.filters.content_type.clone(),
            ingestion_type_filter: request.filters.ingestion_type.clone(),
            latency_budget_applied: false,
            graph_timeout_triggered: false,
            noise_guard_applied,
            expansion_skipped_reason,
            strategy_timing_ms,
            odl_rescue_applied,
            odl_rescue_added,
        };

        // ── Analytics (best-effort) ──────────────────────────────────
        let top_result = top_candidates.first();
        let entry = SearchLogEntry {
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            query: request.query.clone(),
            intent: request.intent.as_str().to_string(),
            rrf_weights: format!("fusion:{}, vec:1.0, bm25:1.0, graph:1.0", fusion_mode.as_str()),
            top_result_id: top_result.map(|h| h.id.clone()),
            top_result_score: top_result.map(|h| h.score).unwrap_or(0.0),
            execution_time_ms: duration_ms as f64,
            strategy_details: serde_json::to_value(&metadata).unwrap_or_default(),
        };
        match self.store.log_search(&entry).await {
            Ok(log_id) => metadata.search_log_id = log_id,
            Err(err) => error!(error = %err, "failed to log search analytics"),
        }

        let outcome = SearchOutcome {
            results: top_candidates,
            total_count: total_found,
            metadata,
        };

        // ── Cache write (best-effort) ────────────────────────────────
        let mut cacheable = outcome.clone();
        cacheable.metadata.search_log_id = None;
        match serde_json::to_value(&cacheable) {
            Ok(value) => {
                self.cache
                    .set(&cache_key, value, Duration::from_secs(s.cache_l1_ttl_secs))
                    .await;
            }
            Err(err) => error!(error = %err, "search cache set failed"),
        }

        Ok(outcome)
    }
}
