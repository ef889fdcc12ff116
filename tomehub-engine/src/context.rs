//! RAG context assembly: builds the evidence set for a single question.
//!
//! Layers query rewriting, compare fan-out, orchestrated retrieval, graph
//! traversal, external-KB candidates, a gap-filling keyword pass, epistemic
//! classification and the answer-mode gate into one `RagContext`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use tomehub_core::Settings;
use tomehub_core::text::{deaccent, normalize_match_text};
use tomehub_db::Store;
use tomehub_db::models::{ChunkHit, ResourceType, SearchFilters, VisibilityScope};
use tomehub_search::cache::{MultiLayerCache, generate_cache_key};
use tomehub_search::orchestrator::SearchOrchestrator;
use tomehub_search::strategies::{ExternalKbStrategy, GraphOutcome, GraphTraverseStrategy};
use tomehub_search::types::{Intent, MixPolicy, SearchMetadata, SearchRequest};

use crate::epistemic::{
    AnnotatedChunk, AnswerMode, Complexity, EpistemicAnnotation, EpistemicLevel, LevelCounts,
    PassageClassifier, classify_chunk, classify_question_intent, extract_core_concepts,
};
use crate::errors::EngineResult;
use crate::network::{NetworkClassifier, NetworkInfo};

/// Sentinel compare target standing for "all of the user's notes".
pub const USER_NOTES_TARGET: &str = "__USER_NOTES__";

const REWRITE_CACHE_TTL: Duration = Duration::from_secs(1800);
const REWRITE_TIMEOUT: Duration = Duration::from_secs(4);
const MAX_COMBINED_CHUNKS: usize = 100;
const STANDARD_TOP_CHUNKS: usize = 40;

const REWRITE_TRIGGER_TOKENS: &[&str] = &[
    "bu", "bunu", "buna", "bunun", "bundan", "su", "sunu", "boyle", "soyle", "o", "onu", "ona",
    "onun", "ondan", "bunlar", "onlar", "ikisi", "ikisinin", "ikisinde", "ayni", "fark", "farki",
    "iliski", "ilgili", "devam", "peki", "ya", "pekiya",
];

const REWRITE_LEADIN_PHRASES: &[&str] = &[
    "peki", "o zaman", "bu durumda", "buna gore", "bununla", "bunun icin", "buradan",
];

const REWRITE_GREETING_TOKENS: &[&str] = &[
    "merhaba", "selam", "selamlar", "hey", "hi", "hello", "gunaydin", "iyiaksamlar", "iyiaksam",
    "iyigunler",
];

const NOTES_COMPARE_TOKENS: &[&str] = &["not", "note", "highlight", "vurgu"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeMode {
    Auto,
    BookFirst,
    HighlightFirst,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareMode {
    ExplicitOnly,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssemblyMode {
    Standard,
    Explorer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Request-layer facing answer request (inputs assumed pre-validated).
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub question: String,
    pub user_id: String,
    pub context_book_id: Option<String>,
    pub chat_history: Vec<ChatTurn>,
    pub session_summary: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub session_id: Option<String>,
    pub resource_type: Option<ResourceType>,
    pub scope_mode: ScopeMode,
    pub compare_mode: Option<CompareMode>,
    pub target_book_ids: Vec<String>,
    pub visibility_scope: VisibilityScope,
    pub content_type: Option<String>,
    pub ingestion_type: Option<String>,
    pub mode: AssemblyMode,
}

impl AnswerRequest {
    pub fn new(question: &str, user_id: &str) -> Self {
        Self {
            question: question.to_string(),
            user_id: user_id.to_string(),
            context_book_id: None,
            chat_history: Vec::new(),
            session_summary: None,
            limit: None,
            offset: 0,
            session_id: None,
            resource_type: None,
            scope_mode: ScopeMode::Auto,
            compare_mode: None,
            target_book_ids: Vec::new(),
            visibility_scope: VisibilityScope::Default,
            content_type: None,
            ingestion_type: None,
            mode: AssemblyMode::Standard,
        }
    }
}

/// A recorded retrieval degradation (optional stage failed or timed out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Degradation {
    pub component: String,
    pub reason: String,
    pub severity: String,
}

/// Stable assembler diagnostics envelope; consumers ignore unknown keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblerMetadata {
    pub degradations: Vec<Degradation>,
    pub status: String,
    pub search_log_id: Option<i64>,
    pub effective_query: String,
    pub query_rewrite_applied: bool,
    pub vector_candidates_count: usize,
    pub graph_candidates_count: usize,
    pub external_graph_candidates_count: usize,
    pub source_diversity_count: usize,
    pub source_type_diversity_count: usize,
    pub academic_scope: bool,
    pub external_kb_used: bool,
    pub wikidata_qid: Option<String>,
    pub retrieval_fusion_mode: String,
    pub retrieval_path: String,
    pub router_mode: String,
    pub router_reason: Option<String>,
    pub retrieval_mode: String,
    pub selected_buckets: Vec<String>,
    pub executed_strategies: Vec<String>,
    pub latency_budget_applied: bool,
    pub graph_timeout_triggered: bool,
    pub graph_skipped_by_intent: bool,
    pub noise_guard_applied: bool,
    pub noise_guard_filtered_graph_count: usize,
    pub supplementary_keyword_search_applied: bool,
    pub supplementary_search_skipped_reason: Option<String>,
    pub expansion_skipped_reason: Option<String>,
    pub odl_rescue_applied: bool,
    pub odl_rescue_added: usize,
    pub compare_applied: bool,
    pub compare_mode: Option<String>,
    pub target_books_used: Vec<String>,
    pub target_books_truncated: bool,
    pub unauthorized_target_book_ids: Vec<String>,
    pub auto_resolved_target_book_ids: Vec<String>,
    pub compare_focus_query: String,
    pub latency_budget_hit: bool,
    pub evidence_policy: String,
    pub per_book_evidence_count: BTreeMap<String, usize>,
    pub compare_degrade_reason: String,
    pub level_counts: LevelCounts,
}

/// Assembled evidence plus everything the answer engine needs downstream.
#[derive(Debug, Clone)]
pub struct RagContext {
    pub chunks: Vec<AnnotatedChunk>,
    pub intent: Intent,
    pub complexity: Complexity,
    pub mode: AnswerMode,
    pub confidence: f64,
    pub network: NetworkInfo,
    pub keywords: Vec<String>,
    pub search_log_id: Option<i64>,
    pub level_counts: LevelCounts,
    pub metadata: AssemblerMetadata,
}

/// Query rewriting collaborator (LLM-lite in production).
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, question: &str, history_str: &str) -> EngineResult<Option<String>>;
}

pub struct NoopQueryRewriter;

#[async_trait]
impl QueryRewriter for NoopQueryRewriter {
    async fn rewrite(&self, _question: &str, _history_str: &str) -> EngineResult<Option<String>> {
        Ok(None)
    }
}

/// Quality gate shared with the orchestrator's semantic tail: drop obvious
/// placeholder/test/template rows before they reach the prompt.
fn passes_noise_guard(hit: &ChunkHit, enabled: bool) -> bool {
    if !enabled {
        return true;
    }
    const ALLOWLIST: &[&str] = &[
        "PDF", "EPUB", "PDF_CHUNK", "BOOK", "HIGHLIGHT", "INSIGHT", "PERSONAL_NOTE", "ARTICLE",
        "WEBSITE", "GRAPH_RELATION", "UNKNOWN", "OTHER", "NOTES",
    ];
    let content = hit.text.trim();
    let content_lc = content.to_lowercase();
    let title_lc = hit.title.trim().to_lowercase();
    let source_type = hit.source_type.trim().to_uppercase();

    if !source_type.is_empty() && !ALLOWLIST.contains(&source_type.as_str()) {
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

/// Candidate map preserving first-insertion order, compare hits win dedup.
struct CandidateMap {
    order: Vec<String>,
    entries: HashMap<String, AnnotatedChunk>,
}

impl CandidateMap {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, chunk: AnnotatedChunk) {
        let key = chunk.hit.merge_key();
        match self.entries.get(&key) {
            None => {
                self.order.push(key.clone());
                self.entries.insert(key, chunk);
            }
            Some(existing) => {
                let existing_is_compare =
                    existing.annotation.compare_primary || existing.annotation.compare_secondary;
                let incoming_is_compare =
                    chunk.annotation.compare_primary || chunk.annotation.compare_secondary;
                if incoming_is_compare && !existing_is_compare {
                    self.entries.insert(key, chunk);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn into_vec(self) -> Vec<AnnotatedChunk> {
        let mut entries = self.entries;
        self.order
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }
}

pub struct ContextAssembler {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    orchestrator: Arc<SearchOrchestrator>,
    graph: Arc<GraphTraverseStrategy>,
    external_kb: Arc<ExternalKbStrategy>,
    rewriter: Arc<dyn QueryRewriter>,
    classifier: Arc<dyn PassageClassifier>,
    network: Arc<dyn NetworkClassifier>,
    cache: Arc<MultiLayerCache>,
}

impl ContextAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        orchestrator: Arc<SearchOrchestrator>,
        graph: Arc<GraphTraverseStrategy>,
        external_kb: Arc<ExternalKbStrategy>,
        rewriter: Arc<dyn QueryRewriter>,
        classifier: Arc<dyn PassageClassifier>,
        network: Arc<dyn NetworkClassifier>,
        cache: Arc<MultiLayerCache>,
    ) -> Self {
        Self {
            settings,
            store,
            orchestrator,
            graph,
            external_kb,
            rewriter,
            classifier,
            network,
            cache,
        }
    }

    fn tokens_of(question: &str) -> Vec<String> {
        deaccent(question)
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn should_rewrite_with_history(question: &str, history: &[ChatTurn]) -> bool {
        if history.is_empty() {
            return false;
        }
        let q = question.trim();
        if q.is_empty() {
            return false;
        }
        let q_ascii = deaccent(q);
        let tokens = Self::tokens_of(q);
        if tokens.len() <= 4 {
            return true;
        }
        if REWRITE_LEADIN_PHRASES.iter().any(|p| q_ascii.starts_with(p)) {
            return true;
        }
        let token_set: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        if REWRITE_TRIGGER_TOKENS.iter().any(|t| token_set.contains(t)) {
            return true;
        }
        q.contains('?') && tokens.len() <= 8
    }

    /// Layer-3 perf guard: skip rewriting queries already specific enough.
    fn rewrite_guard_skip_reason(&self, question: &str) -> Option<&'static str> {
        if !self.settings.l3_perf_rewrite_guard_enabled {
            return None;
        }
        let q = question.trim();
        if q.is_empty() {
            return Some("empty_query");
        }
        let q_ascii = deaccent(q);
        let tokens = Self::tokens_of(q);
        if tokens.is_empty() {
            return Some("empty_query");
        }
        if tokens.len() == 1 && REWRITE_GREETING_TOKENS.contains(&tokens[0].as_str()) {
            return Some("standalone_greeting");
        }
        if tokens.len() == 1 {
            return None;
        }
        let token_set: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        let has_leadin = REWRITE_LEADIN_PHRASES.iter().any(|p| q_ascii.starts_with(p));
        let has_trigger = REWRITE_TRIGGER_TOKENS.iter().any(|t| token_set.contains(t));
        let has_short_question = q.contains('?') && tokens.len() <= 8;

        if (2..=7).contains(&tokens.len()) && !has_leadin && !has_trigger && !has_short_question {
            return Some("standalone_short_query");
        }
        if !has_leadin && !has_trigger && !has_short_question {
            return Some("lexically_specific_query");
        }
        None
    }

    fn history_fingerprint(&self, history: &[ChatTurn]) -> String {
        let turns = self.settings.chat_prompt_turns;
        history
            .iter()
            .rev()
            .take(turns)
            .rev()
            .filter(|turn| !turn.content.trim().is_empty())
            .map(|turn| {
                let content: String = turn.content.trim().chars().take(220).collect();
                format!("{}:{}", turn.role.trim().to_lowercase(), content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Rewrite short/anaphoric follow-ups into standalone form (cached).
    async fn rewrite_query(&self, question: &str, history: &[ChatTurn]) -> (String, bool) {
        if history.is_empty() {
            return (question.to_string(), false);
        }
        if let Some(reason) = self.rewrite_guard_skip_reason(question) {
            debug!(reason, "query rewrite skipped by guard");
            return (question.to_string(), false);
        }
        if !Self::should_rewrite_with_history(question, history) {
            return (question.to_string(), false);
        }

        let fingerprint = self.history_fingerprint(history);
        let cache_key = generate_cache_key(
            "query_rewrite",
            &format!("{question}\n{fingerprint}"),
            "",
            None,
            self.settings.chat_prompt_turns,
            &self.settings.llm_model_version,
        );
        if let Some((cached, _)) = self.cache.get(&cache_key).await {
            if let Some(rewritten) = cached.as_str().map(str::to_string).filter(|s| !s.trim().is_empty()) {
                return (rewritten, true);
            }
        }

        let history_str = history
            .iter()
            .rev()
            .take(self.settings.chat_prompt_turns)
            .rev()
            .map(|turn| {
                let role = if turn.role == "user" { "Kullanıcı" } else { "Asistan" };
                format!("{role}: {}", turn.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let rewritten = match tokio::time::timeout(REWRITE_TIMEOUT, self.rewriter.rewrite(question, &history_str)).await
        {
            Ok(Ok(Some(text))) => text.trim().to_string(),
            Ok(Ok(None)) => return (question.to_string(), false),
            Ok(Err(err)) => {
                warn!(error = %err, "query rewriting failed");
                return (question.to_string(), false);
            }
            Err(_) => {
                warn!("query rewriting timed out");
                return (question.to_string(), false);
            }
        };

        if rewritten.is_empty() || rewritten.chars().count() > 220.max(question.chars().count() * 3) {
            return (question.to_string(), false);
        }
        self.cache
            .set(&cache_key, serde_json::Value::String(rewritten.clone()), REWRITE_CACHE_TTL)
            .await;
        (rewritten, true)
    }

    fn base_filters(&self, request: &AnswerRequest) -> SearchFilters {
        // Scope mode is a retrieval hint: it narrows the resource scope only
        // when the caller did not pin one explicitly.
        let resource_type = request.resource_type.clone().or(match request.scope_mode {
            ScopeMode::BookFirst => Some(ResourceType::Book),
            ScopeMode::HighlightFirst => Some(ResourceType::AllNotes),
            ScopeMode::Auto | ScopeMode::Global => None,
        });
        SearchFilters {
            book_id: request.context_book_id.clone(),
            resource_type,
            content_type: request.content_type.clone(),
            ingestion_type: request.ingestion_type.clone(),
            visibility_scope: request.visibility_scope,
            length: None,
            exclude_pdf: false,
        }
    }

    fn search_request(
        &self,
        request: &AnswerRequest,
        query: &str,
        intent: Intent,
        filters: SearchFilters,
        limit: usize,
        mix_policy: Option<MixPolicy>,
    ) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            user_id: request.user_id.clone(),
            limit,
            offset: 0,
            intent,
            filters,
            session_id: request.session_id.clone(),
            result_mix_policy: mix_policy,
            semantic_tail_cap: mix_policy.map(|_| self.settings.search_smart_semantic_tail_cap),
        }
    }

    fn infer_explorer_book_ids(hits: &[ChunkHit], hard_limit: usize) -> Vec<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for hit in hits.iter().take(60) {
            if let Some(book_id) = hit.book_id.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
                *counts.entry(book_id.to_string()).or_insert(0) += 1;
            }
        }
        let mut ordered: Vec<(String, usize)> = counts.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().take(hard_limit.max(1)).map(|(id, _)| id).collect()
    }

    /// Build the full evidence set for a question. `None` means every
    /// retrieval path failed and no context exists at all.
    pub async fn assemble(&self, request: &AnswerRequest) -> EngineResult<Option<RagContext>> {
        let s = self.settings.clone();
        let mut meta = AssemblerMetadata {
            status: "healthy".to_string(),
            evidence_policy: "standard".to_string(),
            noise_guard_applied: s.search_noise_guard_enabled,
            ..AssemblerMetadata::default()
        };

        // 1. Query rewriting (memory layer).
        let (effective_query, rewrite_applied) =
            self.rewrite_query(&request.question, &request.chat_history).await;
        meta.effective_query = effective_query.clone();
        meta.query_rewrite_applied = rewrite_applied;

        // 2. Intent + keywords, classified early to steer retrieval.
        let (intent, complexity) = classify_question_intent(&effective_query);
        let keywords = extract_core_concepts(&effective_query);

        let mut candidates = CandidateMap::new();

        // 3. Compare policy: per-book fan-out retrieval.
        let compare_focus_query = keywords
            .first()
            .cloned()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| effective_query.clone());
        meta.compare_focus_query = compare_focus_query.clone();
        meta.compare_mode = request.compare_mode.map(|m| {
            match m {
                CompareMode::ExplicitOnly => "EXPLICIT_ONLY",
                CompareMode::Auto => "AUTO",
            }
            .to_string()
        });

        let mut compare_targets: Vec<String> = request
            .target_book_ids
            .iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();

        let compare_policy_enabled = s.search_compare_policy_enabled
            || s.search_compare_canary_uids.contains(request.user_id.trim());

        let q_norm = normalize_match_text(&effective_query);
        let notes_vs_single_requested = request.context_book_id.is_some()
            && compare_targets.is_empty()
            && NOTES_COMPARE_TOKENS.iter().any(|tok| q_norm.contains(tok));

        if notes_vs_single_requested {
            if let Some(book_id) = &request.context_book_id {
                compare_targets = vec![book_id.trim().to_string(), USER_NOTES_TARGET.to_string()];
            }
        } else if compare_targets.is_empty() {
            let catalog = self.store.book_title_catalog(&request.user_id).await.unwrap_or_default();
            let resolved = crate::analytics::resolve_book_ids_from_question(&catalog, &effective_query, 5);
            if resolved.len() >= 2 {
                meta.auto_resolved_target_book_ids = resolved.clone();
                compare_targets = resolved;
                debug!(targets = ?compare_targets, "auto-resolved compare targets from query");
            }
        }

        // Authorisation: silently drop targets outside the user's book set.
        let authorized = self.store.user_book_ids(&request.user_id).await.unwrap_or_default();
        let mut filtered_targets: Vec<String> = Vec::new();
        for target in compare_targets {
            if target == USER_NOTES_TARGET {
                if !filtered_targets.contains(&target) {
                    filtered_targets.push(target);
                }
                continue;
            }
            if !authorized.is_empty() && !authorized.contains(&target) {
                meta.unauthorized_target_book_ids.push(target);
                continue;
            }
            if !filtered_targets.contains(&target) {
                filtered_targets.push(target);
            }
        }
        let mut compare_targets = filtered_targets;

        let compare_requested = request.compare_mode == Some(CompareMode::ExplicitOnly)
            || compare_policy_enabled
            || notes_vs_single_requested;
        let compare_applied = compare_requested && compare_targets.len() >= 2;
        meta.compare_applied = compare_applied;

        if compare_applied {
            let max_targets = s.search_compare_target_max.max(2);
            if compare_targets.len() > max_targets {
                compare_targets.truncate(max_targets);
                meta.target_books_truncated = true;
            }
            meta.target_books_used = compare_targets.clone();
            meta.evidence_policy = "TEXT_PRIMARY_NOTES_SECONDARY_V1".to_string();

            let per_book_primary = s.search_compare_primary_per_book.max(1);
            let per_book_secondary = s.search_compare_secondary_per_book;
            let deadline = Instant::now() + Duration::from_millis(s.search_compare_timeout_ms.max(50));

            let mut primary_rows: Vec<AnnotatedChunk> = Vec::new();
            let mut secondary_rows: Vec<AnnotatedChunk> = Vec::new();

            for target in &compare_targets {
                if Instant::now() > deadline {
                    meta.latency_budget_hit = true;
                    meta.compare_degrade_reason = "timeout_partial_results".to_string();
                    break;
                }

                let (filters, limit, is_secondary) = if target == USER_NOTES_TARGET {
                    (
                        SearchFilters {
                            resource_type: Some(ResourceType::AllNotes),
                            visibility_scope: request.visibility_scope,
                            content_type: request.content_type.clone(),
                            ingestion_type: request.ingestion_type.clone(),
                            ..SearchFilters::default()
                        },
                        per_book_secondary,
                        true,
                    )
                } else {
                    (
                        SearchFilters {
                            book_id: Some(target.clone()),
                            resource_type: Some(ResourceType::Book),
                            visibility_scope: request.visibility_scope,
                            content_type: request.content_type.clone(),
                            ingestion_type: request.ingestion_type.clone(),
                            ..SearchFilters::default()
                        },
                        per_book_primary,
                        false,
                    )
                };
                if limit == 0 {
                    meta.per_book_evidence_count.insert(target.clone(), 0);
                    continue;
                }

                let search_request =
                    self.search_request(request, &compare_focus_query, intent, filters, limit, None);
                match self.orchestrator.search(&search_request).await {
                    Ok(outcome) => {
                        meta.per_book_evidence_count.insert(target.clone(), outcome.results.len());
                        for hit in outcome.results {
                            let annotation = EpistemicAnnotation {
                                compare_primary: !is_secondary,
                                compare_secondary: is_secondary,
                                compare_book_id: Some(target.clone()),
                                ..EpistemicAnnotation::default()
                            };
                            let annotated = AnnotatedChunk { hit, annotation };
                            if is_secondary {
                                secondary_rows.push(annotated);
                            } else {
                                primary_rows.push(annotated);
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, target = %target, "compare fan-out search failed");
                        meta.per_book_evidence_count.insert(target.clone(), 0);
                    }
                }
            }

            // Notes stay secondary: cap them to a fraction of the primaries.
            let max_secondary = if primary_rows.is_empty() {
                0
            } else {
                (((primary_rows.len() as f64) * s.search_compare_secondary_max_ratio).floor() as usize).max(1)
            };
            secondary_rows.truncate(max_secondary);

            for chunk in primary_rows.into_iter().chain(secondary_rows) {
                candidates.insert(chunk);
            }
        }

        // 4. Default retrieval + graph future in parallel.
        let retrieval_limit = request.limit.unwrap_or(20);
        let mut default_filters = self.base_filters(request);
        if compare_applied {
            // Compare fan-out already ran per book; fill gaps broadly.
            default_filters.book_id = None;
        }
        let vector_request = self.search_request(
            request,
            &effective_query,
            intent,
            default_filters,
            retrieval_limit,
            None,
        );

        let graph_skipped_by_intent =
            s.search_graph_direct_skip && matches!(intent, Intent::Direct | Intent::FollowUp);
        meta.graph_skipped_by_intent = graph_skipped_by_intent;

        let graph_handle = if graph_skipped_by_intent {
            None
        } else {
            meta.latency_budget_applied = true;
            let graph = self.graph.clone();
            let query = effective_query.clone();
            let user = request.user_id.clone();
            let limit = request.limit.unwrap_or(15);
            let offset = request.offset;
            Some(tokio::spawn(async move { graph.retrieve(&query, &user, limit, offset).await }))
        };

        let mut question_results: Vec<ChunkHit> = Vec::new();
        let mut vec_meta: Option<SearchMetadata> = None;
        match self.orchestrator.search(&vector_request).await {
            Ok(outcome) => {
                question_results = outcome.results;
                vec_meta = Some(outcome.metadata);
            }
            Err(err) => {
                error!(error = %err, "vector search failed");
                meta.degradations.push(Degradation {
                    component: "VECTOR_SEARCH".to_string(),
                    reason: err.to_string(),
                    severity: "HIGH".to_string(),
                });
            }
        }

        let mut graph_candidates_count = 0usize;
        if let Some(handle) = graph_handle {
            let graph_timeout = Duration::from_millis(s.search_graph_timeout_ms.max(50));
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(graph_timeout, handle).await {
                Ok(Ok(GraphOutcome::Hits(graph_hits))) => {
                    graph_candidates_count = graph_hits.len();
                    for candidate in graph_hits {
                        let hit = ChunkHit {
                            id: String::new(),
                            title: candidate.title,
                            text: candidate.text,
                            source_type: "GRAPH_RELATION".to_string(),
                            page_number: candidate.page_number,
                            chunk_index: None,
                            tags: None,
                            summary: None,
                            comment: None,
                            book_id: None,
                            normalized_text: None,
                            score: candidate.graph_score,
                            match_type: "graph".to_string(),
                        };
                        if !passes_noise_guard(&hit, s.search_noise_guard_enabled) {
                            meta.noise_guard_filtered_graph_count += 1;
                            continue;
                        }
                        candidates.insert(AnnotatedChunk {
                            hit,
                            annotation: EpistemicAnnotation {
                                graph_score: Some(candidate.graph_score),
                                level: EpistemicLevel::B,
                                ..EpistemicAnnotation::default()
                            },
                        });
                    }
                }
                Ok(Ok(GraphOutcome::Degraded { reason })) => {
                    meta.degradations.push(Degradation {
                        component: "GRAPH_SERVICE".to_string(),
                        reason,
                        severity: "HIGH".to_string(),
                    });
                }
                Ok(Err(join_err)) => {
                    meta.degradations.push(Degradation {
                        component: "GRAPH_SERVICE".to_string(),
                        reason: join_err.to_string(),
                        severity: "HIGH".to_string(),
                    });
                }
                Err(_) => {
                    abort_handle.abort();
                    meta.graph_timeout_triggered = true;
                    meta.degradations.push(Degradation {
                        component: "GRAPH_SERVICE".to_string(),
                        reason: format!("timeout>{}ms", s.search_graph_timeout_ms),
                        severity: "MEDIUM".to_string(),
                    });
                }
            }
        }
        meta.graph_candidates_count = graph_candidates_count;
        meta.vector_candidates_count = question_results.len();

        // Merge orchestrated results; compare-marked entries win dedup.
        for hit in &question_results {
            candidates.insert(AnnotatedChunk {
                hit: hit.clone(),
                annotation: EpistemicAnnotation::default(),
            });
        }

        // 5. External KB (explorer mode only).
        if request.mode == AssemblyMode::Explorer && s.external_kb_enabled {
            let candidate_book_ids = if let Some(book_id) = &request.context_book_id {
                vec![book_id.trim().to_string()]
            } else {
                Self::infer_explorer_book_ids(&question_results, 3)
            };

            let ext_limit_total = s.external_kb_max_candidates.clamp(1, 10);
            let per_book_limit = ext_limit_total.min(3).max(1);
            let mut seen_external = HashSet::new();
            let mut external_added = 0usize;

            'books: for book_id in candidate_book_ids {
                if book_id.is_empty() {
                    continue;
                }
                if let Ok(external_meta) = self.external_kb.meta(&request.user_id, &book_id).await {
                    meta.academic_scope |= external_meta.academic_scope;
                    if meta.wikidata_qid.is_none() {
                        meta.wikidata_qid = external_meta.wikidata_qid;
                    }
                }
                let book_candidates = self
                    .external_kb
                    .candidates(
                        &request.user_id,
                        &book_id,
                        &effective_query,
                        per_book_limit,
                        s.external_kb_min_confidence,
                    )
                    .await;
                for candidate in book_candidates {
                    let key = format!(
                        "{}_{}",
                        candidate.hit.title,
                        candidate.hit.text.chars().take(80).collect::<String>()
                    );
                    if !seen_external.insert(key) {
                        continue;
                    }
                    external_added += 1;
                    candidates.insert(AnnotatedChunk {
                        annotation: EpistemicAnnotation {
                            external_weight: Some(candidate.external_weight),
                            level: EpistemicLevel::B,
                            ..EpistemicAnnotation::default()
                        },
                        hit: candidate.hit,
                    });
                    if external_added >= ext_limit_total {
                        break 'books;
                    }
                }
            }
            meta.external_graph_candidates_count = external_added;
            meta.external_kb_used = external_added > 0;
        }

        // 6. Supplementary keyword pass, only when the pool is sparse.
        let gap_fill_threshold = retrieval_limit.clamp(10, 20);
        let mut should_run_supplementary = false;
        if keywords.is_empty() {
            meta.supplementary_search_skipped_reason = Some("no_keywords".to_string());
        } else if !s.l3_perf_supplementary_gate_enabled {
            should_run_supplementary = candidates.len() < gap_fill_threshold;
        } else {
            let low_evidence_threshold = (retrieval_limit / 2).clamp(4, 10);
            let sparse_primary = question_results.len() <= low_evidence_threshold;
            let sparse_combined = candidates.len() < gap_fill_threshold;
            should_run_supplementary = sparse_primary && sparse_combined;
            if !should_run_supplementary {
                meta.supplementary_search_skipped_reason = Some("sufficient_primary_evidence".to_string());
            }
        }

        if should_run_supplementary {
            let search_kw = keywords.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
            if !search_kw.trim().is_empty() && search_kw != effective_query {
                meta.supplementary_keyword_search_applied = true;
                let kw_limit = retrieval_limit.clamp(8, 14);
                let mut kw_filters = self.base_filters(request);
                kw_filters.book_id = None;
                let kw_request = self.search_request(
                    request,
                    &search_kw,
                    intent,
                    kw_filters,
                    kw_limit,
                    Some(MixPolicy::LexicalThenSemanticTail),
                );
                match self.orchestrator.search(&kw_request).await {
                    Ok(outcome) => {
                        for hit in outcome.results {
                            candidates.insert(AnnotatedChunk {
                                hit,
                                annotation: EpistemicAnnotation::default(),
                            });
                        }
                    }
                    Err(err) => warn!(error = %err, "supplementary keyword search failed"),
                }
            } else {
                meta.supplementary_search_skipped_reason = Some("keyword_variant_missing".to_string());
            }
        }

        let mut combined: Vec<AnnotatedChunk> = candidates.into_vec();
        if combined.is_empty() && request.mode != AssemblyMode::Explorer {
            // Every retrieval path came back empty: no context at all.
            if let Some(vm) = &vec_meta {
                meta.search_log_id = vm.search_log_id;
            }
            return Ok(None);
        }
        combined.truncate(MAX_COMBINED_CHUNKS);

        // 7. Epistemic classification + graph/external re-scoring.
        for chunk in &mut combined {
            let scored = classify_chunk(&keywords, &chunk.hit, self.classifier.as_ref());
            let preserved = chunk.annotation.clone();
            chunk.annotation = EpistemicAnnotation {
                graph_score: preserved.graph_score,
                external_weight: preserved.external_weight,
                compare_primary: preserved.compare_primary,
                compare_secondary: preserved.compare_secondary,
                compare_book_id: preserved.compare_book_id,
                ..scored
            };

            if chunk.hit.source_type == "GRAPH_RELATION" {
                // Keyword scoring may legitimately give 0 here: invisible
                // bridges match by concept, not by term. Restore confidence
                // from the graph weight.
                let g_score = chunk.annotation.graph_score.unwrap_or(0.5);
                let boost = 1.5 + (g_score - 0.5) * 4.0;
                if boost > chunk.annotation.answerability_score {
                    chunk.annotation.answerability_score = boost;
                    if boost >= 3.0 {
                        chunk.annotation.level = EpistemicLevel::A;
                    } else if boost >= 1.0 {
                        chunk.annotation.level = EpistemicLevel::B;
                    }
                }
            } else if chunk.hit.source_type == "EXTERNAL_KB" {
                let ext_weight = chunk.annotation.external_weight.unwrap_or(s.external_kb_graph_weight);
                let ext_boost = (ext_weight * 3.2).clamp(0.4, 1.3);
                if ext_boost > chunk.annotation.answerability_score {
                    chunk.annotation.answerability_score = ext_boost;
                    chunk.annotation.level = EpistemicLevel::B;
                }
            }
        }

        // Top-40 plus every "gold" chunk that scored >= 2.
        let mut final_chunks: Vec<AnnotatedChunk> = combined.iter().take(STANDARD_TOP_CHUNKS).cloned().collect();
        let mut final_ids: HashSet<String> = final_chunks.iter().map(|c| c.hit.merge_key()).collect();
        for chunk in &combined {
            if chunk.annotation.answerability_score >= 2.0 && final_ids.insert(chunk.hit.merge_key()) {
                final_chunks.push(chunk.clone());
            }
        }

        // Weighted sort: intent + level + literary-length bias.
        let weighted_score = |chunk: &AnnotatedChunk| -> f64 {
            let base = chunk.annotation.answerability_score;
            let is_literature =
                chunk.hit.text.chars().count() > 300 && chunk.annotation.level != EpistemicLevel::A;

            if chunk.hit.source_type == "EXTERNAL_KB" {
                let ext_weight = chunk.annotation.external_weight.unwrap_or(s.external_kb_graph_weight);
                return base * ext_weight.clamp(0.05, 0.30);
            }

            let weight = if matches!(intent, Intent::Narrative | Intent::Societal) {
                if is_literature { 1.2 } else { 1.0 }
            } else if chunk.annotation.level == EpistemicLevel::A {
                1.2
            } else if chunk.annotation.level == EpistemicLevel::B {
                0.9
            } else if is_literature {
                0.4
            } else {
                1.0
            };
            base * weight
        };
        final_chunks.sort_by(|a, b| {
            weighted_score(b)
                .partial_cmp(&weighted_score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Compare ordering guarantee: primaries before secondaries.
        if compare_applied {
            final_chunks.sort_by_key(|c| c.annotation.compare_secondary);
        }

        // 8. Answer-mode gate + confidence.
        let answer_mode = crate::epistemic::determine_answer_mode(&final_chunks, intent, complexity);
        let top_5: Vec<&AnnotatedChunk> = final_chunks.iter().take(5).collect();
        let avg_conf = if top_5.is_empty() {
            0.0
        } else {
            top_5.iter().map(|c| c.annotation.answerability_score).sum::<f64>() / top_5.len() as f64
        };
        let confidence = avg_conf.clamp(0.5, 5.0);

        // 9. Network status.
        let network = self.network.classify(&request.question, &final_chunks);

        // 10. Diagnostics from the vector metadata envelope.
        if let Some(vm) = &vec_meta {
            meta.search_log_id = vm.search_log_id;
            meta.retrieval_fusion_mode = vm.retrieval_fusion_mode.clone();
            meta.retrieval_path = if meta.latency_budget_applied && !graph_skipped_by_intent {
                format!("{}+graph", vm.retrieval_path)
            } else {
                vm.retrieval_path.clone()
            };
            meta.router_mode = vm.router_mode.clone();
            meta.router_reason = Some(vm.router_reason.clone());
            meta.retrieval_mode = vm.retrieval_mode.clone();
            meta.selected_buckets = vm.selected_buckets.clone();
            meta.executed_strategies = vm.executed_strategies.clone();
            meta.expansion_skipped_reason = vm.expansion_skipped_reason.clone();
            meta.odl_rescue_applied = vm.odl_rescue_applied;
            meta.odl_rescue_added = vm.odl_rescue_added;
        }
        meta.source_diversity_count = final_chunks
            .iter()
            .map(|c| c.hit.title.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect::<HashSet<_>>()
            .len();
        meta.source_type_diversity_count = final_chunks
            .iter()
            .map(|c| c.hit.source_type.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect::<HashSet<_>>()
            .len();
        let level_counts = LevelCounts::of(&final_chunks);
        meta.level_counts = level_counts;
        if !meta.degradations.is_empty() {
            meta.status = "partial".to_string();
        }

        // Best-effort diagnostics append on the search log row.
        if s.search_log_diagnostics_persist_enabled {
            if let Some(log_id) = meta.search_log_id {
                if let Ok(diagnostics) = serde_json::to_value(&meta) {
                    if let Err(err) = self.store.append_log_diagnostics(log_id, &diagnostics).await {
                        warn!(error = %err, log_id, "failed to append search log diagnostics");
                    }
                }
            }
        }

        Ok(Some(RagContext {
            chunks: final_chunks,
            intent,
            complexity,
            mode: answer_mode,
            confidence,
            network,
            keywords,
            search_log_id: meta.search_log_id,
            level_counts,
            metadata: meta,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_gating_matches_short_and_anaphoric_queries() {
        let history = vec![ChatTurn {
            role: "user".to_string(),
            content: "vicdan nedir".to_string(),
        }];
        assert!(ContextAssembler::should_rewrite_with_history("peki ya sonra", &history));
        assert!(ContextAssembler::should_rewrite_with_history("bunu açar mısın", &history));
        assert!(!ContextAssembler::should_rewrite_with_history(
            "osmanli devletinin kurulus donemindeki toprak sistemi hakkinda bilgi ver lutfen detayli olarak",
            &history
        ));
        assert!(!ContextAssembler::should_rewrite_with_history("soru", &[]));
    }

    #[test]
    fn noise_guard_rules() {
        let mut hit = ChunkHit {
            id: "1".to_string(),
            title: "Kitap".to_string(),
            text: "x".repeat(80),
            source_type: "PDF_CHUNK".to_string(),
            page_number: None,
            chunk_index: None,
            tags: None,
            summary: None,
            comment: None,
            book_id: None,
            normalized_text: None,
            score: 1.0,
            match_type: "semantic".to_string(),
        };
        assert!(passes_noise_guard(&hit, true));

        hit.text = "kisa".to_string();
        assert!(!passes_noise_guard(&hit, true));
        assert!(passes_noise_guard(&hit, false));

        hit.text = "website deneme ".repeat(10);
        assert!(!passes_noise_guard(&hit, true));

        hit.text = "x".repeat(80);
        hit.source_type = "WEBSITE".to_string();
        assert!(!passes_noise_guard(&hit, true));
        hit.text = "x".repeat(150);
        assert!(passes_noise_guard(&hit, true));
    }

    #[test]
    fn candidate_map_prefers_compare_hits() {
        let mut map = CandidateMap::new();
        let hit = ChunkHit {
            id: "1".to_string(),
            title: "Kitap".to_string(),
            text: "uzun bir metin parçası ".repeat(5),
            source_type: "PDF_CHUNK".to_string(),
            page_number: None,
            chunk_index: None,
            tags: None,
            summary: None,
            comment: None,
            book_id: Some("b1".to_string()),
            normalized_text: None,
            score: 1.0,
            match_type: "content_exact".to_string(),
        };
        let plain = AnnotatedChunk {
            hit: hit.clone(),
            annotation: EpistemicAnnotation::default(),
        };
        let compare = AnnotatedChunk {
            hit,
            annotation: EpistemicAnnotation {
                compare_primary: true,
                ..EpistemicAnnotation::default()
            },
        };
        map.insert(plain);
        map.insert(compare);
        let chunks = map.into_vec();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].annotation.compare_primary);
    }
}
