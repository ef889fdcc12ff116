use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tomehub_db::models::{ChunkHit, SearchFilters};

/// Question/query intent as classified upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    Direct,
    CitationSeeking,
    FollowUp,
    Narrative,
    Societal,
    Synthesis,
    Comparative,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "DIRECT",
            Self::CitationSeeking => "CITATION_SEEKING",
            Self::FollowUp => "FOLLOW_UP",
            Self::Narrative => "NARRATIVE",
            Self::Societal => "SOCIETAL",
            Self::Synthesis => "SYNTHESIS",
            Self::Comparative => "COMPARATIVE",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "DIRECT" => Self::Direct,
            "CITATION_SEEKING" => Self::CitationSeeking,
            "FOLLOW_UP" => Self::FollowUp,
            "NARRATIVE" => Self::Narrative,
            "SOCIETAL" => Self::Societal,
            "COMPARATIVE" => Self::Comparative,
            _ => Self::Synthesis,
        }
    }

    /// Intents answered best by exact/citation retrieval.
    pub fn is_direct_like(self) -> bool {
        matches!(self, Self::Direct | Self::CitationSeeking | Self::FollowUp)
    }
}

/// Result-mix policies the orchestrator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixPolicy {
    LexicalThenSemanticTail,
}

impl MixPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LexicalThenSemanticTail => "lexical_then_semantic_tail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "lexical_then_semantic_tail" => Some(Self::LexicalThenSemanticTail),
            _ => None,
        }
    }
}

/// One search invocation against the orchestrator.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub user_id: String,
    pub limit: usize,
    pub offset: usize,
    pub intent: Intent,
    pub filters: SearchFilters,
    pub session_id: Option<String>,
    pub result_mix_policy: Option<MixPolicy>,
    pub semantic_tail_cap: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: &str, user_id: &str) -> Self {
        Self {
            query: query.to_string(),
            user_id: user_id.to_string(),
            limit: 50,
            offset: 0,
            intent: Intent::Synthesis,
            filters: SearchFilters::default(),
            session_id: None,
            result_mix_policy: None,
            semantic_tail_cap: None,
        }
    }
}

/// Raw per-bucket candidate counts, kept for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketCounts {
    pub initial_exact_raw_count: usize,
    pub initial_lemma_raw_count: usize,
    pub initial_lexical_raw_count: usize,
    pub exact_raw_count: usize,
    pub lemma_raw_count: usize,
    pub semantic_raw_count: usize,
    pub semantic_variation_query_count: usize,
    pub semantic_variation_hit_count: usize,
    pub typo_rescue_added_exact: usize,
    pub typo_rescue_added_lemma: usize,
    pub lemma_seed_added_exact: usize,
    pub odl_rescue_added: usize,
}

/// Stable diagnostics envelope returned with every search.
///
/// Consumers must ignore unknown keys; the schema only ever grows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub total_count: usize,
    pub cached: bool,
    pub cache_layer: String,
    pub search_log_id: Option<i64>,
    pub duration_ms: u64,
    pub retrieval_fusion_mode: String,
    pub retrieval_path: String,
    pub retrieval_steps: BucketCounts,
    pub router_mode: String,
    pub router_reason: String,
    pub retrieval_mode: String,
    pub selected_buckets: Vec<String>,
    pub executed_strategies: Vec<String>,
    pub lexical_total: Option<usize>,
    pub semantic_total_raw: Option<usize>,
    pub semantic_tail_cap: Option<usize>,
    pub semantic_tail_added: Option<usize>,
    pub semantic_tail_policy: String,
    pub result_mix_policy: Option<String>,
    pub query_original: String,
    pub query_corrected: String,
    pub query_correction_applied: bool,
    pub typo_rescue_applied: bool,
    pub lemma_seed_fallback_applied: bool,
    pub visibility_scope: String,
    pub content_type_filter: Option<String>,
    pub ingestion_type_filter: Option<String>,
    pub latency_budget_applied: bool,
    pub graph_timeout_triggered: bool,
    pub noise_guard_applied: bool,
    pub expansion_skipped_reason: Option<String>,
    pub strategy_timing_ms: BTreeMap<String, u64>,
    pub odl_rescue_applied: bool,
    pub odl_rescue_added: usize,
}

/// Final orchestrator output: one page of hits plus the fused total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<ChunkHit>,
    pub total_count: usize,
    pub metadata: SearchMetadata,
}
