use std::collections::HashSet;
use std::env;

/// Load .env file if it exists (called automatically when using `from_env`)
pub fn load_dotenv() {
    // Silently ignore errors (file might not exist)
    let _ = dotenvy::dotenv();
}

/// How the search router picks retrieval buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    RuleBased,
    Static,
}

impl RouterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::Static => "static",
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "static" => Self::Static,
            _ => Self::RuleBased,
        }
    }
}

/// Retrieval mode a routed query runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Balanced,
    FastExact,
    SemanticFocus,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::FastExact => "fast_exact",
            Self::SemanticFocus => "semantic_focus",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "fast_exact" => Self::FastExact,
            "semantic_focus" => Self::SemanticFocus,
            _ => Self::Balanced,
        }
    }
}

/// Result fusion algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    Rrf,
    Concat,
}

impl FusionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rrf => "rrf",
            Self::Concat => "concat",
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "rrf" => Self::Rrf,
            _ => Self::Concat,
        }
    }
}

/// Runtime configuration loaded from environment variables.
///
/// Every option has a working default so the engine can run without any
/// environment; provider API keys stay `None` until configured.
#[derive(Debug, Clone)]
pub struct Settings {
    // ── Search routing & fusion ─────────────────────────────────────
    pub search_router_mode: RouterMode,
    pub search_default_mode: RetrievalMode,
    pub retrieval_fusion_mode: FusionMode,
    pub search_mode_routing_enabled: bool,
    pub search_noise_guard_enabled: bool,
    pub search_typo_rescue_enabled: bool,
    pub search_lemma_seed_fallback_enabled: bool,
    pub search_dynamic_single_token_semantic_cap_enabled: bool,
    pub search_smart_semantic_tail_cap: usize,
    /// Max LLM query-expansion variations per search (clamped to 0..=3).
    pub search_semantic_expansion_max_variations: usize,
    /// Primary exact pass must return at least this many rows before the
    /// LIKE backfill pass is skipped (clamped to 1..=500).
    pub search_exact_min_rows: usize,
    pub search_exact_single_token_enabled: bool,

    // ── Compare fan-out policy ──────────────────────────────────────
    pub search_compare_policy_enabled: bool,
    pub search_compare_target_max: usize,
    pub search_compare_primary_per_book: usize,
    pub search_compare_secondary_per_book: usize,
    pub search_compare_timeout_ms: u64,
    pub search_compare_secondary_max_ratio: f64,
    pub search_compare_canary_uids: HashSet<String>,

    // ── Graph retrieval ─────────────────────────────────────────────
    pub search_graph_timeout_ms: u64,
    pub search_graph_bridge_timeout_ms: u64,
    pub search_graph_direct_skip: bool,
    pub concept_strength_min: f64,

    // ── External knowledge base ─────────────────────────────────────
    pub external_kb_enabled: bool,
    pub external_kb_max_candidates: usize,
    pub external_kb_min_confidence: f64,
    pub external_kb_graph_weight: f64,
    pub external_kb_dbpedia_weight: f64,
    pub external_kb_orkg_weight: f64,

    // ── ODL shadow rescue ───────────────────────────────────────────
    pub odl_rescue_enabled: bool,

    // ── LLM models & routing ────────────────────────────────────────
    pub llm_model_lite: String,
    pub llm_model_flash: String,
    pub llm_model_pro: String,
    pub llm_model_version: String,
    pub llm_explorer_qwen_pilot_enabled: bool,
    pub llm_explorer_primary_provider: String,
    pub llm_explorer_primary_model: String,
    pub llm_explorer_fallback_provider: String,
    pub llm_explorer_rpm_cap: usize,
    pub llm_explorer_secondary_max_per_request: u32,
    pub llm_pro_fallback_enabled: bool,
    pub llm_pro_fallback_max_per_request: u32,
    pub llm_quote_dynamic_count_enabled: bool,
    pub llm_quote_dynamic_min: usize,
    pub llm_quote_dynamic_max: usize,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub qwen_api_key: Option<String>,
    pub qwen_base_url: String,

    // ── Layer-3 performance guards ──────────────────────────────────
    pub l3_perf_rewrite_guard_enabled: bool,
    pub l3_perf_context_budget_enabled: bool,
    pub l3_perf_output_budget_enabled: bool,
    pub l3_perf_expansion_tail_fix_enabled: bool,
    pub l3_perf_supplementary_gate_enabled: bool,
    pub l3_perf_max_output_tokens_standard: u32,

    // ── Embedding ───────────────────────────────────────────────────
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_model_version: String,
    pub embedding_dim: usize,

    // ── Chat / cache / analytics ────────────────────────────────────
    pub chat_prompt_turns: usize,
    pub cache_l1_ttl_secs: u64,
    pub redis_url: Option<String>,
    pub search_log_diagnostics_persist_enabled: bool,
    pub search_log_retention_cleanup_enabled: bool,
    pub search_log_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            search_router_mode: RouterMode::RuleBased,
            search_default_mode: RetrievalMode::Balanced,
            retrieval_fusion_mode: FusionMode::Concat,
            search_mode_routing_enabled: true,
            search_noise_guard_enabled: true,
            search_typo_rescue_enabled: true,
            search_lemma_seed_fallback_enabled: true,
            search_dynamic_single_token_semantic_cap_enabled: true,
            search_smart_semantic_tail_cap: 6,
            search_semantic_expansion_max_variations: 2,
            search_exact_min_rows: 1,
            search_exact_single_token_enabled: true,

            search_compare_policy_enabled: false,
            search_compare_target_max: 8,
            search_compare_primary_per_book: 6,
            search_compare_secondary_per_book: 2,
            search_compare_timeout_ms: 2500,
            search_compare_secondary_max_ratio: 1.0 / 3.0,
            search_compare_canary_uids: HashSet::new(),

            search_graph_timeout_ms: 120,
            search_graph_bridge_timeout_ms: 650,
            search_graph_direct_skip: true,
            concept_strength_min: 0.4,

            external_kb_enabled: false,
            external_kb_max_candidates: 5,
            external_kb_min_confidence: 0.45,
            external_kb_graph_weight: 0.15,
            external_kb_dbpedia_weight: 0.08,
            external_kb_orkg_weight: 0.10,

            odl_rescue_enabled: false,

            llm_model_lite: "gemini-2.0-flash-lite".to_string(),
            llm_model_flash: "gemini-2.5-flash".to_string(),
            llm_model_pro: "gemini-2.5-pro".to_string(),
            llm_model_version: "v1".to_string(),
            llm_explorer_qwen_pilot_enabled: false,
            llm_explorer_primary_provider: "qwen".to_string(),
            llm_explorer_primary_model: "qwen/qwen3-235b-a22b".to_string(),
            llm_explorer_fallback_provider: "gemini".to_string(),
            llm_explorer_rpm_cap: 35,
            llm_explorer_secondary_max_per_request: 1,
            llm_pro_fallback_enabled: false,
            llm_pro_fallback_max_per_request: 1,
            llm_quote_dynamic_count_enabled: false,
            llm_quote_dynamic_min: 2,
            llm_quote_dynamic_max: 5,
            gemini_api_key: None,
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            qwen_api_key: None,
            qwen_base_url: "https://integrate.api.nvidia.com".to_string(),

            l3_perf_rewrite_guard_enabled: false,
            l3_perf_context_budget_enabled: false,
            l3_perf_output_budget_enabled: false,
            l3_perf_expansion_tail_fix_enabled: false,
            l3_perf_supplementary_gate_enabled: false,
            l3_perf_max_output_tokens_standard: 650,

            embedding_url: "http://localhost:11434".to_string(),
            embedding_model: "embeddinggemma".to_string(),
            embedding_model_version: "v1".to_string(),
            embedding_dim: 768,

            chat_prompt_turns: 6,
            cache_l1_ttl_secs: 600,
            redis_url: None,
            search_log_diagnostics_persist_enabled: false,
            search_log_retention_cleanup_enabled: false,
            search_log_retention_days: 90,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env_str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Automatically loads a `.env` file from the working directory if present.
    pub fn from_env() -> Self {
        load_dotenv();
        Self::from_env_inner()
    }

    /// Internal loader that skips the `.env` pass (used by tests).
    pub fn from_env_inner() -> Self {
        let d = Self::default();
        Self {
            search_router_mode: env_str("SEARCH_ROUTER_MODE")
                .map(|v| RouterMode::parse(&v))
                .unwrap_or(d.search_router_mode),
            search_default_mode: env_str("SEARCH_DEFAULT_MODE")
                .map(|v| RetrievalMode::parse(&v))
                .unwrap_or(d.search_default_mode),
            retrieval_fusion_mode: env_str("RETRIEVAL_FUSION_MODE")
                .map(|v| FusionMode::parse(&v))
                .unwrap_or(d.retrieval_fusion_mode),
            search_mode_routing_enabled: env_bool("SEARCH_MODE_ROUTING_ENABLED", d.search_mode_routing_enabled),
            search_noise_guard_enabled: env_bool("SEARCH_NOISE_GUARD_ENABLED", d.search_noise_guard_enabled),
            search_typo_rescue_enabled: env_bool("SEARCH_TYPO_RESCUE_ENABLED", d.search_typo_rescue_enabled),
            search_lemma_seed_fallback_enabled: env_bool(
                "SEARCH_LEMMA_SEED_FALLBACK_ENABLED",
                d.search_lemma_seed_fallback_enabled,
            ),
            search_dynamic_single_token_semantic_cap_enabled: env_bool(
                "SEARCH_DYNAMIC_SINGLE_TOKEN_SEMANTIC_CAP_ENABLED",
                d.search_dynamic_single_token_semantic_cap_enabled,
            ),
            search_smart_semantic_tail_cap: env_usize(
                "SEARCH_SMART_SEMANTIC_TAIL_CAP",
                d.search_smart_semantic_tail_cap,
            )
            .max(1),
            search_semantic_expansion_max_variations: env_usize(
                "SEARCH_SEMANTIC_EXPANSION_MAX_VARIATIONS",
                d.search_semantic_expansion_max_variations,
            )
            .min(3),
            search_exact_min_rows: env_usize("SEARCH_EXACT_MIN_ROWS", d.search_exact_min_rows).clamp(1, 500),
            search_exact_single_token_enabled: env_bool(
                "SEARCH_EXACT_SINGLE_TOKEN_ENABLED",
                d.search_exact_single_token_enabled,
            ),

            search_compare_policy_enabled: env_bool(
                "SEARCH_COMPARE_POLICY_ENABLED",
                d.search_compare_policy_enabled,
            ),
            search_compare_target_max: env_usize("SEARCH_COMPARE_TARGET_MAX", d.search_compare_target_max).max(2),
            search_compare_primary_per_book: env_usize(
                "SEARCH_COMPARE_PRIMARY_PER_BOOK",
                d.search_compare_primary_per_book,
            )
            .max(1),
            search_compare_secondary_per_book: env_usize(
                "SEARCH_COMPARE_SECONDARY_PER_BOOK",
                d.search_compare_secondary_per_book,
            ),
            search_compare_timeout_ms: env_u64("SEARCH_COMPARE_TIMEOUT_MS", d.search_compare_timeout_ms).max(50),
            search_compare_secondary_max_ratio: env_f64(
                "SEARCH_COMPARE_SECONDARY_MAX_RATIO",
                d.search_compare_secondary_max_ratio,
            ),
            search_compare_canary_uids: env_str("SEARCH_COMPARE_CANARY_UIDS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(d.search_compare_canary_uids),

            search_graph_timeout_ms: env_u64("SEARCH_GRAPH_TIMEOUT_MS", d.search_graph_timeout_ms).max(50),
            search_graph_bridge_timeout_ms: env_u64(
                "SEARCH_GRAPH_BRIDGE_TIMEOUT_MS",
                d.search_graph_bridge_timeout_ms,
            )
            .max(50),
            search_graph_direct_skip: env_bool("SEARCH_GRAPH_DIRECT_SKIP", d.search_graph_direct_skip),
            concept_strength_min: env_f64("CONCEPT_STRENGTH_MIN", d.concept_strength_min),

            external_kb_enabled: env_bool("EXTERNAL_KB_ENABLED", d.external_kb_enabled),
            external_kb_max_candidates: env_usize("EXTERNAL_KB_MAX_CANDIDATES", d.external_kb_max_candidates)
                .clamp(1, 10),
            external_kb_min_confidence: env_f64("EXTERNAL_KB_MIN_CONFIDENCE", d.external_kb_min_confidence),
            external_kb_graph_weight: env_f64("EXTERNAL_KB_GRAPH_WEIGHT", d.external_kb_graph_weight),
            external_kb_dbpedia_weight: env_f64("EXTERNAL_KB_DBPEDIA_WEIGHT", d.external_kb_dbpedia_weight),
            external_kb_orkg_weight: env_f64("EXTERNAL_KB_ORKG_WEIGHT", d.external_kb_orkg_weight),

            odl_rescue_enabled: env_bool("ODL_RESCUE_ENABLED", d.odl_rescue_enabled),

            llm_model_lite: env_str("LLM_MODEL_LITE").unwrap_or(d.llm_model_lite),
            llm_model_flash: env_str("LLM_MODEL_FLASH").unwrap_or(d.llm_model_flash),
            llm_model_pro: env_str("LLM_MODEL_PRO").unwrap_or(d.llm_model_pro),
            llm_model_version: env_str("LLM_MODEL_VERSION").unwrap_or(d.llm_model_version),
            llm_explorer_qwen_pilot_enabled: env_bool(
                "LLM_EXPLORER_QWEN_PILOT_ENABLED",
                d.llm_explorer_qwen_pilot_enabled,
            ),
            llm_explorer_primary_provider: env_str("LLM_EXPLORER_PRIMARY_PROVIDER")
                .unwrap_or(d.llm_explorer_primary_provider),
            llm_explorer_primary_model: env_str("LLM_EXPLORER_PRIMARY_MODEL").unwrap_or(d.llm_explorer_primary_model),
            llm_explorer_fallback_provider: env_str("LLM_EXPLORER_FALLBACK_PROVIDER")
                .unwrap_or(d.llm_explorer_fallback_provider),
            llm_explorer_rpm_cap: env_usize("LLM_EXPLORER_RPM_CAP", d.llm_explorer_rpm_cap),
            llm_explorer_secondary_max_per_request: env_u32(
                "LLM_EXPLORER_SECONDARY_MAX_PER_REQUEST",
                d.llm_explorer_secondary_max_per_request,
            ),
            llm_pro_fallback_enabled: env_bool("LLM_PRO_FALLBACK_ENABLED", d.llm_pro_fallback_enabled),
            llm_pro_fallback_max_per_request: env_u32(
                "LLM_PRO_FALLBACK_MAX_PER_REQUEST",
                d.llm_pro_fallback_max_per_request,
            ),
            llm_quote_dynamic_count_enabled: env_bool(
                "LLM_QUOTE_DYNAMIC_COUNT_ENABLED",
                d.llm_quote_dynamic_count_enabled,
            ),
            llm_quote_dynamic_min: env_usize("LLM_QUOTE_DYNAMIC_MIN", d.llm_quote_dynamic_min).max(1),
            llm_quote_dynamic_max: env_usize("LLM_QUOTE_DYNAMIC_MAX", d.llm_quote_dynamic_max).max(1),
            gemini_api_key: env_str("GEMINI_API_KEY"),
            gemini_base_url: env_str("GEMINI_BASE_URL").unwrap_or(d.gemini_base_url),
            qwen_api_key: env_str("QWEN_API_KEY"),
            qwen_base_url: env_str("QWEN_BASE_URL").unwrap_or(d.qwen_base_url),

            l3_perf_rewrite_guard_enabled: env_bool("L3_PERF_REWRITE_GUARD_ENABLED", d.l3_perf_rewrite_guard_enabled),
            l3_perf_context_budget_enabled: env_bool(
                "L3_PERF_CONTEXT_BUDGET_ENABLED",
                d.l3_perf_context_budget_enabled,
            ),
            l3_perf_output_budget_enabled: env_bool("L3_PERF_OUTPUT_BUDGET_ENABLED", d.l3_perf_output_budget_enabled),
            l3_perf_expansion_tail_fix_enabled: env_bool(
                "L3_PERF_EXPANSION_TAIL_FIX_ENABLED",
                d.l3_perf_expansion_tail_fix_enabled,
            ),
            l3_perf_supplementary_gate_enabled: env_bool(
                "L3_PERF_SUPPLEMENTARY_GATE_ENABLED",
                d.l3_perf_supplementary_gate_enabled,
            ),
            l3_perf_max_output_tokens_standard: env_u32(
                "L3_PERF_MAX_OUTPUT_TOKENS_STANDARD",
                d.l3_perf_max_output_tokens_standard,
            )
            .max(128),

            embedding_url: env_str("EMBEDDING_URL").unwrap_or(d.embedding_url),
            embedding_model: env_str("EMBEDDING_MODEL").unwrap_or(d.embedding_model),
            embedding_model_version: env_str("EMBEDDING_MODEL_VERSION").unwrap_or(d.embedding_model_version),
            embedding_dim: env_usize("EMBEDDING_DIM", d.embedding_dim),

            chat_prompt_turns: env_usize("CHAT_PROMPT_TURNS", d.chat_prompt_turns).max(1),
            cache_l1_ttl_secs: env_u64("CACHE_L1_TTL", d.cache_l1_ttl_secs).max(1),
            redis_url: env_str("REDIS_URL"),
            search_log_diagnostics_persist_enabled: env_bool(
                "SEARCH_LOG_DIAGNOSTICS_PERSIST_ENABLED",
                d.search_log_diagnostics_persist_enabled,
            ),
            search_log_retention_cleanup_enabled: env_bool(
                "SEARCH_LOG_RETENTION_CLEANUP_ENABLED",
                d.search_log_retention_cleanup_enabled,
            ),
            search_log_retention_days: env_u32("SEARCH_LOG_RETENTION_DAYS", d.search_log_retention_days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.search_router_mode, RouterMode::RuleBased);
        assert_eq!(settings.retrieval_fusion_mode, FusionMode::Concat);
        assert_eq!(settings.search_smart_semantic_tail_cap, 6);
        assert_eq!(settings.search_compare_timeout_ms, 2500);
        assert_eq!(settings.search_graph_timeout_ms, 120);
        assert_eq!(settings.llm_explorer_rpm_cap, 35);
        assert_eq!(settings.l3_perf_max_output_tokens_standard, 650);
        assert_eq!(settings.embedding_dim, 768);
        assert!(settings.gemini_api_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        unsafe {
            env::set_var("SEARCH_ROUTER_MODE", "static");
            env::set_var("RETRIEVAL_FUSION_MODE", "rrf");
            env::set_var("SEARCH_SEMANTIC_EXPANSION_MAX_VARIATIONS", "9");
            env::set_var("SEARCH_COMPARE_CANARY_UIDS", "u1, u2,");
            env::set_var("SEARCH_EXACT_MIN_ROWS", "9000");
        }

        let settings = Settings::from_env_inner();
        assert_eq!(settings.search_router_mode, RouterMode::Static);
        assert_eq!(settings.retrieval_fusion_mode, FusionMode::Rrf);
        // Clamped to the 0..=3 range.
        assert_eq!(settings.search_semantic_expansion_max_variations, 3);
        assert!(settings.search_compare_canary_uids.contains("u1"));
        assert!(settings.search_compare_canary_uids.contains("u2"));
        assert_eq!(settings.search_compare_canary_uids.len(), 2);
        assert_eq!(settings.search_exact_min_rows, 500);

        unsafe {
            env::remove_var("SEARCH_ROUTER_MODE");
            env::remove_var("RETRIEVAL_FUSION_MODE");
            env::remove_var("SEARCH_SEMANTIC_EXPANSION_MAX_VARIATIONS");
            env::remove_var("SEARCH_COMPARE_CANARY_UIDS");
            env::remove_var("SEARCH_EXACT_MIN_ROWS");
        }
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        unsafe {
            env::set_var("SEARCH_GRAPH_TIMEOUT_MS", "not-a-number");
        }
        let settings = Settings::from_env_inner();
        assert_eq!(settings.search_graph_timeout_ms, 120);
        unsafe {
            env::remove_var("SEARCH_GRAPH_TIMEOUT_MS");
        }
    }
}
