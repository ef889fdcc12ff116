//! Rule-based lightweight router.
//!
//! Decides which retrieval buckets should run for a query: exact, lemma,
//! semantic. Direct-lookup queries stay lexical; conceptual questions get a
//! semantic-dominant plan; everything else runs balanced.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use tomehub_core::RetrievalMode;

use crate::types::Intent;

#[derive(Debug, Clone)]
pub struct RouterDecision {
    pub selected_buckets: Vec<String>,
    pub reason: String,
    pub retrieval_mode: RetrievalMode,
}

/// Per-strategy run flags derived from the selected buckets.
#[derive(Debug, Clone, Copy)]
pub struct StrategyFlags {
    pub run_exact: bool,
    pub run_lemma: bool,
    pub run_semantic: bool,
}

pub fn to_strategy_flags(buckets: &[String]) -> StrategyFlags {
    StrategyFlags {
        run_exact: buckets.iter().any(|b| b == "exact"),
        run_lemma: buckets.iter().any(|b| b == "lemma"),
        run_semantic: buckets.iter().any(|b| b == "semantic"),
    }
}

fn direct_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"\bhangi sayfa\b", "hangi_sayfa"),
            (r"\bkitab(?:i|ın|in) ad[ıi]\b", "kitap_adi"),
            (r"\bkim (dedi|s[öo]yledi)\b", "kim_dedi"),
            (r"\btam al[ıi]nt[ıi]\b", "tam_alinti"),
            ("\"[^\"]+\"", "quoted_phrase"),
        ]
        .into_iter()
        .map(|(pattern, name)| (Regex::new(pattern).expect("router pattern"), name))
        .collect()
    })
}

fn conceptual_hints() -> &'static HashSet<&'static str> {
    static HINTS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    HINTS.get_or_init(|| {
        [
            "nedir", "neden", "nasil", "anlami", "kavram", "kavramsal", "etik", "ahlak",
            "felsefe", "adalet", "vicdan", "ozgurluk",
        ]
        .into_iter()
        .collect()
    })
}

#[derive(Debug, Default)]
pub struct SemanticRouter;

impl SemanticRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn buckets_for_mode(mode: RetrievalMode) -> Vec<String> {
        let buckets: &[&str] = match mode {
            RetrievalMode::FastExact => &["exact", "lemma"],
            RetrievalMode::SemanticFocus => &["lemma", "semantic", "exact"],
            RetrievalMode::Balanced => &["exact", "lemma", "semantic"],
        };
        buckets.iter().map(|b| b.to_string()).collect()
    }

    pub fn route(&self, query: &str, intent: Intent, default_mode: RetrievalMode) -> RouterDecision {
        let q = query.trim().to_lowercase();
        // Tokenize by words (strip punctuation) so conceptual hints still
        // match: "nedir?" -> "nedir".
        let tokens: Vec<String> = q
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(tomehub_core::text::deaccent)
            .collect();
        let token_set: HashSet<&str> = tokens.iter().map(String::as_str).collect();

        // Intent-led fast path.
        if intent.is_direct_like() {
            let mode = RetrievalMode::FastExact;
            return RouterDecision {
                selected_buckets: Self::buckets_for_mode(mode),
                reason: format!("intent={}", intent.as_str()),
                retrieval_mode: mode,
            };
        }

        // Pattern-led direct lookup style.
        for (pattern, name) in direct_patterns() {
            if pattern.is_match(&q) {
                let mode = RetrievalMode::FastExact;
                return RouterDecision {
                    selected_buckets: Self::buckets_for_mode(mode),
                    reason: format!("pattern:{name}"),
                    retrieval_mode: mode,
                };
            }
        }

        // Conceptual question: semantic should dominate but keep lexical safety.
        if tokens.len() > 1 && conceptual_hints().iter().any(|hint| token_set.contains(hint)) {
            let mode = RetrievalMode::SemanticFocus;
            return RouterDecision {
                selected_buckets: Self::buckets_for_mode(mode),
                reason: "conceptual_hint".to_string(),
                retrieval_mode: mode,
            };
        }

        // Very short queries still need semantic coverage so the mix policy
        // can show an epistemic tail after direct matches.
        if tokens.len() <= 2 {
            let mode = RetrievalMode::Balanced;
            return RouterDecision {
                selected_buckets: Self::buckets_for_mode(mode),
                reason: "short_query".to_string(),
                retrieval_mode: mode,
            };
        }

        RouterDecision {
            selected_buckets: Self::buckets_for_mode(default_mode),
            reason: "default_balanced".to_string(),
            retrieval_mode: default_mode,
        }
    }
}
