//! Analytic question handling: "how many times does X occur" detection,
//! target-term extraction, and book-id resolution from free-form questions.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use tomehub_core::text::{deaccent, normalize_match_text, repair_common_mojibake};
use tomehub_db::models::BookRef;

const ANALYTIC_PATTERNS: &[&str] = &[
    r"ka[cç]\s+(kez|kere|defa)\s+ge[cç]",
    r"ka[cç]\s+(kez|kere|defa)\s+(kullanil|yazil|tekrar)",
    r"toplam\s+ka[cç]\s+(kez|kere|defa)",
    r"how\s+many\s+times",
];

fn analytic_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        ANALYTIC_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("analytic pattern"))
            .collect()
    })
}

/// Whether the question asks for a deterministic word count.
pub fn is_analytic_word_count(question: &str) -> bool {
    if question.trim().is_empty() {
        return false;
    }
    let lowered = question.to_lowercase();
    if analytic_regexes().iter().any(|p| p.is_match(&lowered)) {
        return true;
    }
    let folded = deaccent(question);
    if analytic_regexes().iter().any(|p| p.is_match(&folded)) {
        return true;
    }
    // Mojibake variants where "ç" arrived as "?" or the replacement char.
    let repaired = deaccent(&repair_common_mojibake(
        &question.replace('\u{fffd}', "c").replace('?', "c"),
    ));
    analytic_regexes().iter().any(|p| p.is_match(&repaired))
}

/// Extract the term whose occurrences should be counted.
pub fn extract_target_term(question: &str) -> Option<String> {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    let mention = MENTION.get_or_init(|| Regex::new(r"@(\w+)").expect("mention pattern"));
    if let Some(caps) = mention.captures(question) {
        let term = caps[1].trim().to_string();
        if !term.is_empty() {
            return Some(term);
        }
    }

    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED.get_or_init(|| Regex::new("[\"'«]([^\"'»]+)[\"'»]").expect("quote pattern"));
    if let Some(caps) = quoted.captures(question) {
        let term = caps[1].trim().to_string();
        if !term.is_empty() {
            return Some(term);
        }
    }

    static TERM_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = TERM_PATTERNS.get_or_init(|| {
        [
            r"(?P<term>\w+)\s+kelimesi",
            r"(?P<term>\w+)\s+sozcugu",
            r"(?P<term>\w+)\s+kavrami\s+ka[c]",
            r"kelime\s+(?P<term>\w+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("term pattern"))
        .collect()
    });
    let folded = deaccent(question);
    for pattern in patterns.iter() {
        if let Some(caps) = pattern.captures(&folded) {
            let term = caps["term"].trim().to_string();
            if !term.is_empty() {
                return Some(term);
            }
        }
    }
    None
}

/// Candidate spellings used for both counting and KWIC extraction.
pub fn term_candidates(term: &str) -> Vec<String> {
    let mut out = Vec::new();
    let lemma = tomehub_core::text::turkish_stem(term);
    if !lemma.is_empty() {
        out.push(lemma);
    }
    let folded = deaccent(term);
    if !folded.is_empty() && !out.contains(&folded) {
        out.push(folded);
    }
    let normalized = normalize_match_text(term);
    if !normalized.is_empty() && !out.contains(&normalized) {
        out.push(normalized);
    }
    out
}

fn title_variants(title: &str) -> Vec<String> {
    let mut variants = vec![title.to_string()];
    if let Some((left, right)) = title.split_once(" - ") {
        variants.push(left.trim().to_string());
        variants.push(right.trim().to_string());
    }
    // Strip parenthesised qualifiers.
    static PARENS: OnceLock<Regex> = OnceLock::new();
    let parens = PARENS.get_or_init(|| Regex::new(r"\(.*?\)").expect("parens pattern"));
    let stripped = parens.replace_all(title, " ").trim().to_string();
    if !stripped.is_empty() && !variants.contains(&stripped) {
        variants.push(stripped);
    }
    variants
}

fn score_title_against_query(variants: &[String], q_norm: &str) -> u32 {
    let mut best = 0u32;
    for variant in variants {
        let v_norm = normalize_match_text(variant);
        if v_norm.len() < 4 {
            continue;
        }
        if q_norm.contains(&v_norm) {
            best = best.max(100);
            continue;
        }
        // Token coverage: every title token (len >= 3) appears in the query.
        let tokens: Vec<&str> = v_norm.split_whitespace().filter(|t| t.len() >= 3).collect();
        if !tokens.is_empty() && tokens.iter().all(|t| q_norm.contains(t)) {
            best = best.max(90);
        }
    }
    best
}

/// Return every distinct book id whose title appears in the question.
///
/// Comparison queries reference multiple books, so all qualifying matches
/// come back (best first), not just the single best.
pub fn resolve_book_ids_from_question(catalog: &[BookRef], question: &str, max_results: usize) -> Vec<String> {
    let q_norm = normalize_match_text(question);
    if q_norm.is_empty() {
        return Vec::new();
    }

    let mut titles_by_book: HashMap<&str, Vec<String>> = HashMap::new();
    for book in catalog {
        if book.item_id.trim().is_empty() || book.title.trim().is_empty() {
            continue;
        }
        titles_by_book
            .entry(book.item_id.as_str())
            .or_default()
            .extend(title_variants(&book.title));
    }

    let mut scored: Vec<(String, u32)> = titles_by_book
        .into_iter()
        .filter_map(|(book_id, variants)| {
            let score = score_title_against_query(&variants, &q_norm);
            (score > 0).then(|| (book_id.to_string(), score))
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let exact_like: Vec<(String, u32)> = scored.iter().filter(|(_, s)| *s >= 97).cloned().collect();
    if exact_like.len() >= 2 {
        scored = exact_like;
    }
    scored.into_iter().take(max_results).map(|(id, _)| id).collect()
}
