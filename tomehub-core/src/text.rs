//! Turkish-aware text normalization used across retrieval.
//!
//! Matching always runs over a de-accented, lowercased, alphanumeric-only
//! rendition of the text so that `kufur` finds `küfür` while word boundaries
//! stay intact (`niyet` must not match inside `medeniyet`).

use std::collections::HashSet;
use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// Common Turkish connectors / stop lemmas that should not drive recall.
pub fn stop_lemmas() -> &'static HashSet<&'static str> {
    static STOP: OnceLock<HashSet<&'static str>> = OnceLock::new();
    STOP.get_or_init(|| {
        [
            "ve", "veya", "ile", "ama", "fakat", "ancak", "lakin", "ki", "de", "da", "gibi",
            "icin", "gore", "kadar", "hem", "ya", "yada", "yahut", "mi", "mu",
        ]
        .into_iter()
        .collect()
    })
}

/// Suffixes stripped by the lightweight Turkish stemmer, longest first.
const TURKISH_SUFFIXES: &[&str] = &[
    "nın", "nin", "nun", "nün", "dan", "den", "tan", "ten", "lar", "ler", "sız", "siz", "suz",
    "süz", "dır", "dir", "dur", "dür", "tır", "tir", "tur", "tür", "ın", "in", "un", "ün", "yı",
    "yi", "yu", "yü", "ya", "ye", "da", "de", "ta", "te", "lı", "li", "lu", "lü", "ı", "i", "u",
    "ü", "a", "e",
];

/// Fold Turkish letters to their ASCII counterparts (both cases).
pub fn deaccent(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ç' | 'Ç' => 'c',
            'ğ' | 'Ğ' => 'g',
            'ı' | 'İ' => 'i',
            'ö' | 'Ö' => 'o',
            'ş' | 'Ş' => 's',
            'ü' | 'Ü' => 'u',
            _ => c,
        })
        .collect::<String>()
        .to_lowercase()
}

/// Repair frequent OCR / double-encoding corruptions before matching.
///
/// Handles the usual UTF-8-read-as-Latin-1 sequences plus digit-for-letter
/// substitutions inside words (`dagas1` style extractions).
pub fn repair_common_mojibake(text: &str) -> String {
    const SEQUENCES: &[(&str, &str)] = &[
        ("Ã§", "ç"),
        ("Ã‡", "Ç"),
        ("ÄŸ", "ğ"),
        ("Äž", "Ğ"),
        ("Ä±", "ı"),
        ("Ä°", "İ"),
        ("Ã¶", "ö"),
        ("Ã–", "Ö"),
        ("ÅŸ", "ş"),
        ("Åž", "Ş"),
        ("Ã¼", "ü"),
        ("Ãœ", "Ü"),
    ];
    let mut out = text.to_string();
    for (broken, fixed) in SEQUENCES {
        if out.contains(broken) {
            out = out.replace(broken, fixed);
        }
    }

    // Digit-for-letter OCR substitutions only apply inside alphabetic words.
    let chars: Vec<char> = out.chars().collect();
    let mut repaired = String::with_capacity(out.len());
    for (idx, &c) in chars.iter().enumerate() {
        let prev_alpha = idx > 0 && chars[idx - 1].is_alphabetic();
        let next_digit = chars.get(idx + 1).is_some_and(|n| n.is_ascii_digit());
        match c {
            '1' if prev_alpha && !next_digit => repaired.push('ı'),
            '0' if prev_alpha && !next_digit => repaired.push('o'),
            _ => repaired.push(c),
        }
    }
    repaired
}

/// Normalize text for boundary matching: mojibake repair, de-accent,
/// lowercase, keep only `[a-z0-9]` tokens separated by single spaces.
pub fn normalize_match_text(text: &str) -> String {
    let folded = deaccent(&repair_common_mojibake(text));
    let mut out = String::with_capacity(folded.len());
    let mut last_space = true;
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Whether `haystack` contains `needle` as a whole token sequence.
///
/// `niyet` matches `niyet` but not `medeniyet`.
pub fn contains_exact_term_boundary(haystack: &str, needle: &str) -> bool {
    let haystack = normalize_match_text(haystack);
    let needle = normalize_match_text(needle);
    if haystack.is_empty() || needle.is_empty() {
        return false;
    }
    let padded = format!(" {} ", haystack);
    padded.contains(&format!(" {} ", needle))
}

/// Whether any token of `haystack` starts with the lemma stem.
///
/// Admits inflections (`niyet` -> `niyetli`, `niyetler`) but rejects
/// inner-word matches (`medeniyet` does not contain the stem `niyet`).
pub fn contains_lemma_stem_boundary(haystack: &str, stem: &str) -> bool {
    let haystack = normalize_match_text(haystack);
    let stem = normalize_match_text(stem);
    if haystack.is_empty() || stem.len() < 3 {
        return false;
    }
    if stem.contains(' ') {
        return contains_exact_term_boundary(&haystack, &stem);
    }
    haystack.split_whitespace().any(|tok| tok.starts_with(&stem))
}

/// Count stem-boundary occurrences for a set of lemmas.
pub fn count_lemma_stem_hits(haystack: &str, stems: &[String]) -> usize {
    let haystack = normalize_match_text(haystack);
    if haystack.is_empty() {
        return 0;
    }
    let tokens: Vec<&str> = haystack.split_whitespace().collect();
    let mut total = 0;
    for stem in stems {
        let stem = normalize_match_text(stem);
        if stem.len() < 3 || stem.contains(' ') {
            continue;
        }
        total += tokens.iter().filter(|tok| tok.starts_with(&stem)).count();
    }
    total
}

/// True when `needle` appears only inside a longer token of `haystack`.
pub fn contains_inner_substring_only(haystack: &str, needle: &str) -> bool {
    let h = normalize_match_text(haystack);
    let n = normalize_match_text(needle);
    if h.is_empty() || n.is_empty() || !h.contains(&n) {
        return false;
    }
    !contains_lemma_stem_boundary(haystack, needle)
}

/// Strip one common Turkish suffix (longest first) from an inflected word.
pub fn turkish_stem(word: &str) -> String {
    let lowered = lowercase_turkish(word);
    if lowered.chars().count() < 4 {
        return lowered;
    }
    for suffix in TURKISH_SUFFIXES {
        let suffix_len = suffix.chars().count();
        let word_len = lowered.chars().count();
        if word_len > suffix_len + 2 && lowered.ends_with(suffix) {
            let keep = word_len - suffix_len;
            return lowered.chars().take(keep).collect();
        }
    }
    lowered
}

fn lowercase_turkish(word: &str) -> String {
    word.chars()
        .map(|c| match c {
            'İ' => 'i',
            'I' => 'ı',
            _ => c,
        })
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Tokenize a query and reduce each token to its lemma, preserving order.
pub fn get_lemmas(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|tok| !tok.is_empty())
        .map(turkish_stem)
        .collect()
}

/// Drop stop lemmas and sub-2-char stems from a lemma list.
pub fn filter_query_lemmas(lemmas: &[String]) -> Vec<String> {
    lemmas
        .iter()
        .filter(|lemma| {
            let norm = deaccent(lemma.trim());
            norm.len() >= 2 && !stop_lemmas().contains(norm.as_str())
        })
        .cloned()
        .collect()
}

/// Whitespace token count of a query.
pub fn token_count(query: &str) -> usize {
    query.split_whitespace().filter(|t| !t.trim().is_empty()).count()
}

/// Canonical content hash: CRLF -> LF, trim, collapse whitespace, SHA-256 hex.
pub fn content_hash(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    let collapsed = unified.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(collapsed.trim().as_bytes());
    hex::encode(hasher.finalize())
}
