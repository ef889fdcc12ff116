//! Epistemic control layer.
//!
//! Classifies evidence into confidence tiers so answer generation knows what
//! it may quote verbatim and what it must synthesise around:
//! - Level A: exact keyword + definitional/evaluative statement;
//! - Level B: exact keyword in a contextual reference;
//! - Level C: conceptual match only.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use tomehub_core::text::deaccent;
use tomehub_db::models::ChunkHit;
use tomehub_search::types::Intent;

/// Turkish stop words filtered out of keyword extraction (de-accented).
fn turkish_stop_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        [
            "ve", "veya", "ile", "ama", "fakat", "ancak", "lakin", "ki", "de", "da", "mi", "mu",
            "bir", "bu", "su", "o", "ben", "sen", "biz", "siz", "onlar", "gibi", "icin", "diye",
            "en", "daha", "cok", "her", "hangi", "ne", "kim", "bunu", "sunu", "boyle", "soyle",
            "nasil", "neden", "nicin", "niye", "kadar", "arasinda", "uzerinde", "altinda",
            "icinde", "disinda", "once", "sonra", "sey", "seyi", "seyin", "olan", "olarak",
            "oldugu", "oldugunu", "degil", "var", "yok", "ise", "eger", "bile", "sadece",
            "yalnizca", "hep", "hic", "artik", "henuz", "zaten",
        ]
        .into_iter()
        .collect()
    })
}

/// Definitional pattern templates; `{kw}` is replaced by the escaped keyword.
const DEFINITIONAL_TEMPLATES: &[&str] = &[
    r"\b{kw}\s+(nedir|ne demek|ne anlama gelir)",
    r"\b{kw},?\s+.{5,50}(demektir|anlamina gelir|ifade eder)",
    r"\b{kw}'?(in|un)\s+tanimi",
    r"\b{kw}'?(in|un)\s+anlami",
    r"\b{kw}(dir|dur|tir|tur)[.,\s]",
    r"\b{kw}\s+olarak\s+(tanimlan|degerlendiril|kabul edil)",
    r"\b{kw}\s+(sudur|budur|odur)",
    r"(^|\.\s*){kw},\s+",
    r"o\s+da\s+{kw}",
    r"\b{kw}\s+ise\s+",
    r"adi\s+{kw}",
    r"\b{kw}\s+is\s+(defined|characterized|understood)\s+as",
    r"\b{kw}\s+means\s+",
    r"\b{kw}\s+refers\s+to",
    r"the\s+definition\s+of\s+{kw}",
];

const THEORY_PATTERNS: &[&str] = &[
    r"iki\s+teori",
    r"iki\s+gorus",
    r"birincisi.*ikincisi",
    r"bir\s+yandan.*diger\s+yandan",
    r"yaklasim\s+var",
    r"teori\s+var",
];

const EVALUATIVE_PATTERNS: &[&str] = &[
    r"(degismez|sabit|kalici|gecici|degisken)",
    r"(olumlu|olumsuz|iyi|kotu|dogru|yanlis)",
    r"(onemli|gerekli|zorunlu|sart)",
    r"(temel|esas|asil|birincil)",
    r"(kesinlikle|mutlaka|asla|hicbir zaman)",
];

const MODALITY_PATTERNS: &[&str] = &[
    r"\b(bence|kanaatimce|dusunuyorum|sanirim|galiba)\b",
    r"\b(bana gore|kendi gorusum|sahsi fikrim)\b",
    r"\b(inaniyorum|goruyorum ki|anladigim kadariyla)\b",
    r"(^|\s)(benim|ben)\s+",
];

fn theory_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| THEORY_PATTERNS.iter().map(|p| Regex::new(p).expect("theory pattern")).collect())
}

fn evaluative_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES
        .get_or_init(|| EVALUATIVE_PATTERNS.iter().map(|p| Regex::new(p).expect("evaluative pattern")).collect())
}

fn modality_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| MODALITY_PATTERNS.iter().map(|p| Regex::new(p).expect("modality pattern")).collect())
}

/// Tiered confidence tag on a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpistemicLevel {
    A,
    B,
    C,
}

impl EpistemicLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feature {
    KeywordMatch,
    Definitional,
    Theory,
    Modality,
    PersonalComment,
    Evaluative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Complexity {
    Low,
    High,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerMode {
    Quote,
    Hybrid,
    Synthesis,
    Analytic,
}

impl AnswerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "QUOTE",
            Self::Hybrid => "HYBRID",
            Self::Synthesis => "SYNTHESIS",
            Self::Analytic => "ANALYTIC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassageType {
    Definition,
    Theory,
    Situational,
}

impl PassageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Definition => "DEFINITION",
            Self::Theory => "THEORY",
            Self::Situational => "SITUATIONAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quotability {
    High,
    Medium,
    Low,
}

impl Quotability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

/// Diagnostic annotation the assembler attaches beside each chunk.
/// Never persisted; the chunk itself stays immutable retrieval output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpistemicAnnotation {
    pub answerability_score: f64,
    pub features: Vec<Feature>,
    pub level: EpistemicLevel,
    pub passage_type: PassageType,
    pub quotability: Quotability,
    pub graph_score: Option<f64>,
    pub external_weight: Option<f64>,
    pub compare_primary: bool,
    pub compare_secondary: bool,
    pub compare_book_id: Option<String>,
}

impl Default for EpistemicAnnotation {
    fn default() -> Self {
        Self {
            answerability_score: 0.0,
            features: Vec::new(),
            level: EpistemicLevel::C,
            passage_type: PassageType::Situational,
            quotability: Quotability::Medium,
            graph_score: None,
            external_weight: None,
            compare_primary: false,
            compare_secondary: false,
            compare_book_id: None,
        }
    }
}

/// A retrieved chunk plus its in-memory diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedChunk {
    pub hit: ChunkHit,
    pub annotation: EpistemicAnnotation,
}

/// Fast semantic passage classifier collaborator.
pub trait PassageClassifier: Send + Sync {
    fn classify(&self, passage: &str) -> (PassageType, Quotability);
}

/// Regex-backed default: definitional structures quote well, theory passages
/// are usable, everything else is situational.
pub struct FastPassageClassifier;

impl PassageClassifier for FastPassageClassifier {
    fn classify(&self, passage: &str) -> (PassageType, Quotability) {
        let norm = deaccent(passage);
        static DEFINITIONAL_SHAPE: OnceLock<Regex> = OnceLock::new();
        let definitional = DEFINITIONAL_SHAPE.get_or_init(|| {
            Regex::new(r"(nedir|demektir|anlamina gelir|ifade eder|tanimi|is defined as|refers to)")
                .expect("definitional shape pattern")
        });
        if definitional.is_match(&norm) {
            return (PassageType::Definition, Quotability::High);
        }
        if theory_regexes().iter().any(|p| p.is_match(&norm)) {
            return (PassageType::Theory, Quotability::High);
        }
        (PassageType::Situational, Quotability::Medium)
    }
}

/// Extract the core concept(s) from a user question.
pub fn extract_core_concepts(question: &str) -> Vec<String> {
    let cleaned = deaccent(question);
    let words: Vec<String> = cleaned
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();

    let keywords: Vec<String> = words
        .iter()
        .filter(|w| w.len() > 2 && !turkish_stop_words().contains(w.as_str()))
        .cloned()
        .collect();

    // Nothing left (e.g. "bu nedir"): keep the longest word.
    if keywords.is_empty() {
        return words
            .into_iter()
            .max_by_key(|w| w.len())
            .map(|w| vec![w])
            .unwrap_or_default();
    }
    keywords
}

/// Classify the user's intent plus a complexity flag for HYBRID gating.
pub fn classify_question_intent(question: &str) -> (Intent, Complexity) {
    let q = deaccent(question);

    const COMPLEX_PATTERNS: &[&str] = &[
        r"degisen.*midir",
        r"degisir.*mi",
        r"sabit.*mi",
        r"mumkun.*mu",
        r"olabilir.*mi",
        r"nasil.*aciklanir",
        r"nasil.*anlasilir",
        r"iliskisi.*nedir",
        r"baglantisi.*ne",
        r"felsef",
        r"ahlak",
        r"etik",
        r"vicdan",
        r"iki.*gorus",
        r"farkli.*yaklasim",
    ];
    static COMPLEX: OnceLock<Vec<Regex>> = OnceLock::new();
    let complex = COMPLEX.get_or_init(|| {
        COMPLEX_PATTERNS.iter().map(|p| Regex::new(p).expect("complexity pattern")).collect::<Vec<_>>()
    });
    let complexity = if complex.iter().any(|p| p.is_match(&q)) {
        Complexity::High
    } else {
        Complexity::Low
    };

    const DIRECT_PATTERNS: &[&str] = &[
        r"nedir\??$",
        r"kimdir\??$",
        r"ne demek",
        r"anlami ne",
        r"kac tane",
        r"hangi",
        r"nerede",
        r"ne zaman",
        r"tarih",
        r"midir\??$",
        r"mudur\??$",
        r"\bmi\??$",
        r"\bmu\??$",
        r"misin",
        r"musun",
    ];
    static DIRECT: OnceLock<Vec<Regex>> = OnceLock::new();
    let direct = DIRECT.get_or_init(|| {
        DIRECT_PATTERNS.iter().map(|p| Regex::new(p).expect("direct pattern")).collect::<Vec<_>>()
    });
    if direct.iter().any(|p| p.is_match(&q)) {
        return (Intent::Direct, complexity);
    }

    const COMPARE_PATTERNS: &[&str] = &[
        r"farki",
        r"benzerligi",
        r"iliskisi",
        r"arasindaki",
        r"farklar",
        r"ortak yon",
        r"karsilastir",
    ];
    static COMPARE: OnceLock<Vec<Regex>> = OnceLock::new();
    let compare = COMPARE.get_or_init(|| {
        COMPARE_PATTERNS.iter().map(|p| Regex::new(p).expect("compare pattern")).collect::<Vec<_>>()
    });
    if compare.iter().any(|p| p.is_match(&q)) {
        return (Intent::Comparative, complexity);
    }

    (Intent::Synthesis, complexity)
}

fn contains_keyword(text: &str, keyword: &str) -> bool {
    // Substring match over the folded text catches agglutinative forms:
    // "vicdan" matches "vicdandir", "vicdanin", "vicdanli".
    deaccent(text).contains(&deaccent(keyword))
}

fn is_definitional(text: &str, keyword: &str) -> bool {
    let norm_text = deaccent(text);
    let norm_keyword = deaccent(keyword);
    let escaped = regex::escape(&norm_keyword);

    for template in DEFINITIONAL_TEMPLATES {
        let pattern = template.replace("{kw}", &escaped);
        if Regex::new(&pattern).map(|re| re.is_match(&norm_text)).unwrap_or(false) {
            return true;
        }
    }

    // Keyword near an evaluative phrase (within a 50-char window).
    if let Some(pos) = norm_text.find(&norm_keyword) {
        let start = norm_text[..pos]
            .char_indices()
            .rev()
            .take(50)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(pos);
        let end_target = pos + norm_keyword.len() + 50;
        let end = norm_text
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= end_target)
            .unwrap_or(norm_text.len());
        let window = &norm_text[start..end];
        if evaluative_regexes().iter().any(|p| p.is_match(window)) {
            return true;
        }
    }

    // "Keyword, ..." at sentence start with substantial content.
    for sentence in norm_text.split(['.', '!', '?']) {
        let sentence = sentence.trim();
        if (sentence.starts_with(&format!("{norm_keyword},")) || sentence.starts_with(&format!("{norm_keyword} ")))
            && sentence.len() > norm_keyword.len() + 10
        {
            return true;
        }
    }

    false
}

/// Answerability scoring: 0..7 sum of evidence features.
pub fn score_answerability(hit: &ChunkHit, keywords: &[String]) -> (f64, Vec<Feature>) {
    let mut score = 0.0;
    let mut features = Vec::new();

    let personal_comment = hit.comment.as_deref().unwrap_or("");
    let full_text = format!("{} {}", hit.text, personal_comment);
    let norm_full = deaccent(&full_text);

    let has_keyword = keywords.iter().any(|kw| contains_keyword(&full_text, kw));
    if has_keyword {
        score += 1.0;
        features.push(Feature::KeywordMatch);

        // Definitional weight only applies when the keyword is present.
        if keywords.iter().any(|kw| is_definitional(&full_text, kw)) {
            score += 3.0;
            features.push(Feature::Definitional);
        }

        if theory_regexes().iter().any(|p| p.is_match(&norm_full)) {
            score += 1.0;
            features.push(Feature::Theory);
        }
    }

    if modality_regexes().iter().any(|p| p.is_match(&norm_full)) {
        score += 1.0;
        features.push(Feature::Modality);
    }

    if personal_comment.chars().count() > 5 {
        score += 1.0;
        features.push(Feature::PersonalComment);
    }

    if evaluative_regexes().iter().any(|p| p.is_match(&norm_full)) {
        score += 1.0;
        features.push(Feature::Evaluative);
    }

    (score, features)
}

/// Classify a chunk into Level A/B/C and attach the annotation.
pub fn classify_chunk(
    keywords: &[String],
    hit: &ChunkHit,
    classifier: &dyn PassageClassifier,
) -> EpistemicAnnotation {
    let (score, features) = score_answerability(hit, keywords);
    let (passage_type, quotability) = classifier.classify(&hit.text);

    let is_priority = score >= 3.0
        || features.contains(&Feature::Definitional)
        || features.contains(&Feature::Theory)
        || matches!(passage_type, PassageType::Definition | PassageType::Theory)
        || quotability == Quotability::High;

    let level = if is_priority {
        EpistemicLevel::A
    } else if score >= 1.0 {
        EpistemicLevel::B
    } else {
        EpistemicLevel::C
    };

    EpistemicAnnotation {
        answerability_score: score,
        features,
        level,
        passage_type,
        quotability,
        ..EpistemicAnnotation::default()
    }
}

/// Per-level counts over the assembled evidence.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LevelCounts {
    pub a: usize,
    pub b: usize,
    pub c: usize,
}

impl LevelCounts {
    pub fn of(chunks: &[AnnotatedChunk]) -> Self {
        let mut counts = Self::default();
        for chunk in chunks {
            match chunk.annotation.level {
                EpistemicLevel::A => counts.a += 1,
                EpistemicLevel::B => counts.b += 1,
                EpistemicLevel::C => counts.c += 1,
            }
        }
        counts
    }
}

/// Gateway logic picking QUOTE / HYBRID / SYNTHESIS from the evidence.
pub fn determine_answer_mode(chunks: &[AnnotatedChunk], intent: Intent, complexity: Complexity) -> AnswerMode {
    let has_definitional = chunks
        .iter()
        .any(|c| c.annotation.features.contains(&Feature::Definitional));
    let has_theory = chunks.iter().any(|c| c.annotation.features.contains(&Feature::Theory));
    let high_confidence_count = chunks.iter().filter(|c| c.annotation.answerability_score >= 2.0).count();
    let evidence_count = chunks.iter().filter(|c| c.annotation.answerability_score >= 1.0).count();
    let has_high_score_evidence = chunks.iter().any(|c| c.annotation.answerability_score >= 3.0);

    // Complex philosophical questions in DIRECT form need quote + synthesis.
    if intent == Intent::Direct
        && complexity == Complexity::High
        && (has_definitional || has_theory || evidence_count >= 2)
    {
        return AnswerMode::Hybrid;
    }

    if intent == Intent::Direct && (has_definitional || has_theory || has_high_score_evidence) {
        return AnswerMode::Quote;
    }

    if matches!(intent, Intent::Direct | Intent::Comparative) && high_confidence_count >= 1 {
        return AnswerMode::Quote;
    }

    if evidence_count >= 3 {
        return AnswerMode::Quote;
    }

    AnswerMode::Synthesis
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(text: &str, comment: Option<&str>) -> ChunkHit {
        ChunkHit {
            id: "1".to_string(),
            title: "Vicdan Üzerine".to_string(),
            text: text.to_string(),
            source_type: "PDF_CHUNK".to_string(),
            page_number: Some(1),
            chunk_index: None,
            tags: None,
            summary: None,
            comment: comment.map(str::to_string),
            book_id: Some("b1".to_string()),
            normalized_text: None,
            score: 100.0,
            match_type: "content_exact".to_string(),
        }
    }

    fn annotated(score: f64, features: Vec<Feature>) -> AnnotatedChunk {
        AnnotatedChunk {
            hit: hit("metin", None),
            annotation: EpistemicAnnotation {
                answerability_score: score,
                features,
                ..EpistemicAnnotation::default()
            },
        }
    }

    #[test]
    fn keyword_plus_definitional_is_level_a() {
        // Invariant: features ⊇ {KEYWORD_MATCH, DEFINITIONAL} -> level A.
        let keywords = vec!["vicdan".to_string()];
        let chunk = hit("Vicdan, insanın içindeki ahlaki yargı gücüdür ve doğruya yöneltir.", None);
        let annotation = classify_chunk(&keywords, &chunk, &FastPassageClassifier);
        assert!(annotation.features.contains(&Feature::KeywordMatch));
        assert!(annotation.features.contains(&Feature::Definitional));
        assert_eq!(annotation.level, EpistemicLevel::A);
        assert!(annotation.answerability_score >= 4.0);
    }

    #[test]
    fn keyword_only_is_level_b() {
        let keywords = vec!["vicdan".to_string()];
        let chunk = hit("O gun vicdanimizdan soz acildi ve konu kapandi arkadaslar toplandi", None);
        let annotation = classify_chunk(&keywords, &chunk, &FastPassageClassifier);
        assert!(annotation.features.contains(&Feature::KeywordMatch));
        assert!(!annotation.features.contains(&Feature::Definitional));
        assert_eq!(annotation.level, EpistemicLevel::B);
    }

    #[test]
    fn conceptual_only_is_level_c() {
        let keywords = vec!["vicdan".to_string()];
        let chunk = hit("Sehirler buyudu ve insanlar kalabaliklasti; ticaret gelisti.", None);
        let annotation = classify_chunk(&keywords, &chunk, &FastPassageClassifier);
        assert_eq!(annotation.level, EpistemicLevel::C);
        assert_eq!(annotation.answerability_score, 0.0);
    }

    #[test]
    fn personal_comment_and_modality_add_points() {
        let keywords = vec!["vicdan".to_string()];
        let chunk = hit(
            "Bence vicdan her insanda bulunur ve yol gosterir bunu unutmamak gerek.",
            Some("önemli bir pasaj"),
        );
        let (score, features) = score_answerability(&chunk, &keywords);
        assert!(features.contains(&Feature::Modality));
        assert!(features.contains(&Feature::PersonalComment));
        assert!(score >= 3.0);
    }

    #[test]
    fn intent_classification() {
        let (intent, _) = classify_question_intent("vicdan nedir?");
        assert_eq!(intent, Intent::Direct);
        let (intent, _) = classify_question_intent("bu görüşü diğer kitaplarla karşılaştır");
        assert_eq!(intent, Intent::Comparative);
        let (intent, _) = classify_question_intent("toplumlar zaman içinde nasıl dönüşür acaba anlat");
        assert_eq!(intent, Intent::Synthesis);
        let (_, complexity) = classify_question_intent("vicdan değişir mi yoksa sabit mi");
        assert_eq!(complexity, Complexity::High);
    }

    #[test]
    fn keyword_extraction_filters_stop_words() {
        let keywords = extract_core_concepts("vicdan ve ahlak nedir acaba");
        assert!(keywords.contains(&"vicdan".to_string()));
        assert!(keywords.contains(&"ahlak".to_string()));
        assert!(!keywords.contains(&"ve".to_string()));
        // "bu nedir" degenerates to the longest word.
        let fallback = extract_core_concepts("bu ne");
        assert_eq!(fallback.len(), 1);
    }

    #[test]
    fn answer_mode_gates() {
        // DIRECT + HIGH + definitional -> HYBRID
        let chunks = vec![annotated(4.0, vec![Feature::KeywordMatch, Feature::Definitional])];
        assert_eq!(
            determine_answer_mode(&chunks, Intent::Direct, Complexity::High),
            AnswerMode::Hybrid
        );
        // DIRECT + LOW + definitional -> QUOTE
        assert_eq!(
            determine_answer_mode(&chunks, Intent::Direct, Complexity::Low),
            AnswerMode::Quote
        );
        // COMPARATIVE + high-confidence chunk -> QUOTE
        let chunks = vec![annotated(2.0, vec![Feature::KeywordMatch])];
        assert_eq!(
            determine_answer_mode(&chunks, Intent::Comparative, Complexity::Low),
            AnswerMode::Quote
        );
        // 3+ keyword matches -> QUOTE regardless of intent
        let chunks = vec![
            annotated(1.0, vec![Feature::KeywordMatch]),
            annotated(1.0, vec![Feature::KeywordMatch]),
            annotated(1.0, vec![Feature::KeywordMatch]),
        ];
        assert_eq!(
            determine_answer_mode(&chunks, Intent::Synthesis, Complexity::Low),
            AnswerMode::Quote
        );
        // Sparse evidence -> SYNTHESIS
        let chunks = vec![annotated(0.0, vec![])];
        assert_eq!(
            determine_answer_mode(&chunks, Intent::Synthesis, Complexity::Low),
            AnswerMode::Synthesis
        );
    }
}
