use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Who may see a library item's chunks during retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchVisibility {
    Default,
    ExcludedByDefault,
    NeverRetrieve,
}

impl SearchVisibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::ExcludedByDefault => "EXCLUDED_BY_DEFAULT",
            Self::NeverRetrieve => "NEVER_RETRIEVE",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "EXCLUDED_BY_DEFAULT" => Self::ExcludedByDefault,
            "NEVER_RETRIEVE" => Self::NeverRetrieve,
            _ => Self::Default,
        }
    }
}

/// Visibility scope requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VisibilityScope {
    #[default]
    Default,
    All,
}

impl VisibilityScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::All => "all",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "all" => Self::All,
            _ => Self::Default,
        }
    }
}

/// Logical resource scope accepted by the search filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Book,
    AllNotes,
    PersonalNote,
    Article,
    Website,
    Raw(String),
}

impl ResourceType {
    pub fn parse(value: &str) -> Option<Self> {
        let v = value.trim().to_uppercase();
        if v.is_empty() {
            return None;
        }
        Some(match v.as_str() {
            "BOOK" => Self::Book,
            "ALL_NOTES" => Self::AllNotes,
            "PERSONAL_NOTE" => Self::PersonalNote,
            "ARTICLE" => Self::Article,
            "WEBSITE" => Self::Website,
            _ => Self::Raw(v),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Book => "BOOK",
            Self::AllNotes => "ALL_NOTES",
            Self::PersonalNote => "PERSONAL_NOTE",
            Self::Article => "ARTICLE",
            Self::Website => "WEBSITE",
            Self::Raw(v) => v,
        }
    }
}

/// Length bias applied by intent-dependent semantic sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthFilter {
    /// Chunks shorter than 600 chars.
    Short,
    /// Chunks longer than 600 chars.
    Long,
}

/// Filters accepted by every search query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub book_id: Option<String>,
    pub resource_type: Option<ResourceType>,
    pub content_type: Option<String>,
    pub ingestion_type: Option<String>,
    pub visibility_scope: VisibilityScope,
    pub length: Option<LengthFilter>,
    /// Exclude raw PDF-like chunks in the first retrieval pass.
    pub exclude_pdf: bool,
}

impl SearchFilters {
    pub fn scoped(&self) -> bool {
        self.book_id.is_some() || self.resource_type.is_some()
    }

    pub fn with_exclude_pdf(&self, exclude: bool) -> Self {
        let mut out = self.clone();
        out.exclude_pdf = exclude;
        out
    }

    pub fn with_length(&self, length: Option<LengthFilter>) -> Self {
        let mut out = self.clone();
        out.length = length;
        out
    }
}

/// A retrievable unit returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub id: String,
    pub title: String,
    pub text: String,
    pub source_type: String,
    pub page_number: Option<i64>,
    pub chunk_index: Option<i64>,
    pub tags: Option<String>,
    pub summary: Option<String>,
    pub comment: Option<String>,
    pub book_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_text: Option<String>,
    pub score: f64,
    pub match_type: String,
}

impl ChunkHit {
    /// Deduplication key used across buckets and the candidate map.
    pub fn item_key(&self) -> String {
        if !self.id.is_empty() {
            return self.id.clone();
        }
        let prefix: String = self.text.chars().take(40).collect();
        format!("{}_{}_{}", self.title, self.page_number.unwrap_or(0), prefix)
    }

    /// Merge-map key for the context assembler (title + text prefix).
    pub fn merge_key(&self) -> String {
        let prefix: String = self.text.chars().take(20).collect();
        format!("{}_{}", self.title, prefix)
    }
}

/// A chunk reached through concept-graph traversal.
#[derive(Debug, Clone)]
pub struct GraphHit {
    pub content_id: i64,
    pub title: String,
    pub text: String,
    pub source_type: String,
    pub page_number: Option<i64>,
    pub related_concept: String,
    pub rel_type: String,
    pub weight: f64,
    pub strength: Option<f64>,
}

/// Directed external knowledge-base edge scoped to a user's book.
#[derive(Debug, Clone)]
pub struct ExternalEdge {
    pub rel_type: String,
    pub weight: f64,
    pub provider: String,
    pub src_label: String,
    pub dst_label: String,
}

/// Per-book external enrichment metadata.
#[derive(Debug, Clone, Default)]
pub struct ExternalMeta {
    pub academic_scope: bool,
    pub wikidata_qid: Option<String>,
    pub openalex_id: Option<String>,
    pub dbpedia_uri: Option<String>,
    pub orkg_id: Option<String>,
    pub doi: Option<String>,
    pub sync_status: Option<String>,
}

/// Entry in the user's book catalog.
#[derive(Debug, Clone)]
pub struct BookRef {
    pub item_id: String,
    pub title: String,
    pub author: Option<String>,
}

/// Keyword-in-context snippet for analytic answers.
#[derive(Debug, Clone, Serialize)]
pub struct KwicContext {
    pub page_number: Option<i64>,
    pub snippet: String,
}

/// Append-only analytics row.
#[derive(Debug, Clone)]
pub struct SearchLogEntry {
    pub user_id: String,
    pub session_id: Option<String>,
    pub query: String,
    pub intent: String,
    pub rrf_weights: String,
    pub top_result_id: Option<String>,
    pub top_result_score: f64,
    pub execution_time_ms: f64,
    pub strategy_details: serde_json::Value,
}

/// A full chunk record as written by ingestion (used by fixtures and sync).
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub user_id: String,
    pub item_id: String,
    pub title: String,
    pub content_type: String,
    pub ingestion_type: String,
    pub text: String,
    pub page_number: Option<i64>,
    pub chunk_index: Option<i64>,
    pub comment: Option<String>,
    pub tags: Option<String>,
    pub rag_weight: f64,
    pub ai_eligible: bool,
    pub vector: Option<Vec<f32>>,
}

impl ChunkRecord {
    pub fn new(user_id: &str, item_id: &str, title: &str, content_type: &str, text: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            title: title.to_string(),
            content_type: content_type.to_string(),
            ingestion_type: "PDF".to_string(),
            text: text.to_string(),
            page_number: Some(1),
            chunk_index: Some(0),
            comment: None,
            tags: None,
            rag_weight: 1.0,
            ai_eligible: true,
            vector: None,
        }
    }
}

/// A library item record (owning container of chunks).
#[derive(Debug, Clone)]
pub struct LibraryItemRecord {
    pub item_id: String,
    pub user_id: String,
    pub item_type: String,
    pub title: String,
    pub author: Option<String>,
    pub search_visibility: SearchVisibility,
    pub summary_text: Option<String>,
    pub tags: Option<String>,
}

impl LibraryItemRecord {
    pub fn book(user_id: &str, item_id: &str, title: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            user_id: user_id.to_string(),
            item_type: "BOOK".to_string(),
            title: title.to_string(),
            author: None,
            search_visibility: SearchVisibility::Default,
            summary_text: None,
            tags: None,
        }
    }
}

/// Authorised book-id set helper alias.
pub type BookIdSet = HashSet<String>;
