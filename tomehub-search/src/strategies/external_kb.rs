//! External knowledge-base candidates: read-only consumption of the edges a
//! background sync job has already written. Each edge becomes a synthetic
//! one-line chunk so the assembler can treat it like any other candidate.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use tomehub_core::Settings;
use tomehub_core::text::normalize_match_text;
use tomehub_db::Store;
use tomehub_db::models::{ChunkHit, ExternalMeta};

use crate::errors::SearchResult;

/// A synthetic chunk plus the provider weight the assembler multiplies in.
#[derive(Debug, Clone)]
pub struct ExternalKbCandidate {
    pub hit: ChunkHit,
    pub external_weight: f64,
    pub provider: String,
}

pub struct ExternalKbStrategy {
    store: Arc<dyn Store>,
    graph_weight: f64,
    dbpedia_weight: f64,
    orkg_weight: f64,
}

impl ExternalKbStrategy {
    pub fn new(store: Arc<dyn Store>, settings: &Settings) -> Self {
        Self {
            store,
            graph_weight: settings.external_kb_graph_weight,
            dbpedia_weight: settings.external_kb_dbpedia_weight,
            orkg_weight: settings.external_kb_orkg_weight,
        }
    }

    fn provider_graph_weight(&self, provider: &str) -> f64 {
        match provider.trim().to_uppercase().as_str() {
            "DBPEDIA" => self.dbpedia_weight,
            "ORKG" => self.orkg_weight,
            _ => self.graph_weight,
        }
    }

    fn humanize_rel_type(rel_type: &str) -> String {
        let raw = if rel_type.trim().is_empty() { "RELATED_TO" } else { rel_type };
        raw.replace('_', " ").to_lowercase()
    }

    pub async fn meta(&self, user: &str, book_id: &str) -> SearchResult<ExternalMeta> {
        Ok(self.store.external_meta(user, book_id).await?)
    }

    /// Pull edge candidates for one book, scored against the question.
    pub async fn candidates(
        &self,
        user: &str,
        book_id: &str,
        question: &str,
        limit: usize,
        min_confidence: f64,
    ) -> Vec<ExternalKbCandidate> {
        if book_id.trim().is_empty() || user.trim().is_empty() {
            return Vec::new();
        }
        let hard_limit = limit.clamp(1, 10);

        let edges = match self.store.external_edges(user, book_id, hard_limit * 8).await {
            Ok(edges) => edges,
            Err(err) => {
                warn!(error = %err, book_id, "external kb candidate read failed");
                return Vec::new();
            }
        };

        let question_tokens: HashSet<String> = normalize_match_text(question)
            .split_whitespace()
            .filter(|t| t.len() >= 3)
            .map(str::to_string)
            .collect();

        let mut out = Vec::new();
        for edge in edges {
            let provider = edge.provider.trim().to_uppercase();
            let provider = if provider.is_empty() { "EXTERNAL".to_string() } else { provider };
            let src = edge.src_label.trim();
            let dst = edge.dst_label.trim();

            let edge_text = normalize_match_text(&format!("{src} {dst}"));
            let overlap = question_tokens.iter().filter(|tok| edge_text.contains(tok.as_str())).count();
            let mut score = edge.weight + (0.08 * overlap as f64).min(0.35);
            // Secondary providers remain supportive, not dominant.
            if provider == "DBPEDIA" || provider == "ORKG" {
                score *= 0.92;
            }
            if score < min_confidence {
                continue;
            }

            let provider_weight = self.provider_graph_weight(&provider).clamp(0.03, 0.30);
            let text = format!("{src} {} {dst}", Self::humanize_rel_type(&edge.rel_type))
                .trim()
                .to_string();
            out.push(ExternalKbCandidate {
                hit: ChunkHit {
                    id: String::new(),
                    title: format!("External KB ({provider})"),
                    text,
                    source_type: "EXTERNAL_KB".to_string(),
                    page_number: Some(0),
                    chunk_index: None,
                    tags: None,
                    summary: None,
                    comment: None,
                    book_id: Some(book_id.to_string()),
                    normalized_text: None,
                    score,
                    match_type: "external_kb".to_string(),
                },
                external_weight: provider_weight,
                provider,
            });
        }

        out.sort_by(|a, b| b.hit.score.partial_cmp(&a.hit.score).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(hard_limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_type_humanisation() {
        assert_eq!(ExternalKbStrategy::humanize_rel_type("SAME_AUTHOR"), "same author");
        assert_eq!(ExternalKbStrategy::humanize_rel_type(""), "related to");
    }
}
