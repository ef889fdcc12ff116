//! GraphRAG retrieval: map the query onto seed concepts, walk one hop of
//! relations, and surface the chunks linked to the neighbor concepts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tomehub_db::Store;

use crate::cache::{MultiLayerCache, generate_cache_key};
use crate::embeddings::Embedder;
use crate::errors::SearchResult;

/// Relation-type score modifiers, matched by substring of the stored type.
const TYPE_WEIGHTS: &[(&str, f64)] = &[
    ("DIRECT_CITATION", 1.0),
    ("QUOTES", 1.0),
    ("IS_A", 0.9),
    ("DEFINES", 0.9),
    ("PART_OF", 0.9),
    ("SEMANTIC_SIMILARITY", 0.7),
    ("SYNONYM", 0.7),
    ("RELATED_TO", 0.6),
    ("ASSOCIATED_WITH", 0.6),
    ("CO_OCCURRENCE", 0.4),
];

const GRAPH_CACHE_TTL: Duration = Duration::from_secs(3600);
const MIN_GRAPH_SCORE: f64 = 0.5;

/// LLM-assisted concept extraction collaborator (fallback seeding path).
#[async_trait]
pub trait ConceptExtractor: Send + Sync {
    async fn extract_concepts(&self, text: &str) -> SearchResult<Vec<String>>;
}

pub struct NoopConceptExtractor;

#[async_trait]
impl ConceptExtractor for NoopConceptExtractor {
    async fn extract_concepts(&self, _text: &str) -> SearchResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A chunk reached through the concept graph, with its composite score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphCandidate {
    pub title: String,
    pub text: String,
    pub page_number: Option<i64>,
    pub source_type: String,
    pub graph_score: f64,
    pub reason: String,
}

/// Degradation-aware graph retrieval result; never an error.
#[derive(Debug, Clone)]
pub enum GraphOutcome {
    Hits(Vec<GraphCandidate>),
    Degraded { reason: String },
}

pub struct GraphTraverseStrategy {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn ConceptExtractor>,
    cache: Arc<MultiLayerCache>,
    min_strength: f64,
    output_dim: usize,
}

impl GraphTraverseStrategy {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn ConceptExtractor>,
        cache: Arc<MultiLayerCache>,
        min_strength: f64,
        output_dim: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            cache,
            min_strength,
            output_dim,
        }
    }

    fn type_modifier(rel_type: &str) -> f64 {
        let upper = rel_type.to_uppercase();
        for (needle, weight) in TYPE_WEIGHTS {
            if upper.contains(needle) {
                return *weight;
            }
        }
        0.5
    }

    async fn seed_concepts(&self, query: &str) -> SearchResult<Vec<i64>> {
        // Case-insensitive substring match against names/aliases first.
        let mut ids = self.store.concepts_by_text(query.trim(), 5).await?;

        // Then LLM-assisted extraction over the raw query.
        if ids.is_empty() {
            let names = self.extractor.extract_concepts(query).await.unwrap_or_default();
            if !names.is_empty() {
                ids = self.store.concepts_by_names(&names).await?;
            }
        }

        // Finally nearest-neighbour over concept description embeddings.
        if ids.is_empty() {
            if let Ok(embeddings) = self
                .embedder
                .embed(&[query.to_string()], "retrieval_query", self.output_dim)
                .await
            {
                if let Some(vector) = embeddings.into_iter().next().filter(|v| !v.is_empty()) {
                    ids = self.store.concepts_by_vector(&vector, 5).await?;
                }
            }
        }

        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Run the 1-hop traversal. Failures degrade instead of erroring so the
    /// assembler can keep the other retrieval paths alive.
    pub async fn retrieve(&self, query: &str, user: &str, limit: usize, offset: usize) -> GraphOutcome {
        let cache_key = format!(
            "{}_graph",
            generate_cache_key("graph_candidates", query, user, None, limit, "v1")
        );
        if let Some((cached, _layer)) = self.cache.get(&cache_key).await {
            if let Ok(candidates) = serde_json::from_value::<Vec<GraphCandidate>>(cached) {
                debug!("graph candidates served from cache");
                return GraphOutcome::Hits(candidates);
            }
        }

        let seeds = match self.seed_concepts(query).await {
            Ok(seeds) => seeds,
            Err(err) => {
                warn!(error = %err, "graph seeding failed");
                return GraphOutcome::Degraded { reason: format!("seeding: {err}") };
            }
        };
        if seeds.is_empty() {
            debug!("no concepts found for graph traversal");
            return GraphOutcome::Hits(Vec::new());
        }

        let neighbors = match self
            .store
            .graph_neighbors(user, &seeds, self.min_strength, limit, offset)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "graph traversal failed");
                return GraphOutcome::Degraded { reason: format!("traversal: {err}") };
            }
        };

        let mut candidates = Vec::new();
        for row in neighbors {
            let modifier = Self::type_modifier(&row.rel_type);
            let final_graph_score = row.weight * modifier;
            // "Confident but wrong" guard: weak composite links are noise.
            if final_graph_score < MIN_GRAPH_SCORE {
                continue;
            }
            let reason = match row.strength {
                Some(strength) => format!(
                    "Linked via {} ({}, w={:.2}, s={:.2})",
                    row.related_concept, row.rel_type, final_graph_score, strength
                ),
                None => format!(
                    "Linked via {} ({}, w={:.2})",
                    row.related_concept, row.rel_type, final_graph_score
                ),
            };
            candidates.push(GraphCandidate {
                title: row.title,
                text: row.text,
                page_number: row.page_number,
                source_type: row.source_type,
                graph_score: final_graph_score,
                reason,
            });
        }

        if !candidates.is_empty() {
            if let Ok(value) = serde_json::to_value(&candidates) {
                self.cache.set(&cache_key, value, GRAPH_CACHE_TTL).await;
            }
        }

        GraphOutcome::Hits(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_modifier_matches_by_substring() {
        assert_eq!(GraphTraverseStrategy::type_modifier("IS_A_TYPE"), 0.9);
        assert_eq!(GraphTraverseStrategy::type_modifier("defines"), 0.9);
        assert_eq!(GraphTraverseStrategy::type_modifier("CO_OCCURRENCE"), 0.4);
        assert_eq!(GraphTraverseStrategy::type_modifier("QUOTES_FROM"), 1.0);
        assert_eq!(GraphTraverseStrategy::type_modifier("SOMETHING_ELSE"), 0.5);
    }

    #[test]
    fn weak_links_fall_below_threshold() {
        // weight 1.0 * CO_OCCURRENCE 0.4 = 0.4 < 0.5 -> discarded by retrieve()
        let score = 1.0 * GraphTraverseStrategy::type_modifier("CO_OCCURRENCE");
        assert!(score < MIN_GRAPH_SCORE);
    }
}
