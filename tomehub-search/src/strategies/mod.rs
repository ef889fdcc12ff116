//! Stateless retrieval primitives.
//!
//! Each strategy shares the same call shape and returns scored hits with a
//! `match_type` tag; the orchestrator owns ordering and fusion.

mod exact;
mod external_kb;
mod graph;
mod lemma;
mod odl_shadow;
mod semantic;

pub use exact::ExactStrategy;
pub use external_kb::{ExternalKbCandidate, ExternalKbStrategy};
pub use graph::{ConceptExtractor, GraphCandidate, GraphOutcome, GraphTraverseStrategy, NoopConceptExtractor};
pub use lemma::LemmaStrategy;
pub use odl_shadow::OdlShadowRescueStrategy;
pub use semantic::SemanticStrategy;

use async_trait::async_trait;
use tomehub_db::models::{ChunkHit, SearchFilters};

use crate::errors::SearchResult;
use crate::types::Intent;

/// Common capability set over the bucket strategies.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_weight(&self) -> f64 {
        1.0
    }

    async fn search(
        &self,
        query: &str,
        user: &str,
        limit: usize,
        offset: usize,
        intent: Intent,
        filters: &SearchFilters,
    ) -> SearchResult<Vec<ChunkHit>>;
}
