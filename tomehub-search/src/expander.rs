//! LLM-backed query expansion with a cache in front.
//!
//! The orchestrator races the expansion future against a hard timeout; a
//! timed-out expansion simply contributes no variations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{MultiLayerCache, generate_cache_key};
use crate::errors::SearchResult;

const EXPANSION_CACHE_TTL: Duration = Duration::from_secs(1800);

/// Variation source collaborator (an LLM-lite model in production).
#[async_trait]
pub trait VariationGenerator: Send + Sync {
    async fn variations(&self, query: &str, max_variations: usize) -> SearchResult<Vec<String>>;
}

/// Expansion disabled: no variations, no LLM call.
pub struct NoopVariationGenerator;

#[async_trait]
impl VariationGenerator for NoopVariationGenerator {
    async fn variations(&self, _query: &str, _max_variations: usize) -> SearchResult<Vec<String>> {
        Ok(Vec::new())
    }
}

pub struct QueryExpander {
    generator: Arc<dyn VariationGenerator>,
    cache: Arc<MultiLayerCache>,
    model_version: String,
}

impl QueryExpander {
    pub fn new(generator: Arc<dyn VariationGenerator>, cache: Arc<MultiLayerCache>, model_version: &str) -> Self {
        Self {
            generator,
            cache,
            model_version: model_version.to_string(),
        }
    }

    pub async fn expand(&self, query: &str, max_variations: usize) -> SearchResult<Vec<String>> {
        if max_variations == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let cache_key = generate_cache_key(
            "query_expansion",
            query,
            "",
            None,
            max_variations,
            &self.model_version,
        );
        if let Some((cached, _)) = self.cache.get(&cache_key).await {
            if let Ok(variations) = serde_json::from_value::<Vec<String>>(cached) {
                return Ok(variations);
            }
        }

        let raw = self.generator.variations(query, max_variations).await?;
        let original = query.trim().to_lowercase();
        let mut seen = std::collections::HashSet::new();
        let variations: Vec<String> = raw
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .filter(|v| v.to_lowercase() != original)
            .filter(|v| seen.insert(v.to_lowercase()))
            .take(max_variations)
            .collect();

        if let Ok(value) = serde_json::to_value(&variations) {
            self.cache.set(&cache_key, value, EXPANSION_CACHE_TTL).await;
        }
        Ok(variations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGenerator(Vec<String>);

    #[async_trait]
    impl VariationGenerator for FixedGenerator {
        async fn variations(&self, _query: &str, _max: usize) -> SearchResult<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn expansion_dedupes_and_drops_original() {
        let cache = Arc::new(MultiLayerCache::new(Duration::from_secs(60)));
        let generator = Arc::new(FixedGenerator(vec![
            "vicdan nedir".to_string(),
            "vicdan kavramı".to_string(),
            "Vicdan kavramı".to_string(),
            "vicdanın anlamı".to_string(),
        ]));
        let expander = QueryExpander::new(generator, cache, "v1");

        let variations = expander.expand("vicdan nedir", 2).await.unwrap();
        assert_eq!(variations, vec!["vicdan kavramı", "vicdanın anlamı"]);
    }

    #[tokio::test]
    async fn expansion_results_are_cached() {
        let cache = Arc::new(MultiLayerCache::new(Duration::from_secs(60)));
        let generator = Arc::new(FixedGenerator(vec!["varyasyon".to_string()]));
        let expander = QueryExpander::new(generator, cache.clone(), "v1");

        let first = expander.expand("soru", 2).await.unwrap();
        let second = expander.expand("soru", 2).await.unwrap();
        assert_eq!(first, second);
    }
}
