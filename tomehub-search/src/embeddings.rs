use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{SearchError, SearchResult};

/// Embedding provider contract: fixed-dimension float sequences.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        inputs: &[String],
        task_type: &str,
        output_dim: usize,
    ) -> SearchResult<Vec<Vec<f32>>>;
}

/// HTTP embedding client talking to an `/api/embed` endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
    task_type: String,
    output_dimensionality: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
    embedding: Option<Vec<f32>>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(
        &self,
        inputs: &[String],
        task_type: &str,
        output_dim: usize,
    ) -> SearchResult<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: self.model.clone(),
            input: inputs.to_vec(),
            task_type: task_type.to_string(),
            output_dimensionality: output_dim,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SearchError::Embedding(format!(
                "embedding request failed: {status} {text}"
            )));
        }

        let payload: EmbedResponse = response.json().await?;

        if let Some(embeddings) = payload.embeddings {
            return Ok(embeddings);
        }
        if let Some(embedding) = payload.embedding {
            return Ok(vec![embedding]);
        }

        Err(SearchError::Embedding("embedding response missing vectors".to_string()))
    }
}
