//! Provider abstraction for the answer-generation LLMs.

mod gemini;
mod qwen;
mod rpm;

pub use gemini::GeminiClient;
pub use qwen::QwenClient;
pub use rpm::RpmWindow;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Model tier policy: lite for rewrites, flash for answers, pro as escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelTier {
    Lite,
    Flash,
    Pro,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lite => "lite",
            Self::Flash => "flash",
            Self::Pro => "pro",
        }
    }
}

/// One text-generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub response_mime_type: Option<String>,
    pub timeout: Option<Duration>,
}

impl GenerateRequest {
    pub fn new(model: &str, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            temperature: None,
            max_output_tokens: None,
            response_mime_type: None,
            timeout: None,
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// Raw provider response before routing metadata is attached.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("no content in response")]
    NoContent,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} API key is not configured")]
    MissingApiKey(&'static str),
    #[error("RPM cap reached and secondary fallback is disabled")]
    RpmExhausted,
}

/// Whether a provider failure warrants trying the next rung of the ladder.
pub fn is_retryable_error(err: &ProviderError) -> bool {
    match err {
        ProviderError::Http(http) => {
            if http.is_timeout() || http.is_connect() {
                return true;
            }
            http.status()
                .map(|s| s.as_u16() == 429 || s.is_server_error())
                .unwrap_or(false)
        }
        ProviderError::Api { status, message } => {
            if *status == 429 || *status >= 500 {
                return true;
            }
            let msg = message.to_lowercase();
            [
                "429",
                "resource_exhausted",
                "rate limit",
                "timeout",
                "timed out",
                "deadline",
                "internal error",
                "service unavailable",
                "temporarily unavailable",
            ]
            .iter()
            .any(|marker| msg.contains(marker))
        }
        _ => false,
    }
}

/// Provider trait for the different LLM backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate_text(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_error(&ProviderError::Api {
            status: 429,
            message: "too many requests".to_string()
        }));
        assert!(is_retryable_error(&ProviderError::Api {
            status: 503,
            message: "unavailable".to_string()
        }));
        assert!(is_retryable_error(&ProviderError::Api {
            status: 400,
            message: "RESOURCE_EXHAUSTED: quota".to_string()
        }));
        assert!(!is_retryable_error(&ProviderError::Api {
            status: 400,
            message: "invalid argument".to_string()
        }));
        assert!(!is_retryable_error(&ProviderError::NoContent));
    }
}
