//! Provider-routed text generation with the fallback ladder.
//!
//! Primary provider is picked by route mode (explorer pilot routes to Qwen
//! behind the RPM window); retryable failures fall back to the secondary
//! provider once per request, and a flag-gated flash->pro escalation exists
//! for Gemini.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use tomehub_core::Settings;

use crate::providers::{
    GenerateRequest, LlmProvider, ModelTier, ProviderError, RpmWindow, TokenUsage,
    is_retryable_error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Default,
    ExplorerQwenPilot,
}

/// Per-request fallback accounting shared across the answer pipeline.
#[derive(Debug, Default)]
pub struct FallbackState {
    pub secondary_fallback_used: u32,
    pub pro_fallback_used: u32,
}

/// Generation options carried alongside the prompt.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub response_mime_type: Option<String>,
    pub timeout: Option<Duration>,
    pub provider_hint: Option<String>,
    pub allow_secondary_fallback: bool,
    pub allow_pro_fallback: bool,
}

/// Routed generation outcome with fallback metadata attached.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub model_used: String,
    pub model_tier: ModelTier,
    pub provider_name: String,
    pub fallback_applied: bool,
    pub secondary_fallback_applied: bool,
    pub fallback_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

pub struct LlmRouter {
    settings: Arc<Settings>,
    gemini: Arc<dyn LlmProvider>,
    qwen: Arc<dyn LlmProvider>,
    rpm: RpmWindow,
}

fn normalize_provider_hint(hint: Option<&str>) -> &'static str {
    match hint.map(|h| h.trim().to_lowercase()) {
        Some(h) if h == "qwen" || h == "nvidia" => "qwen",
        _ => "gemini",
    }
}

impl LlmRouter {
    pub fn new(settings: Arc<Settings>, gemini: Arc<dyn LlmProvider>, qwen: Arc<dyn LlmProvider>) -> Self {
        let rpm = RpmWindow::new(settings.llm_explorer_rpm_cap);
        Self {
            settings,
            gemini,
            qwen,
            rpm,
        }
    }

    pub fn model_for_tier(&self, tier: ModelTier) -> String {
        match tier {
            ModelTier::Lite => self.settings.llm_model_lite.clone(),
            ModelTier::Flash => self.settings.llm_model_flash.clone(),
            ModelTier::Pro => self.settings.llm_model_pro.clone(),
        }
    }

    fn provider_for(&self, name: &str) -> Arc<dyn LlmProvider> {
        if name == "qwen" {
            self.qwen.clone()
        } else {
            self.gemini.clone()
        }
    }

    fn resolve_primary_hint(&self, opts: &GenerateOptions, route_mode: RouteMode) -> &'static str {
        if route_mode == RouteMode::ExplorerQwenPilot && self.settings.llm_explorer_qwen_pilot_enabled {
            return normalize_provider_hint(Some(&self.settings.llm_explorer_primary_provider));
        }
        normalize_provider_hint(opts.provider_hint.as_deref())
    }

    fn resolve_secondary(&self, tier: ModelTier) -> (&'static str, String) {
        let provider = normalize_provider_hint(Some(&self.settings.llm_explorer_fallback_provider));
        let model = if provider == "gemini" {
            self.model_for_tier(tier)
        } else {
            self.settings.llm_explorer_primary_model.clone()
        };
        (provider, model)
    }

    fn can_use_secondary(&self, state: &FallbackState) -> bool {
        state.secondary_fallback_used < self.settings.llm_explorer_secondary_max_per_request
    }

    fn can_use_pro(&self, state: &FallbackState) -> bool {
        self.settings.llm_pro_fallback_enabled
            && state.pro_fallback_used < self.settings.llm_pro_fallback_max_per_request
    }

    async fn secondary_generate(
        &self,
        prompt: &str,
        tier: ModelTier,
        opts: &GenerateOptions,
        state: &mut FallbackState,
        reason: &str,
    ) -> Result<GenerateOutcome, ProviderError> {
        let (provider_name, model) = self.resolve_secondary(tier);
        let provider = self.provider_for(provider_name);
        let mut request = GenerateRequest::new(&model, prompt);
        request.temperature = opts.temperature;
        request.max_output_tokens = opts.max_output_tokens;
        request.response_mime_type = opts.response_mime_type.clone();
        request.timeout = opts.timeout;

        let response = provider.generate_text(&request).await?;
        state.secondary_fallback_used += 1;
        Ok(GenerateOutcome {
            text: response.text,
            model_used: model,
            model_tier: tier,
            provider_name: provider.name().to_string(),
            fallback_applied: true,
            secondary_fallback_applied: true,
            fallback_reason: Some(reason.to_string()),
            usage: response.usage,
        })
    }

    /// Generate text through the routed provider with the fallback ladder.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        tier: ModelTier,
        route_mode: RouteMode,
        opts: &GenerateOptions,
        state: &mut FallbackState,
    ) -> Result<GenerateOutcome, ProviderError> {
        let primary_hint = self.resolve_primary_hint(opts, route_mode);

        // RPM gate only guards the explorer Qwen primary.
        if route_mode == RouteMode::ExplorerQwenPilot
            && primary_hint == "qwen"
            && self.settings.llm_explorer_qwen_pilot_enabled
            && !self.rpm.try_consume()
        {
            if opts.allow_secondary_fallback && self.can_use_secondary(state) {
                return self.secondary_generate(prompt, tier, opts, state, "qwen_rpm_cap").await;
            }
            return Err(ProviderError::RpmExhausted);
        }

        let provider = self.provider_for(primary_hint);
        let mut request = GenerateRequest::new(model, prompt);
        request.temperature = opts.temperature;
        request.max_output_tokens = opts.max_output_tokens;
        request.response_mime_type = opts.response_mime_type.clone();
        request.timeout = opts.timeout;

        match provider.generate_text(&request).await {
            Ok(response) => Ok(GenerateOutcome {
                text: response.text,
                model_used: model.to_string(),
                model_tier: tier,
                provider_name: provider.name().to_string(),
                fallback_applied: false,
                secondary_fallback_applied: false,
                fallback_reason: None,
                usage: response.usage,
            }),
            Err(err) => {
                // Gemini flash -> pro escalation (flag-gated, once per request).
                if primary_hint == "gemini"
                    && opts.allow_pro_fallback
                    && tier == ModelTier::Flash
                    && is_retryable_error(&err)
                    && self.can_use_pro(state)
                {
                    warn!(error = %err, "flash model failed with retryable error; using pro fallback");
                    state.pro_fallback_used += 1;
                    let pro_model = self.model_for_tier(ModelTier::Pro);
                    let mut pro_request = request.clone();
                    pro_request.model = pro_model.clone();
                    let response = provider.generate_text(&pro_request).await?;
                    return Ok(GenerateOutcome {
                        text: response.text,
                        model_used: pro_model,
                        model_tier: ModelTier::Pro,
                        provider_name: provider.name().to_string(),
                        fallback_applied: true,
                        secondary_fallback_applied: false,
                        fallback_reason: Some("gemini_flash_to_pro".to_string()),
                        usage: response.usage,
                    });
                }

                // Qwen explorer primary -> secondary provider (once).
                if route_mode == RouteMode::ExplorerQwenPilot
                    && primary_hint == "qwen"
                    && opts.allow_secondary_fallback
                    && is_retryable_error(&err)
                    && self.can_use_secondary(state)
                {
                    warn!(error = %err, "qwen primary failed with retryable error; using secondary fallback");
                    return self
                        .secondary_generate(prompt, tier, opts, state, "qwen_retryable_error")
                        .await;
                }

                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::providers::ProviderResponse;

    struct ScriptedProvider {
        name: &'static str,
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn ok(name: &'static str) -> Self {
            Self { name, fail_first: 0, calls: AtomicUsize::new(0) }
        }

        fn failing(name: &'static str, fail_first: usize) -> Self {
            Self { name, fail_first, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn generate_text(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ProviderError::Api {
                    status: 429,
                    message: "rate limit".to_string(),
                });
            }
            Ok(ProviderResponse {
                text: format!("{}:{}", self.name, request.model),
                usage: None,
            })
        }
    }

    fn explorer_settings() -> Settings {
        Settings {
            llm_explorer_qwen_pilot_enabled: true,
            llm_explorer_primary_provider: "qwen".to_string(),
            llm_explorer_fallback_provider: "gemini".to_string(),
            llm_explorer_secondary_max_per_request: 1,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn qwen_retryable_error_falls_back_to_gemini_once() {
        let settings = Arc::new(explorer_settings());
        let router = LlmRouter::new(
            settings,
            Arc::new(ScriptedProvider::ok("gemini")),
            Arc::new(ScriptedProvider::failing("qwen", 10)),
        );
        let opts = GenerateOptions {
            allow_secondary_fallback: true,
            ..Default::default()
        };
        let mut state = FallbackState::default();
        let outcome = router
            .generate("qwen-model", "soru", ModelTier::Flash, RouteMode::ExplorerQwenPilot, &opts, &mut state)
            .await
            .unwrap();

        assert!(outcome.secondary_fallback_applied);
        assert_eq!(outcome.provider_name, "gemini");
        assert_eq!(outcome.fallback_reason.as_deref(), Some("qwen_retryable_error"));
        assert_eq!(state.secondary_fallback_used, 1);

        // Second failure in the same request exhausts the ladder.
        let err = router
            .generate("qwen-model", "soru", ModelTier::Flash, RouteMode::ExplorerQwenPilot, &opts, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn rpm_starvation_uses_secondary() {
        let settings = Arc::new(Settings {
            llm_explorer_rpm_cap: 0,
            ..explorer_settings()
        });
        let router = LlmRouter::new(
            settings,
            Arc::new(ScriptedProvider::ok("gemini")),
            Arc::new(ScriptedProvider::ok("qwen")),
        );
        let opts = GenerateOptions {
            allow_secondary_fallback: true,
            ..Default::default()
        };
        let mut state = FallbackState::default();
        let outcome = router
            .generate("qwen-model", "soru", ModelTier::Flash, RouteMode::ExplorerQwenPilot, &opts, &mut state)
            .await
            .unwrap();
        assert_eq!(outcome.fallback_reason.as_deref(), Some("qwen_rpm_cap"));
        assert_eq!(outcome.provider_name, "gemini");
    }

    #[tokio::test]
    async fn rpm_starvation_without_fallback_errors() {
        let settings = Arc::new(Settings {
            llm_explorer_rpm_cap: 0,
            ..explorer_settings()
        });
        let router = LlmRouter::new(
            settings,
            Arc::new(ScriptedProvider::ok("gemini")),
            Arc::new(ScriptedProvider::ok("qwen")),
        );
        let opts = GenerateOptions::default();
        let mut state = FallbackState::default();
        let err = router
            .generate("qwen-model", "soru", ModelTier::Flash, RouteMode::ExplorerQwenPilot, &opts, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RpmExhausted));
    }

    #[tokio::test]
    async fn flash_escalates_to_pro_when_enabled() {
        let settings = Arc::new(Settings {
            llm_pro_fallback_enabled: true,
            llm_pro_fallback_max_per_request: 1,
            ..Settings::default()
        });
        let router = LlmRouter::new(
            settings,
            Arc::new(ScriptedProvider::failing("gemini", 1)),
            Arc::new(ScriptedProvider::ok("qwen")),
        );
        let opts = GenerateOptions {
            allow_pro_fallback: true,
            ..Default::default()
        };
        let mut state = FallbackState::default();
        let outcome = router
            .generate("flash-model", "soru", ModelTier::Flash, RouteMode::Default, &opts, &mut state)
            .await
            .unwrap();
        assert!(outcome.fallback_applied);
        assert_eq!(outcome.model_tier, ModelTier::Pro);
        assert_eq!(outcome.fallback_reason.as_deref(), Some("gemini_flash_to_pro"));
        assert_eq!(state.pro_fallback_used, 1);
    }
}
