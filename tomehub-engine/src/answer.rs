//! Answer generation: analytic short-circuit, prompt build with the graph
//! bridge, provider-routed LLM invocation, short-answer recovery, sources
//! and the merged metadata envelope.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, warn};

use tomehub_core::Settings;
use tomehub_db::Store;

use crate::analytics::{extract_target_term, is_analytic_word_count, term_candidates};
use crate::context::{AnswerRequest, AssemblyMode, ContextAssembler, RagContext};
use crate::epistemic::{AnnotatedChunk, AnswerMode};
use crate::errors::EngineResult;
use crate::llm::{FallbackState, GenerateOptions, GenerateOutcome, LlmRouter, RouteMode};
use crate::prompts::{build_epistemic_context, build_memory_zones, prompt_for_mode};
use crate::providers::ModelTier;

const SOURCE_SNIPPET_CHARS: usize = 400;
const GRAPH_BRIDGE_CHUNKS: usize = 10;
const GRAPH_BRIDGE_CONCEPT_CAP: usize = 20;
const GRAPH_BRIDGE_LIMIT: usize = 15;

const FAILED_ANSWER_TR: &str = "Üzgünüm, şu an cevap üretemiyorum. İlgili içerik bulunamadı.";
const ERROR_ANSWER_TR: &str = "Bir hata oluştu.";
const EMPTY_ANSWER_TR: &str = "Cevap üretilemedi.";

/// One cited source mirroring a used chunk, in post-fusion order.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub id: usize,
    pub title: String,
    pub page_number: i64,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct AnswerResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub metadata: Value,
}

pub struct AnswerEngine {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    assembler: Arc<ContextAssembler>,
    llm: Arc<LlmRouter>,
}

impl AnswerEngine {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        assembler: Arc<ContextAssembler>,
        llm: Arc<LlmRouter>,
    ) -> Self {
        Self {
            settings,
            store,
            assembler,
            llm,
        }
    }

    /// Quote-count target from the confidence tiers (flag-gated dynamics).
    fn compute_quote_target_count(&self, confidence: f64, chunk_count: usize) -> usize {
        let min_quotes = self.settings.llm_quote_dynamic_min.max(1);
        let max_quotes = self.settings.llm_quote_dynamic_max.max(min_quotes);
        let default_quotes = min_quotes.clamp(2, 5);

        if !self.settings.llm_quote_dynamic_count_enabled {
            return if chunk_count > 0 {
                default_quotes.min(chunk_count.max(1))
            } else {
                default_quotes
            };
        }

        let desired = if confidence >= 4.6 {
            max_quotes
        } else if confidence >= 4.1 {
            max_quotes.min(min_quotes.max(4))
        } else if confidence >= 3.4 {
            max_quotes.min(min_quotes.max(3))
        } else {
            min_quotes
        };
        let desired = if chunk_count > 0 { desired.min(chunk_count) } else { desired };
        desired.clamp(min_quotes, max_quotes)
    }

    async fn graph_bridge_context(store: Arc<dyn Store>, chunks: Vec<AnnotatedChunk>) -> String {
        let content_ids: Vec<i64> = chunks
            .iter()
            .take(GRAPH_BRIDGE_CHUNKS)
            .filter_map(|c| c.hit.id.parse::<i64>().ok())
            .collect();
        if content_ids.is_empty() {
            return String::new();
        }

        let links = match store.concept_links_for_chunks(&content_ids).await {
            Ok(links) => links,
            Err(err) => {
                warn!(error = %err, "graph enrichment failed");
                return String::new();
            }
        };
        let mut concept_ids: Vec<i64> = links.iter().map(|(_, _, cid)| *cid).collect();
        concept_ids.sort_unstable();
        concept_ids.dedup();
        concept_ids.truncate(GRAPH_BRIDGE_CONCEPT_CAP);
        if concept_ids.is_empty() {
            return String::new();
        }

        let bridges = match store.concept_bridges(&concept_ids, GRAPH_BRIDGE_LIMIT).await {
            Ok(bridges) => bridges,
            Err(err) => {
                warn!(error = %err, "graph bridge lookup failed");
                return String::new();
            }
        };
        if bridges.is_empty() {
            return String::new();
        }

        let mut lines: Vec<String> = bridges
            .into_iter()
            .map(|(a, rel, b)| format!("[BRIDGE] {a} is connected to {b} via '{rel}' relationship."))
            .collect();
        lines.sort();
        lines.dedup();
        format!("\nSEMANTIC BRIDGES (Graph Insights):\n{}", lines.join("\n"))
    }

    async fn try_analytic_short_circuit(&self, request: &AnswerRequest) -> EngineResult<Option<AnswerResponse>> {
        if !is_analytic_word_count(&request.question) {
            return Ok(None);
        }

        let Some(book_id) = request.context_book_id.as_deref().filter(|b| !b.trim().is_empty()) else {
            return Ok(Some(AnswerResponse {
                answer: "Analitik sayım için önce bir kitap seçmelisin.".to_string(),
                sources: Vec::new(),
                metadata: json!({
                    "status": "analytic",
                    "analytics": {"type": "word_count", "error": "book_id_required"},
                }),
            }));
        };

        let Some(term) = extract_target_term(&request.question) else {
            return Ok(Some(AnswerResponse {
                answer: "Sayılacak kelimeyi belirtir misin?".to_string(),
                sources: Vec::new(),
                metadata: json!({
                    "status": "analytic",
                    "analytics": {"type": "word_count", "error": "term_missing"},
                }),
            }));
        };

        let candidates = term_candidates(&term);
        let count = self
            .store
            .count_term_occurrences(&request.user_id, book_id, &candidates)
            .await
            .unwrap_or(0);
        let contexts = self
            .store
            .keyword_contexts(&request.user_id, book_id, &candidates, 10)
            .await
            .unwrap_or_default();

        let answer = format!("\"{term}\" kelimesi bu kitapta toplam {count} kez geçiyor.");
        Ok(Some(AnswerResponse {
            answer,
            sources: Vec::new(),
            metadata: json!({
                "status": "analytic",
                "analytics": {
                    "type": "word_count",
                    "term": term,
                    "count": count,
                    "match": "lemma",
                    "scope": "book_chunks",
                    "contexts": contexts,
                },
            }),
        }))
    }

    fn looks_underfilled(answer: &str, answer_mode: AnswerMode) -> bool {
        let trimmed = answer.trim();
        let normalized = trimmed.to_lowercase();
        let heading_count = trimmed.matches("## ").count();
        let paragraph_count = trimmed
            .split("\n\n")
            .filter(|p| !p.trim().is_empty())
            .count();

        trimmed.chars().count() < 520
            || paragraph_count < 2
            || (matches!(answer_mode, AnswerMode::Quote | AnswerMode::Hybrid) && heading_count < 2)
            || (normalized.contains("doğrudan tanımlar")
                && !normalized.contains("bağlamsal analiz")
                && !normalized.contains("bağlamsal kanıtlar"))
    }

    /// Full RAG generation pipeline with memory-layer support.
    pub async fn generate_answer(&self, request: &AnswerRequest) -> EngineResult<AnswerResponse> {
        if let Some(analytic) = self.try_analytic_short_circuit(request).await? {
            return Ok(analytic);
        }

        // 1. Retrieve context.
        let Some(ctx) = self.assembler.assemble(request).await? else {
            return Ok(AnswerResponse {
                answer: FAILED_ANSWER_TR.to_string(),
                sources: Vec::new(),
                metadata: json!({"status": "failed"}),
            });
        };

        let quote_target_count = self.compute_quote_target_count(ctx.confidence, ctx.chunks.len());
        let context_budget_applied =
            self.settings.l3_perf_context_budget_enabled && request.mode != AssemblyMode::Explorer;

        // 2. Build context string; SYNTHESIS additionally fans a graph-bridge
        // future with a tight budget.
        let bridge_handle = if ctx.mode == AnswerMode::Synthesis {
            let store = self.store.clone();
            let chunks = ctx.chunks.clone();
            Some(tokio::spawn(Self::graph_bridge_context(store, chunks)))
        } else {
            None
        };

        let evidence_meta = format!(
            "[SİSTEM NOTU: Kullanıcının kütüphanesinde '{}' ile ilgili toplam {} adet doğrudan not bulundu.]",
            ctx.keywords.join(", "),
            ctx.level_counts.a + ctx.level_counts.b
        );
        let (context_base, used_chunks) = build_epistemic_context(&ctx.chunks);
        let mut context_str = format!("{evidence_meta}\n\n{context_base}");

        let mut graph_bridge_attempted = false;
        let mut graph_bridge_used = false;
        let mut graph_bridge_timeout_triggered = false;
        if let Some(handle) = bridge_handle {
            graph_bridge_attempted = true;
            let bridge_timeout = Duration::from_millis(self.settings.search_graph_bridge_timeout_ms.max(50));
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(bridge_timeout, handle).await {
                Ok(Ok(insight)) if !insight.is_empty() => {
                    graph_bridge_used = true;
                    context_str = format!("{insight}\n\n{context_str}");
                }
                Ok(_) => {}
                Err(_) => {
                    abort_handle.abort();
                    graph_bridge_timeout_triggered = true;
                }
            }
        }

        // 3. Sources mirror the used chunks in their post-fusion order.
        let sources: Vec<SourceRef> = used_chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| SourceRef {
                id: i + 1,
                title: chunk.hit.title.clone(),
                page_number: chunk.hit.page_number.unwrap_or(0),
                content: chunk.hit.text.chars().take(SOURCE_SNIPPET_CHARS).collect(),
                score: chunk.hit.score,
            })
            .collect();

        // 4. Memory-augmented prompt with labelled zones.
        let history_str = request
            .chat_history
            .iter()
            .rev()
            .take(self.settings.chat_prompt_turns)
            .rev()
            .map(|turn| {
                let role = if turn.role == "user" { "Kullanıcı" } else { "Asistan" };
                format!("{role}: {}", turn.content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let full_context = build_memory_zones(
            request.session_summary.as_deref().unwrap_or(""),
            &history_str,
            &context_str,
        );

        let prompt = prompt_for_mode(
            ctx.mode,
            &full_context,
            &request.question,
            ctx.confidence,
            ctx.network.status,
            quote_target_count,
        );

        // 5. Routed generation with the fallback ladder.
        let mut route_mode = RouteMode::Default;
        let mut provider_hint = None;
        let mut allow_secondary_fallback = false;
        let mut model_name = self.llm.model_for_tier(ModelTier::Flash);
        if self.settings.llm_explorer_qwen_pilot_enabled {
            route_mode = RouteMode::ExplorerQwenPilot;
            provider_hint = Some(self.settings.llm_explorer_primary_provider.clone());
            model_name = self.settings.llm_explorer_primary_model.clone();
            allow_secondary_fallback = true;
        }

        let mut max_output_tokens: Option<u32> = None;
        let mut llm_timeout: Option<Duration> = None;
        let mut llm_generation_timeout_applied = false;
        if self.settings.l3_perf_output_budget_enabled && request.mode != AssemblyMode::Explorer {
            max_output_tokens = Some(self.settings.l3_perf_max_output_tokens_standard.max(128));
            llm_timeout = Some(Duration::from_secs(18));
            llm_generation_timeout_applied = true;
        }

        let opts = GenerateOptions {
            max_output_tokens,
            timeout: llm_timeout,
            provider_hint: provider_hint.clone(),
            allow_secondary_fallback,
            allow_pro_fallback: false,
            ..GenerateOptions::default()
        };
        let mut fallback_state = FallbackState::default();

        let generation = self
            .llm
            .generate(&model_name, &prompt, ModelTier::Flash, route_mode, &opts, &mut fallback_state)
            .await;

        let mut result: GenerateOutcome = match generation {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "answer generation failed");
                let mut metadata = serde_json::to_value(&ctx.metadata).unwrap_or_else(|_| json!({}));
                if let Value::Object(map) = &mut metadata {
                    map.insert("status".to_string(), json!("error"));
                    map.insert("error".to_string(), json!(err.to_string()));
                }
                return Ok(AnswerResponse {
                    answer: ERROR_ANSWER_TR.to_string(),
                    sources,
                    metadata,
                });
            }
        };
        let mut answer = if result.text.trim().is_empty() {
            EMPTY_ANSWER_TR.to_string()
        } else {
            result.text.clone()
        };

        // 6. Short-answer recovery: one richer re-invoke when underfilled.
        let mut short_answer_recovery_applied = false;
        if Self::looks_underfilled(&answer, ctx.mode) && request.mode != AssemblyMode::Explorer {
            let recovery_mode = if ctx.mode == AnswerMode::Hybrid {
                AnswerMode::Hybrid
            } else {
                AnswerMode::Synthesis
            };
            let mut recovery_prompt = prompt_for_mode(
                recovery_mode,
                &full_context,
                &request.question,
                ctx.confidence.max(4.0),
                ctx.network.status,
                quote_target_count,
            );
            recovery_prompt.push_str(
                "\n\nADDITIONAL REQUIREMENT:\n\
                 - Do not answer in a single paragraph.\n\
                 - Provide at least 3 substantial paragraphs.\n\
                 - Explain reasoning with concrete links to the provided context.\n",
            );
            let recovery_opts = GenerateOptions {
                max_output_tokens: Some(max_output_tokens.unwrap_or(0).max(1600)),
                timeout: llm_timeout.map(|_| Duration::from_secs(25)),
                provider_hint,
                allow_secondary_fallback,
                allow_pro_fallback: false,
                ..GenerateOptions::default()
            };

            match self
                .llm
                .generate(
                    &model_name,
                    &recovery_prompt,
                    ModelTier::Flash,
                    route_mode,
                    &recovery_opts,
                    &mut fallback_state,
                )
                .await
            {
                Ok(recovered) => {
                    let recovered_text = recovered.text.trim().to_string();
                    if recovered_text.chars().count() >= 260
                        && recovered_text.chars().count() > answer.trim().chars().count() + 40
                    {
                        answer = recovered_text;
                        result = recovered;
                        short_answer_recovery_applied = true;
                    }
                }
                Err(err) => warn!(error = %err, "short answer recovery skipped"),
            }
        }

        // 7. Metadata echo: upstream diagnostics + model/fallback/budget info.
        let mut metadata = serde_json::to_value(&ctx.metadata)?;
        if let Value::Object(map) = &mut metadata {
            map.insert("model_name".to_string(), json!(result.model_used.clone()));
            map.insert("model_tier".to_string(), json!(result.model_tier.as_str()));
            map.insert("provider_name".to_string(), json!(result.provider_name.clone()));
            map.insert("model_fallback_applied".to_string(), json!(result.fallback_applied));
            map.insert(
                "secondary_fallback_applied".to_string(),
                json!(result.secondary_fallback_applied),
            );
            map.insert("fallback_reason".to_string(), json!(result.fallback_reason));
            map.insert(
                "llm_generation_timeout_applied".to_string(),
                json!(llm_generation_timeout_applied),
            );
            map.insert("context_budget_applied".to_string(), json!(context_budget_applied));
            map.insert("quote_target_count".to_string(), json!(quote_target_count));
            map.insert(
                "short_answer_recovery_applied".to_string(),
                json!(short_answer_recovery_applied),
            );
            map.insert("graph_bridge_attempted".to_string(), json!(graph_bridge_attempted));
            map.insert("graph_bridge_used".to_string(), json!(graph_bridge_used));
            map.insert(
                "graph_bridge_timeout_triggered".to_string(),
                json!(graph_bridge_timeout_triggered),
            );
            map.insert("answer_mode".to_string(), json!(ctx.mode.as_str()));
            map.insert("intent".to_string(), json!(ctx.intent.as_str()));
            map.insert("confidence".to_string(), json!(ctx.confidence));
            map.insert(
                "network_status".to_string(),
                json!(ctx.network.status.as_str()),
            );
        }

        // Record the model that produced the final answer (best-effort).
        if let Some(log_id) = ctx.search_log_id {
            if let Err(err) = self.store.update_log_model(log_id, &result.model_used).await {
                warn!(error = %err, log_id, "failed to update model name on search log");
            }
        }

        Ok(AnswerResponse {
            answer,
            sources,
            metadata,
        })
    }

    /// Expose the assembled context for callers that run their own prompting.
    pub async fn rag_context(&self, request: &AnswerRequest) -> EngineResult<Option<RagContext>> {
        self.assembler.assemble(request).await
    }
}

/// Localised failure strings surfaced by the engine (for the request layer).
pub fn no_context_message() -> &'static str {
    FAILED_ANSWER_TR
}
