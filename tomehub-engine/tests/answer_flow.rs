//! Answer engine integration tests: analytic short-circuit, quote-mode
//! answers, the fallback ladder and short-answer recovery.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{MockStore, RecordingProvider, build_assembler, build_router, chunk, rich_answer};
use tomehub_core::Settings;
use tomehub_engine::answer::AnswerEngine;
use tomehub_engine::context::AnswerRequest;

fn definitional_corpus() -> Vec<tomehub_db::models::ChunkHit> {
    vec![
        chunk(
            "1",
            "b1",
            "Adalet Kitabı",
            "PDF_CHUNK",
            "Adalet, herkese hak ettiğini vermek demektir ve toplum düzeninin temelidir; \
             bu tanım antik çağdan beri tartışılır.",
        ),
        chunk(
            "2",
            "b1",
            "Adalet Kitabı",
            "HIGHLIGHT",
            "Adalet kavramı hukuk sisteminin merkezinde yer alır ve yargıçların pusulasıdır; \
             adaletsizlik toplumsal güveni aşındırır.",
        ),
        chunk(
            "3",
            "b1",
            "Adalet Kitabı",
            "PDF_CHUNK",
            "Adalet duygusu çocuklukta gelişir; paylaşma ve eşitlik deneyimleri bu duyguyu biçimlendirir \
             ve yetişkinlikte pekişir.",
        ),
    ]
}

fn user_books() -> HashSet<String> {
    ["b1"].iter().map(|s| s.to_string()).collect()
}

fn engine_with(
    settings: Settings,
    store: Arc<MockStore>,
    gemini: Arc<RecordingProvider>,
    qwen: Arc<RecordingProvider>,
) -> AnswerEngine {
    let assembler = build_assembler(settings.clone(), store.clone());
    let router = build_router(&settings, gemini, qwen);
    AnswerEngine::new(Arc::new(settings), store, assembler, router)
}

#[tokio::test]
async fn analytic_short_circuit_skips_the_llm() {
    let store = Arc::new(MockStore {
        corpus: definitional_corpus(),
        user_books: user_books(),
        term_count: 3,
        ..MockStore::default()
    });
    let gemini = Arc::new(RecordingProvider::new("gemini", vec![]));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![]));
    let engine = engine_with(Settings::default(), store, gemini.clone(), qwen.clone());

    let mut request = AnswerRequest::new("adalet kelimesi kaç kez geçiyor?", "u1");
    request.context_book_id = Some("b1".to_string());

    let response = engine.generate_answer(&request).await.unwrap();

    assert_eq!(gemini.call_count(), 0);
    assert_eq!(qwen.call_count(), 0);
    assert_eq!(response.metadata["status"], "analytic");
    assert_eq!(response.metadata["analytics"]["count"], 3);
    assert!(response.answer.contains("3 kez"));
    assert!(response.sources.is_empty());
}

#[tokio::test]
async fn analytic_without_book_asks_for_one() {
    let store = Arc::new(MockStore::default());
    let gemini = Arc::new(RecordingProvider::new("gemini", vec![]));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![]));
    let engine = engine_with(Settings::default(), store, gemini.clone(), qwen);

    let request = AnswerRequest::new("adalet kelimesi kaç kez geçiyor?", "u1");
    let response = engine.generate_answer(&request).await.unwrap();

    assert_eq!(gemini.call_count(), 0);
    assert_eq!(response.metadata["status"], "analytic");
    assert_eq!(response.metadata["analytics"]["error"], "book_id_required");
}

#[tokio::test]
async fn direct_definitional_question_quotes_with_required_headings() {
    let store = Arc::new(MockStore {
        corpus: definitional_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let gemini = Arc::new(RecordingProvider::new("gemini", vec![Ok(rich_answer())]));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![]));
    let engine = engine_with(Settings::default(), store, gemini.clone(), qwen);

    let request = AnswerRequest::new("adalet nedir", "u1");
    let response = engine.generate_answer(&request).await.unwrap();

    assert_eq!(response.metadata["answer_mode"], "QUOTE");
    assert_eq!(response.metadata["intent"], "DIRECT");
    assert!(response.answer.contains("## Doğrudan Tanımlar"));
    assert!(response.answer.contains("## Bağlamsal Analiz"));
    assert!(!response.sources.is_empty());
    // The sources mirror the used chunks in order.
    assert_eq!(response.sources[0].id, 1);

    let prompts = gemini.recorded_prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("## Doğrudan Tanımlar"));
    assert!(prompts[0].contains("KAYNAK DOKÜMANLAR (FOUND EVIDENCE)"));
    assert!(prompts[0].contains("adalet nedir"));
}

#[tokio::test]
async fn quote_target_count_follows_confidence_tiers() {
    let store = Arc::new(MockStore {
        corpus: definitional_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let settings = Settings {
        llm_quote_dynamic_count_enabled: true,
        ..Settings::default()
    };
    let gemini = Arc::new(RecordingProvider::new("gemini", vec![Ok(rich_answer())]));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![]));
    let engine = engine_with(settings, store, gemini, qwen);

    let request = AnswerRequest::new("adalet nedir", "u1");
    let response = engine.generate_answer(&request).await.unwrap();

    let count = response.metadata["quote_target_count"].as_u64().unwrap();
    assert!((2..=5).contains(&count));
    let confidence = response.metadata["confidence"].as_f64().unwrap();
    assert!(confidence >= 0.5 && confidence <= 5.0);
}

#[tokio::test]
async fn explorer_pilot_falls_back_to_secondary_provider() {
    let store = Arc::new(MockStore {
        corpus: definitional_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let settings = Settings {
        llm_explorer_qwen_pilot_enabled: true,
        llm_explorer_primary_provider: "qwen".to_string(),
        llm_explorer_primary_model: "qwen-explorer".to_string(),
        llm_explorer_fallback_provider: "gemini".to_string(),
        ..Settings::default()
    };
    let gemini = Arc::new(RecordingProvider::new("gemini", vec![Ok(rich_answer())]));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![Err(429)]));
    let engine = engine_with(settings, store, gemini.clone(), qwen.clone());

    let request = AnswerRequest::new("adalet nedir", "u1");
    let response = engine.generate_answer(&request).await.unwrap();

    assert_eq!(qwen.call_count(), 1);
    assert_eq!(gemini.call_count(), 1);
    assert_eq!(response.metadata["secondary_fallback_applied"], true);
    assert_eq!(response.metadata["fallback_reason"], "qwen_retryable_error");
    assert_eq!(response.metadata["provider_name"], "gemini");
}

#[tokio::test]
async fn short_answer_triggers_one_recovery_pass() {
    let store = Arc::new(MockStore {
        corpus: definitional_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let gemini = Arc::new(RecordingProvider::new(
        "gemini",
        vec![Ok("Çok kısa cevap.".to_string()), Ok(rich_answer())],
    ));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![]));
    let engine = engine_with(Settings::default(), store, gemini.clone(), qwen);

    let request = AnswerRequest::new("adalet nedir", "u1");
    let response = engine.generate_answer(&request).await.unwrap();

    assert_eq!(gemini.call_count(), 2);
    assert_eq!(response.metadata["short_answer_recovery_applied"], true);
    assert!(response.answer.contains("## Bağlamsal Analiz"));
}

#[tokio::test]
async fn empty_corpus_surfaces_no_context_message() {
    let store = Arc::new(MockStore::default());
    let gemini = Arc::new(RecordingProvider::new("gemini", vec![]));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![]));
    let engine = engine_with(Settings::default(), store, gemini.clone(), qwen);

    let request = AnswerRequest::new("hiç olmayan bir konu hakkında soru", "u1");
    let response = engine.generate_answer(&request).await.unwrap();

    assert_eq!(gemini.call_count(), 0);
    assert_eq!(response.metadata["status"], "failed");
    assert_eq!(response.answer, tomehub_engine::answer::no_context_message());
}

#[tokio::test]
async fn llm_failure_returns_error_string_with_sources() {
    let store = Arc::new(MockStore {
        corpus: definitional_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let gemini = Arc::new(RecordingProvider::new("gemini", vec![Err(400)]));
    let qwen = Arc::new(RecordingProvider::new("qwen", vec![]));
    let engine = engine_with(Settings::default(), store, gemini, qwen);

    let request = AnswerRequest::new("adalet nedir", "u1");
    let response = engine.generate_answer(&request).await.unwrap();

    assert_eq!(response.answer, "Bir hata oluştu.");
    assert_eq!(response.metadata["status"], "error");
    assert!(!response.sources.is_empty());
}
