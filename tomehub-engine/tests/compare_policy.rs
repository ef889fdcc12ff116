//! Compare fan-out policy integration tests.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{MockStore, build_assembler, chunk};
use tomehub_core::Settings;
use tomehub_db::models::BookRef;
use tomehub_engine::context::{AnswerRequest, CompareMode, USER_NOTES_TARGET};

fn compare_settings() -> Settings {
    Settings {
        search_compare_policy_enabled: true,
        search_compare_target_max: 8,
        search_compare_primary_per_book: 6,
        search_compare_secondary_per_book: 2,
        search_compare_timeout_ms: 2500,
        ..Settings::default()
    }
}

fn compare_corpus() -> Vec<tomehub_db::models::ChunkHit> {
    let mut corpus = Vec::new();
    for (idx, book) in ["b1", "b2"].iter().enumerate() {
        for i in 0..3 {
            corpus.push(chunk(
                &format!("{}{}", 100 + idx * 10, i),
                book,
                &format!("{book}-kitap"),
                "PDF_CHUNK",
                &format!(
                    "Bu görüşü destekleyen uzun bir pasaj numara {i}; yazarın temel savı burada açıklanır ve gerekçelendirilir."
                ),
            ));
        }
        for i in 0..2 {
            corpus.push(chunk(
                &format!("{}{}", 200 + idx * 10, i),
                book,
                &format!("{book}-kitap"),
                "HIGHLIGHT",
                &format!(
                    "Bu görüşü öne çıkaran işaretli satır {i}; okurken aldığım kısa ama anlamlı bir vurgu cümlesidir."
                ),
            ));
        }
    }
    corpus
}

fn user_books() -> HashSet<String> {
    ["b1", "b2"].iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn compare_primary_first_and_secondary_ratio() {
    let store = Arc::new(MockStore {
        corpus: compare_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let assembler = build_assembler(compare_settings(), store);

    let mut request = AnswerRequest::new("bu görüşü diğer kitaplarla karşılaştır", "u1");
    request.compare_mode = Some(CompareMode::ExplicitOnly);
    request.target_book_ids = vec!["b1".to_string(), "b2".to_string()];

    let ctx = assembler.assemble(&request).await.unwrap().expect("context expected");

    assert!(ctx.metadata.compare_applied);
    assert_eq!(ctx.metadata.evidence_policy, "TEXT_PRIMARY_NOTES_SECONDARY_V1");
    assert_eq!(ctx.metadata.target_books_used, vec!["b1", "b2"]);
    assert!(ctx.metadata.unauthorized_target_book_ids.is_empty());

    let primaries: Vec<_> = ctx.chunks.iter().filter(|c| c.annotation.compare_primary).collect();
    let secondaries: Vec<_> = ctx.chunks.iter().filter(|c| c.annotation.compare_secondary).collect();
    assert!(!primaries.is_empty());
    assert!(secondaries.len() <= (primaries.len() / 3).max(1));

    // Ordering guarantee: every secondary comes after the last primary.
    if let Some(first_secondary) = ctx.chunks.iter().position(|c| c.annotation.compare_secondary) {
        assert!(
            ctx.chunks[..first_secondary]
                .iter()
                .all(|c| !c.annotation.compare_secondary)
        );
    }

    assert!(ctx.metadata.per_book_evidence_count.contains_key("b1"));
    assert!(ctx.metadata.per_book_evidence_count.contains_key("b2"));
}

#[tokio::test]
async fn unauthorized_targets_are_silently_dropped() {
    let store = Arc::new(MockStore {
        corpus: compare_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let assembler = build_assembler(compare_settings(), store);

    let mut request = AnswerRequest::new("bu görüşü diğer kitaplarla karşılaştır", "u1");
    request.compare_mode = Some(CompareMode::ExplicitOnly);
    request.target_book_ids = vec!["b1".to_string(), "intruder".to_string()];

    let ctx = assembler.assemble(&request).await.unwrap().expect("context expected");

    assert_eq!(ctx.metadata.unauthorized_target_book_ids, vec!["intruder"]);
    // Only one valid target left: the fan-out does not engage.
    assert!(!ctx.metadata.compare_applied);
}

#[tokio::test]
async fn compare_deadline_yields_partial_results() {
    let store = Arc::new(MockStore {
        corpus: compare_corpus(),
        user_books: user_books(),
        delay: Some(Duration::from_millis(60)),
        ..MockStore::default()
    });
    let settings = Settings {
        search_compare_timeout_ms: 50,
        ..compare_settings()
    };
    let assembler = build_assembler(settings, store);

    let mut request = AnswerRequest::new("bu görüşü diğer kitaplarla karşılaştır", "u1");
    request.compare_mode = Some(CompareMode::ExplicitOnly);
    request.target_book_ids = vec!["b1".to_string(), "b2".to_string()];

    let ctx = assembler.assemble(&request).await.unwrap().expect("context expected");

    assert!(ctx.metadata.latency_budget_hit);
    assert_eq!(ctx.metadata.compare_degrade_reason, "timeout_partial_results");
    // Only the first target completed before the deadline.
    assert_eq!(ctx.metadata.per_book_evidence_count.len(), 1);
    assert!(!ctx.chunks.is_empty());
}

#[tokio::test]
async fn targets_auto_resolve_from_question_titles() {
    let store = Arc::new(MockStore {
        corpus: compare_corpus(),
        user_books: user_books(),
        catalog: vec![
            BookRef {
                item_id: "b1".to_string(),
                title: "Vicdan Üzerine".to_string(),
                author: None,
            },
            BookRef {
                item_id: "b2".to_string(),
                title: "Medeniyet Tarihi".to_string(),
                author: None,
            },
        ],
        ..MockStore::default()
    });
    let assembler = build_assembler(compare_settings(), store);

    let request = AnswerRequest::new(
        "Vicdan Üzerine ve Medeniyet Tarihi kitaplarındaki görüşleri karşılaştır",
        "u1",
    );
    let ctx = assembler.assemble(&request).await.unwrap().expect("context expected");

    assert_eq!(
        ctx.metadata.auto_resolved_target_book_ids,
        vec!["b1".to_string(), "b2".to_string()]
    );
    assert!(ctx.metadata.target_books_used.contains(&"b1".to_string()));
    assert!(ctx.metadata.target_books_used.contains(&"b2".to_string()));
    assert!(ctx.metadata.compare_applied);
}

#[tokio::test]
async fn notes_mention_expands_to_book_plus_user_notes() {
    let store = Arc::new(MockStore {
        corpus: compare_corpus(),
        user_books: user_books(),
        ..MockStore::default()
    });
    let assembler = build_assembler(compare_settings(), store);

    let mut request = AnswerRequest::new("bu görüşü notlarımla karşılaştırır mısın", "u1");
    request.context_book_id = Some("b1".to_string());

    let ctx = assembler.assemble(&request).await.unwrap().expect("context expected");

    assert!(ctx.metadata.compare_applied);
    assert!(ctx.metadata.target_books_used.contains(&"b1".to_string()));
    assert!(ctx.metadata.target_books_used.contains(&USER_NOTES_TARGET.to_string()));
    assert_eq!(ctx.metadata.evidence_policy, "TEXT_PRIMARY_NOTES_SECONDARY_V1");

    let primaries = ctx.chunks.iter().filter(|c| c.annotation.compare_primary).count();
    let secondaries = ctx.chunks.iter().filter(|c| c.annotation.compare_secondary).count();
    assert!(primaries >= 1);
    assert!(secondaries <= (primaries / 3).max(1));
}

#[tokio::test]
async fn target_list_is_truncated_to_max() {
    let mut corpus = compare_corpus();
    let mut books = user_books();
    for i in 3..13 {
        let id = format!("b{i}");
        books.insert(id.clone());
        corpus.push(chunk(
            &format!("x{i}"),
            &id,
            &format!("{id}-kitap"),
            "PDF_CHUNK",
            "Bu görüşü içeren yeterince uzun bir pasaj; karşılaştırma kümesine girmeye aday bir metin parçası.",
        ));
    }
    let store = Arc::new(MockStore {
        corpus,
        user_books: books.clone(),
        ..MockStore::default()
    });
    let settings = Settings {
        search_compare_target_max: 4,
        ..compare_settings()
    };
    let assembler = build_assembler(settings, store);

    let mut request = AnswerRequest::new("bu görüşü diğer kitaplarla karşılaştır", "u1");
    request.compare_mode = Some(CompareMode::ExplicitOnly);
    request.target_book_ids = books.iter().cloned().collect();

    let ctx = assembler.assemble(&request).await.unwrap().expect("context expected");

    assert!(ctx.metadata.target_books_truncated);
    assert!(ctx.metadata.target_books_used.len() <= 4);
    // Invariant 5: used targets stay within the authorised set.
    for target in &ctx.metadata.target_books_used {
        assert!(books.contains(target));
    }
}
