//! Deterministic store fixtures for integration tests.

use tempfile::TempDir;

use crate::error::DbResult;
use crate::models::{ChunkRecord, LibraryItemRecord, SearchVisibility};
use crate::sqlite::SqliteStore;

/// A file-backed store living in a temp directory for the test's lifetime.
pub struct TestStore {
    pub store: SqliteStore,
    _dir: TempDir,
}

pub const TEST_USER: &str = "u1";
pub const TEST_EMBEDDING_DIM: usize = 8;

pub async fn create_test_store() -> DbResult<TestStore> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("tomehub-test.db");
    let store = SqliteStore::open(&db_path, TEST_EMBEDDING_DIM).await?;
    Ok(TestStore { store, _dir: dir })
}

/// A unit vector along one of the fixture axes.
pub fn axis_vector(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; TEST_EMBEDDING_DIM];
    v[axis % TEST_EMBEDDING_DIM] = 1.0;
    v
}

/// Seed the deterministic 4-item corpus used across the test suites.
///
/// - `b1` book with a definitional `vicdan` chunk, a `küfür` chunk and a
///   highlight;
/// - `b2` book whose only chunk talks about `medeniyet` (never `niyet`);
/// - `p1` personal-note item excluded from the default scope;
/// - `w1` website item with a short placeholder body.
pub async fn seed_fixture_corpus(store: &SqliteStore) -> DbResult<()> {
    store
        .insert_library_item(&LibraryItemRecord {
            author: Some("A. Yazar".to_string()),
            ..LibraryItemRecord::book(TEST_USER, "b1", "Vicdan Üzerine")
        })
        .await?;
    store
        .insert_library_item(&LibraryItemRecord {
            author: Some("B. Yazar".to_string()),
            ..LibraryItemRecord::book(TEST_USER, "b2", "Medeniyet Tarihi")
        })
        .await?;
    store
        .insert_library_item(&LibraryItemRecord {
            item_type: "PERSONAL_NOTE".to_string(),
            search_visibility: SearchVisibility::ExcludedByDefault,
            ..LibraryItemRecord::book(TEST_USER, "p1", "Kişisel Defter")
        })
        .await?;
    store
        .insert_library_item(&LibraryItemRecord {
            item_type: "WEBSITE".to_string(),
            ..LibraryItemRecord::book(TEST_USER, "w1", "website deneme")
        })
        .await?;

    let chunks = vec![
        ChunkRecord {
            page_number: Some(12),
            vector: Some(axis_vector(0)),
            ..ChunkRecord::new(
                TEST_USER,
                "b1",
                "Vicdan Üzerine",
                "PDF_CHUNK",
                "Vicdan, insanın içindeki ahlaki yargı gücüdür ve iyi ile kötüyü ayırt etmemizi sağlar. \
                 Bu güç bazı düşünürlere göre doğuştan gelir.",
            )
        },
        ChunkRecord {
            page_number: Some(45),
            vector: Some(axis_vector(1)),
            ..ChunkRecord::new(
                TEST_USER,
                "b1",
                "Vicdan Üzerine",
                "PDF_CHUNK",
                "Küfür etmek, toplumsal nezaket kurallarının dışına çıkmaktır ve çoğu kültürde hoş karşılanmaz.",
            )
        },
        ChunkRecord {
            page_number: Some(45),
            comment: Some("çok önemli bir pasaj".to_string()),
            vector: Some(axis_vector(2)),
            ..ChunkRecord::new(
                TEST_USER,
                "b1",
                "Vicdan Üzerine",
                "HIGHLIGHT",
                "Bence vicdan değişmez bir pusuladır; insanı her durumda doğruya yöneltir.",
            )
        },
        ChunkRecord {
            page_number: Some(3),
            vector: Some(axis_vector(3)),
            ..ChunkRecord::new(
                TEST_USER,
                "b2",
                "Medeniyet Tarihi",
                "PDF_CHUNK",
                "Medeniyet tarihi boyunca şehirler, yazı ve hukuk kurumları birlikte gelişmiştir. \
                 Medeniyetler arası etkileşim kültürü zenginleştirir.",
            )
        },
        ChunkRecord {
            ingestion_type: "MANUAL".to_string(),
            vector: Some(axis_vector(4)),
            ..ChunkRecord::new(
                TEST_USER,
                "p1",
                "Kişisel Defter",
                "PERSONAL_NOTE",
                "Bugün okuduğum bölümde vicdan kavramının toplumsal yönü beni etkiledi; kendi notlarımı ekliyorum.",
            )
        },
        ChunkRecord {
            ingestion_type: "WEB".to_string(),
            vector: Some(axis_vector(5)),
            ..ChunkRecord::new(TEST_USER, "w1", "website deneme", "WEBSITE", "website deneme sayfasi")
        },
    ];
    for chunk in &chunks {
        store.insert_chunk(chunk).await?;
    }

    Ok(())
}

/// Seed a small concept graph linking `vicdan` and `ahlak` to b1 chunks.
pub async fn seed_fixture_graph(store: &SqliteStore) -> DbResult<()> {
    let vicdan = store
        .insert_concept("vicdan", Some("ahlaki yargı gücü"), Some(&axis_vector(0)))
        .await?;
    let ahlak = store
        .insert_concept("ahlak", Some("davranış kuralları bütünü"), Some(&axis_vector(1)))
        .await?;
    store.insert_relation(vicdan, ahlak, "RELATED_TO", 0.9).await?;
    store.insert_relation(ahlak, vicdan, "DEFINES", 0.95).await?;

    // Link both concepts to the first two b1 chunks.
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM content WHERE item_id = 'b1' ORDER BY id LIMIT 2")
        .fetch_all(store.pool())
        .await?;
    for (idx, (content_id,)) in rows.iter().enumerate() {
        let concept = if idx == 0 { ahlak } else { vicdan };
        store
            .link_concept_chunk(concept, *content_id, Some(0.8), Some("fixture link"))
            .await?;
    }
    Ok(())
}
