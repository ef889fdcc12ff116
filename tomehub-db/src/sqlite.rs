//! SQLite-backed store implementation.
//!
//! Vector search runs through a `vec0` virtual table (sqlite-vec). KNN must
//! run in a CTE with `k = ?` because vec0 cannot see LIMIT through JOINs;
//! we overfetch in the CTE, then filter+limit in the outer query.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use libsqlite3_sys::{SQLITE_OK, sqlite3, sqlite3_api_routines, sqlite3_auto_extension};
use serde_json::Value;
use sqlite_vec::sqlite3_vec_init;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use tomehub_core::text::{content_hash, count_lemma_stem_hits, filter_query_lemmas, get_lemmas, normalize_match_text};

use crate::error::{DbError, DbResult};
use crate::models::{
    BookRef, ChunkHit, ChunkRecord, ExternalEdge, ExternalMeta, GraphHit, KwicContext,
    LengthFilter, LibraryItemRecord, ResourceType, SearchFilters, SearchLogEntry,
    VisibilityScope,
};
use crate::store::Store;

static SQLITE_VEC_INIT_RC: OnceLock<i32> = OnceLock::new();
static LAST_LOG_CLEANUP_TS: AtomicI64 = AtomicI64::new(0);

/// Default source types counted as book content.
pub const BOOK_SOURCE_TYPES: &[&str] = &["PDF", "EPUB", "PDF_CHUNK", "BOOK", "HIGHLIGHT", "INSIGHT", "NOTES"];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    retention_cleanup_enabled: bool,
    retention_days: u32,
}

#[derive(Clone)]
enum Arg {
    Text(String),
    Int(i64),
    Real(f64),
}

fn init_sqlite_vec_once() -> DbResult<()> {
    let rc = *SQLITE_VEC_INIT_RC.get_or_init(|| unsafe {
        type SqliteVecInitFn =
            unsafe extern "C" fn(*mut sqlite3, *mut *const i8, *const sqlite3_api_routines) -> i32;

        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), SqliteVecInitFn>(
            sqlite3_vec_init as *const (),
        )))
    });

    if rc == SQLITE_OK {
        Ok(())
    } else {
        Err(DbError::SqliteVec(format!("sqlite-vec init failed with code {rc}")))
    }
}

impl SqliteStore {
    pub async fn open(db_path: &Path, embedding_dim: usize) -> DbResult<Self> {
        init_sqlite_vec_once()?;
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA cache_size = -64000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        ensure_vec_tables(&pool, embedding_dim).await?;

        Ok(Self {
            pool,
            retention_cleanup_enabled: false,
            retention_days: 90,
        })
    }

    pub fn with_retention_cleanup(mut self, enabled: bool, days: u32) -> Self {
        self.retention_cleanup_enabled = enabled;
        self.retention_days = days;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Write contracts (ingestion / sync jobs) ─────────────────────

    pub async fn insert_library_item(&self, item: &LibraryItemRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO library_items (item_id, user_id, item_type, title, author, search_visibility, summary_text, tags_json)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id, item_id) DO UPDATE SET
                   item_type=excluded.item_type,
                   title=excluded.title,
                   author=excluded.author,
                   search_visibility=excluded.search_visibility,
                   summary_text=excluded.summary_text,
                   tags_json=excluded.tags_json"#,
        )
        .bind(&item.item_id)
        .bind(&item.user_id)
        .bind(&item.item_type)
        .bind(&item.title)
        .bind(&item.author)
        .bind(item.search_visibility.as_str())
        .bind(&item.summary_text)
        .bind(&item.tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_chunk(&self, record: &ChunkRecord) -> DbResult<i64> {
        let normalized = normalize_match_text(&record.text);
        let lemmas = filter_query_lemmas(&get_lemmas(&record.text));
        let lemma_json = serde_json::to_string(&lemmas)?;
        let hash = content_hash(&record.text);

        let result = sqlx::query(
            r#"INSERT INTO content (
                user_id, item_id, title, content_type, ingestion_type, content,
                normalized_content, lemma_tokens, page_number, chunk_index,
                comment_text, tags_json, rag_weight, ai_eligible, content_hash, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.user_id)
        .bind(&record.item_id)
        .bind(&record.title)
        .bind(record.content_type.to_uppercase())
        .bind(record.ingestion_type.to_uppercase())
        .bind(&record.text)
        .bind(&normalized)
        .bind(&lemma_json)
        .bind(record.page_number)
        .bind(record.chunk_index)
        .bind(&record.comment)
        .bind(&record.tags)
        .bind(record.rag_weight)
        .bind(record.ai_eligible as i64)
        .bind(&hash)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let chunk_id = result.last_insert_rowid();
        if let Some(vector) = &record.vector {
            let payload = serde_json::to_string(vector)?;
            sqlx::query("INSERT OR REPLACE INTO content_vec(rowid, embedding) VALUES (?, ?)")
                .bind(chunk_id)
                .bind(payload)
                .execute(&self.pool)
                .await?;
        }
        Ok(chunk_id)
    }

    pub async fn insert_concept(&self, name: &str, description: Option<&str>, vector: Option<&[f32]>) -> DbResult<i64> {
        sqlx::query(
            "INSERT INTO concepts (name, description) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET description=COALESCE(concepts.description, excluded.description)",
        )
        .bind(name)
        .bind(description)
        .execute(&self.pool)
        .await?;

        let (concept_id,): (i64,) = sqlx::query_as("SELECT id FROM concepts WHERE name = ? COLLATE NOCASE LIMIT 1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        if let Some(vec) = vector {
            let payload = serde_json::to_string(vec)?;
            sqlx::query("INSERT OR REPLACE INTO concept_vec(rowid, embedding) VALUES (?, ?)")
                .bind(concept_id)
                .bind(payload)
                .execute(&self.pool)
                .await?;
        }
        Ok(concept_id)
    }

    pub async fn link_concept_chunk(
        &self,
        concept_id: i64,
        content_id: i64,
        strength: Option<f64>,
        justification: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO concept_chunks (concept_id, content_id, strength, justification) VALUES (?, ?, ?, ?)",
        )
        .bind(concept_id)
        .bind(content_id)
        .bind(strength)
        .bind(justification)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_relation(&self, src_id: i64, dst_id: i64, rel_type: &str, weight: f64) -> DbResult<()> {
        sqlx::query("INSERT OR IGNORE INTO relations (src_id, dst_id, rel_type, weight) VALUES (?, ?, ?, ?)")
            .bind(src_id)
            .bind(dst_id)
            .bind(rel_type)
            .bind(weight.clamp(0.0, 1.0))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_external_entity(&self, provider: &str, external_id: &str, entity_type: &str, label: &str) -> DbResult<i64> {
        sqlx::query(
            "INSERT INTO external_entities (provider, external_id, entity_type, label) VALUES (?, ?, ?, ?)
             ON CONFLICT(provider, external_id) DO UPDATE SET label=excluded.label",
        )
        .bind(provider)
        .bind(external_id)
        .bind(entity_type)
        .bind(label)
        .execute(&self.pool)
        .await?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM external_entities WHERE provider = ? AND external_id = ?")
            .bind(provider)
            .bind(external_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_external_edge(
        &self,
        user_id: &str,
        item_id: &str,
        src_entity_id: i64,
        dst_entity_id: i64,
        rel_type: &str,
        weight: f64,
        provider: &str,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO external_edges (user_id, item_id, src_entity_id, dst_entity_id, rel_type, weight, provider, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(item_id)
        .bind(src_entity_id)
        .bind(dst_entity_id)
        .bind(rel_type)
        .bind(weight)
        .bind(provider)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_odl_shadow(&self, record: &ChunkRecord) -> DbResult<i64> {
        let normalized = normalize_match_text(&record.text);
        let lemmas = filter_query_lemmas(&get_lemmas(&record.text));
        let lemma_json = serde_json::to_string(&lemmas)?;
        let hash = content_hash(&record.text);
        let result = sqlx::query(
            r#"INSERT INTO odl_shadow (user_id, item_id, title, content, normalized_content, lemma_tokens, page_number, chunk_index, content_hash, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.user_id)
        .bind(&record.item_id)
        .bind(&record.title)
        .bind(&record.text)
        .bind(&normalized)
        .bind(&lemma_json)
        .bind(record.page_number)
        .bind(record.chunk_index)
        .bind(&hash)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_odl_shadow_status(&self, user_id: &str, item_id: &str, status: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO odl_shadow_status (user_id, item_id, status) VALUES (?, ?, ?)
             ON CONFLICT(user_id, item_id) DO UPDATE SET status=excluded.status",
        )
        .bind(user_id)
        .bind(item_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_external_meta(&self, user_id: &str, item_id: &str, meta: &ExternalMeta) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO external_meta (user_id, item_id, academic_scope, wikidata_qid, openalex_id, dbpedia_uri, orkg_id, doi, last_sync_at, sync_status)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id, item_id) DO UPDATE SET
                   academic_scope=excluded.academic_scope,
                   wikidata_qid=excluded.wikidata_qid,
                   openalex_id=excluded.openalex_id,
                   dbpedia_uri=excluded.dbpedia_uri,
                   orkg_id=excluded.orkg_id,
                   doi=excluded.doi,
                   last_sync_at=excluded.last_sync_at,
                   sync_status=excluded.sync_status"#,
        )
        .bind(user_id)
        .bind(item_id)
        .bind(meta.academic_scope as i64)
        .bind(&meta.wikidata_qid)
        .bind(&meta.openalex_id)
        .bind(&meta.dbpedia_uri)
        .bind(&meta.orkg_id)
        .bind(&meta.doi)
        .bind(Utc::now().to_rfc3339())
        .bind(&meta.sync_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Query assembly ──────────────────────────────────────────────

    fn base_hit_sql() -> String {
        r#"SELECT c.id, c.content, c.title, c.content_type, c.page_number, c.chunk_index,
                  c.tags_json, l.summary_text, c.comment_text, c.item_id, c.normalized_content
           FROM content c
           LEFT JOIN library_items l ON c.item_id = l.item_id AND c.user_id = l.user_id
           WHERE c.user_id = ? AND c.ai_eligible = 1"#
            .to_string()
    }

    fn apply_filters(sql: &mut String, args: &mut Vec<Arg>, filters: &SearchFilters) {
        match &filters.resource_type {
            Some(ResourceType::Book) => {
                sql.push_str(" AND c.content_type IN ('PDF','EPUB','PDF_CHUNK','BOOK','HIGHLIGHT','INSIGHT','NOTES')");
            }
            Some(ResourceType::AllNotes) => {
                sql.push_str(" AND c.content_type IN ('HIGHLIGHT','INSIGHT','NOTES')");
            }
            Some(ResourceType::PersonalNote) => {
                sql.push_str(" AND c.content_type = 'PERSONAL_NOTE'");
            }
            Some(rt @ (ResourceType::Article | ResourceType::Website | ResourceType::Raw(_))) => {
                sql.push_str(" AND c.content_type = ?");
                args.push(Arg::Text(rt.as_str().to_string()));
            }
            None => {}
        }

        if let Some(book_id) = filters.book_id.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            sql.push_str(" AND c.item_id = ?");
            args.push(Arg::Text(book_id.to_string()));
        }

        match filters.visibility_scope {
            VisibilityScope::All => {
                sql.push_str(" AND COALESCE(l.search_visibility, 'DEFAULT') <> 'NEVER_RETRIEVE'");
            }
            VisibilityScope::Default => {
                sql.push_str(" AND COALESCE(l.search_visibility, 'DEFAULT') = 'DEFAULT'");
            }
        }

        if let Some(ct) = filters.content_type.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            sql.push_str(" AND c.content_type = ?");
            args.push(Arg::Text(ct.to_uppercase()));
        }

        if let Some(it) = filters.ingestion_type.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
            sql.push_str(" AND c.ingestion_type = ?");
            args.push(Arg::Text(it.to_uppercase()));
        }

        // Scoped retrieval never hides PDF chunks in the first pass.
        if filters.exclude_pdf && !filters.scoped() {
            sql.push_str(" AND c.content_type NOT IN ('PDF','EPUB','PDF_CHUNK')");
        }

        match filters.length {
            Some(LengthFilter::Short) => sql.push_str(" AND length(c.content) < 600"),
            Some(LengthFilter::Long) => sql.push_str(" AND length(c.content) > 600"),
            None => {}
        }
    }

    async fn fetch_hits(&self, sql: &str, args: Vec<Arg>) -> DbResult<Vec<ChunkHit>> {
        type HitRow = (
            i64,
            String,
            String,
            String,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
        );
        let mut query = sqlx::query_as::<_, HitRow>(sql);
        for arg in &args {
            query = match arg {
                Arg::Text(s) => query.bind(s.clone()),
                Arg::Int(i) => query.bind(*i),
                Arg::Real(f) => query.bind(*f),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(id, content, title, source_type, page, idx, tags, summary, comment, book_id, normalized)| ChunkHit {
                id: id.to_string(),
                title,
                text: content,
                source_type,
                page_number: page,
                chunk_index: idx,
                tags,
                summary,
                comment,
                book_id,
                normalized_text: Some(normalized),
                score: 0.0,
                match_type: String::new(),
            })
            .collect())
    }

    fn escape_like(value: &str) -> String {
        value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    }

    fn candidate_limit(limit: usize) -> i64 {
        ((limit * 4).max(limit + 40)).min(2500) as i64
    }
}

async fn ensure_vec_tables(pool: &SqlitePool, embedding_dim: usize) -> DbResult<()> {
    for table in ["content_vec", "concept_vec"] {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(pool)
                .await?;
        if exists.is_none() {
            let create_sql = format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {table} USING vec0(embedding float[{embedding_dim}])"
            );
            sqlx::query(&create_sql).execute(pool).await?;
        }
    }
    sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding_dim', ?)")
        .bind(embedding_dim.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn search_exact(
        &self,
        user: &str,
        pattern: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        let mut sql = Self::base_hit_sql();
        let mut args = vec![Arg::Text(user.to_string())];
        Self::apply_filters(&mut sql, &mut args, filters);
        sql.push_str(" AND c.normalized_content LIKE ? ESCAPE '\\'");
        args.push(Arg::Text(format!("%{}%", Self::escape_like(pattern))));
        sql.push_str(" ORDER BY c.id DESC LIMIT ?");
        args.push(Arg::Int(Self::candidate_limit(limit)));
        self.fetch_hits(&sql, args).await
    }

    async fn search_exact_tokens(
        &self,
        user: &str,
        tokens: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = Self::base_hit_sql();
        let mut args = vec![Arg::Text(user.to_string())];
        Self::apply_filters(&mut sql, &mut args, filters);
        for token in tokens {
            sql.push_str(" AND c.normalized_content LIKE ? ESCAPE '\\'");
            args.push(Arg::Text(format!("%{}%", Self::escape_like(token))));
        }
        sql.push_str(" ORDER BY c.id DESC LIMIT ?");
        args.push(Arg::Int(Self::candidate_limit(limit)));
        self.fetch_hits(&sql, args).await
    }

    async fn search_lemma(
        &self,
        user: &str,
        lemmas: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        if lemmas.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = Self::base_hit_sql();
        let mut args = vec![Arg::Text(user.to_string())];
        Self::apply_filters(&mut sql, &mut args, filters);

        let conditions: Vec<&str> = lemmas.iter().map(|_| "c.lemma_tokens LIKE ?").collect();
        sql.push_str(&format!(" AND ({})", conditions.join(" OR ")));
        for lemma in lemmas {
            args.push(Arg::Text(format!("%\"{}\"%", lemma.replace('"', ""))));
        }
        sql.push_str(" ORDER BY c.id DESC LIMIT ?");
        args.push(Arg::Int(Self::candidate_limit(limit)));
        self.fetch_hits(&sql, args).await
    }

    async fn search_vector(
        &self,
        user: &str,
        query_vec: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        if query_vec.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let payload = serde_json::to_string(query_vec)?;
        let knn_k = (limit * 4).max(8) as i64;

        let mut sql = String::from(
            r#"WITH knn AS (SELECT rowid, distance FROM content_vec WHERE embedding MATCH ? AND k = ?)
               SELECT c.id, c.content, c.title, c.content_type, c.page_number, c.chunk_index,
                      c.tags_json, l.summary_text, c.comment_text, c.item_id,
                      (knn.distance / MAX(c.rag_weight, 0.0001)) as dist
               FROM knn
               JOIN content c ON c.id = knn.rowid
               LEFT JOIN library_items l ON c.item_id = l.item_id AND c.user_id = l.user_id
               WHERE c.user_id = ? AND c.ai_eligible = 1"#,
        );
        let mut args = vec![Arg::Text(payload), Arg::Int(knn_k), Arg::Text(user.to_string())];
        Self::apply_filters(&mut sql, &mut args, filters);
        sql.push_str(" ORDER BY dist ASC LIMIT ?");
        args.push(Arg::Int(limit as i64));

        type VecRow = (
            i64,
            String,
            String,
            String,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            f64,
        );
        let mut query = sqlx::query_as::<_, VecRow>(&sql);
        for arg in &args {
            query = match arg {
                Arg::Text(s) => query.bind(s.clone()),
                Arg::Int(i) => query.bind(*i),
                Arg::Real(f) => query.bind(*f),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(id, content, title, source_type, page, idx, tags, summary, comment, book_id, dist)| ChunkHit {
                id: id.to_string(),
                title,
                text: content,
                source_type,
                page_number: page,
                chunk_index: idx,
                tags,
                summary,
                comment,
                book_id,
                normalized_text: None,
                // Raw weighted distance; the semantic strategy maps it to a score.
                score: dist,
                match_type: String::new(),
            })
            .collect())
    }

    async fn graph_neighbors(
        &self,
        user: &str,
        seeds: &[i64],
        min_strength: f64,
        limit: usize,
        offset: usize,
    ) -> DbResult<Vec<GraphHit>> {
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = seeds.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            r#"SELECT DISTINCT c.id, c.content, c.title, c.content_type, c.page_number,
                      n.name, r.rel_type, r.weight, cc.strength
               FROM relations r
               JOIN concepts n ON (r.dst_id = n.id OR r.src_id = n.id)
               JOIN concept_chunks cc ON n.id = cc.concept_id
               JOIN content c ON cc.content_id = c.id
               WHERE (r.src_id IN ({placeholders}) OR r.dst_id IN ({placeholders}))
                 AND c.user_id = ? AND c.ai_eligible = 1
                 AND n.id NOT IN ({placeholders})
                 AND (cc.strength IS NULL OR cc.strength >= ?)
               LIMIT ? OFFSET ?"#
        );

        type GraphRow = (i64, String, String, String, Option<i64>, String, String, f64, Option<f64>);
        let mut query = sqlx::query_as::<_, GraphRow>(&sql);
        for seed in seeds {
            query = query.bind(seed);
        }
        for seed in seeds {
            query = query.bind(seed);
        }
        query = query.bind(user);
        for seed in seeds {
            query = query.bind(seed);
        }
        query = query.bind(min_strength).bind(limit as i64).bind(offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(content_id, text, title, source_type, page, related, rel_type, weight, strength)| GraphHit {
                content_id,
                title,
                text,
                source_type,
                page_number: page,
                related_concept: related,
                rel_type,
                weight,
                strength,
            })
            .collect())
    }

    async fn concepts_by_text(&self, needle: &str, limit: usize) -> DbResult<Vec<i64>> {
        let pattern = format!("%{}%", needle.trim().to_lowercase());
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM concepts WHERE LOWER(name) LIKE ? LIMIT ?")
            .bind(&pattern)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut ids: Vec<i64> = rows.into_iter().map(|(id,)| id).collect();

        let alias_rows: Vec<(i64,)> =
            sqlx::query_as("SELECT concept_id FROM concept_aliases WHERE LOWER(alias) LIKE ? LIMIT ?")
                .bind(&pattern)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
        ids.extend(alias_rows.into_iter().map(|(id,)| id));
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn concepts_by_names(&self, names: &[String]) -> DbResult<Vec<i64>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = names.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT id FROM concepts WHERE LOWER(name) IN ({placeholders})");
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for name in names {
            query = query.bind(name.trim().to_lowercase());
        }
        let mut ids: Vec<i64> = query.fetch_all(&self.pool).await?.into_iter().map(|(id,)| id).collect();

        let alias_sql = format!("SELECT concept_id FROM concept_aliases WHERE LOWER(alias) IN ({placeholders})");
        let mut alias_query = sqlx::query_as::<_, (i64,)>(&alias_sql);
        for name in names {
            alias_query = alias_query.bind(name.trim().to_lowercase());
        }
        ids.extend(alias_query.fetch_all(&self.pool).await?.into_iter().map(|(id,)| id));
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn concepts_by_vector(&self, query_vec: &[f32], limit: usize) -> DbResult<Vec<i64>> {
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }
        let payload = serde_json::to_string(query_vec)?;
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"WITH knn AS (SELECT rowid, distance FROM concept_vec WHERE embedding MATCH ? AND k = ?)
               SELECT rowid FROM knn ORDER BY distance ASC LIMIT ?"#,
        )
        .bind(&payload)
        .bind((limit * 2) as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn concept_links_for_chunks(&self, chunk_ids: &[i64]) -> DbResult<Vec<(i64, String, i64)>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = chunk_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            r#"SELECT cc.content_id, co.name, co.id
               FROM concepts co
               JOIN concept_chunks cc ON co.id = cc.concept_id
               WHERE cc.content_id IN ({placeholders})"#
        );
        let mut query = sqlx::query_as::<_, (i64, String, i64)>(&sql);
        for id in chunk_ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn concept_bridges(
        &self,
        concept_ids: &[i64],
        limit: usize,
    ) -> DbResult<Vec<(String, String, String)>> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = concept_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            r#"SELECT c1.name, r.rel_type, c2.name
               FROM relations r
               JOIN concepts c1 ON r.src_id = c1.id
               JOIN concepts c2 ON r.dst_id = c2.id
               WHERE r.src_id IN ({placeholders}) OR r.dst_id IN ({placeholders})
               LIMIT ?"#
        );
        let mut query = sqlx::query_as::<_, (String, String, String)>(&sql);
        for id in concept_ids {
            query = query.bind(id);
        }
        for id in concept_ids {
            query = query.bind(id);
        }
        query = query.bind(limit as i64);
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn external_edges(&self, user: &str, item_id: &str, limit: usize) -> DbResult<Vec<ExternalEdge>> {
        let rows: Vec<(String, f64, String, String, String)> = sqlx::query_as(
            r#"SELECT e.rel_type, e.weight, e.provider, src.label, dst.label
               FROM external_edges e
               JOIN external_entities src ON src.id = e.src_entity_id
               JOIN external_entities dst ON dst.id = e.dst_entity_id
               WHERE e.item_id = ? AND e.user_id = ?
               ORDER BY e.updated_at DESC
               LIMIT ?"#,
        )
        .bind(item_id)
        .bind(user)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(rel_type, weight, provider, src_label, dst_label)| ExternalEdge {
                rel_type,
                weight,
                provider,
                src_label,
                dst_label,
            })
            .collect())
    }

    async fn external_meta(&self, user: &str, item_id: &str) -> DbResult<ExternalMeta> {
        let row: Option<(i64, Option<String>, Option<String>, Option<String>, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(
                r#"SELECT academic_scope, wikidata_qid, openalex_id, dbpedia_uri, orkg_id, doi, sync_status
                   FROM external_meta WHERE user_id = ? AND item_id = ?"#,
            )
            .bind(user)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some((academic, qid, openalex, dbpedia, orkg, doi, status)) => ExternalMeta {
                academic_scope: academic != 0,
                wikidata_qid: qid,
                openalex_id: openalex,
                dbpedia_uri: dbpedia,
                orkg_id: orkg,
                doi,
                sync_status: status,
            },
            None => ExternalMeta::default(),
        })
    }

    async fn book_title_catalog(&self, user: &str) -> DbResult<Vec<BookRef>> {
        let mut out = Vec::new();
        let rows: Vec<(String, String, Option<String>)> =
            sqlx::query_as("SELECT item_id, title, author FROM library_items WHERE user_id = ?")
                .bind(user)
                .fetch_all(&self.pool)
                .await?;
        for (item_id, title, author) in rows {
            out.push(BookRef { item_id, title, author });
        }

        // Chunk titles supplement the catalog for items missing a library row.
        let content_rows: Vec<(String, String)> = sqlx::query_as(
            r#"SELECT DISTINCT c.item_id, c.title
               FROM content c
               WHERE c.user_id = ? AND c.item_id IS NOT NULL
                 AND c.content_type IN ('PDF','EPUB','PDF_CHUNK','HIGHLIGHT')"#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        for (item_id, title) in content_rows {
            if !out.iter().any(|b| b.item_id == item_id && b.title == title) {
                out.push(BookRef { item_id, title, author: None });
            }
        }
        Ok(out)
    }

    async fn user_book_ids(&self, user: &str) -> DbResult<HashSet<String>> {
        let placeholders = BOOK_SOURCE_TYPES.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT DISTINCT item_id FROM content WHERE user_id = ? AND item_id IS NOT NULL AND content_type IN ({placeholders})"
        );
        let mut query = sqlx::query_as::<_, (String,)>(&sql).bind(user);
        for st in BOOK_SOURCE_TYPES {
            query = query.bind(*st);
        }
        Ok(query.fetch_all(&self.pool).await?.into_iter().map(|(id,)| id).collect())
    }

    async fn odl_shadow_candidates(
        &self,
        user: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> DbResult<Vec<ChunkHit>> {
        let mut sql = String::from(
            r#"SELECT s.id, s.content, s.title, s.page_number, s.chunk_index, s.normalized_content, s.item_id, s.content_hash
               FROM odl_shadow s
               LEFT JOIN library_items l ON s.item_id = l.item_id AND s.user_id = l.user_id
               WHERE s.user_id = ?
                 AND EXISTS (
                     SELECT 1 FROM odl_shadow_status st
                     WHERE st.user_id = s.user_id AND st.item_id = s.item_id AND st.status = 'READY'
                 )"#,
        );
        let mut args = vec![Arg::Text(user.to_string())];
        if let Some(book_id) = filters.book_id.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            sql.push_str(" AND s.item_id = ?");
            args.push(Arg::Text(book_id.to_string()));
        }
        match filters.visibility_scope {
            VisibilityScope::All => {
                sql.push_str(" AND COALESCE(l.search_visibility, 'DEFAULT') <> 'NEVER_RETRIEVE'");
            }
            VisibilityScope::Default => {
                sql.push_str(" AND COALESCE(l.search_visibility, 'DEFAULT') = 'DEFAULT'");
            }
        }
        sql.push_str(
            " ORDER BY s.created_at DESC, COALESCE(s.page_number, 0), COALESCE(s.chunk_index, 0) LIMIT ?",
        );
        args.push(Arg::Int(limit as i64));

        type ShadowRow = (i64, String, String, Option<i64>, Option<i64>, String, String, String);
        let mut query = sqlx::query_as::<_, ShadowRow>(&sql);
        for arg in &args {
            query = match arg {
                Arg::Text(s) => query.bind(s.clone()),
                Arg::Int(i) => query.bind(*i),
                Arg::Real(f) => query.bind(*f),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(id, content, title, page, idx, normalized, item_id, _hash)| ChunkHit {
                id: format!("odl:{id}"),
                title,
                text: content,
                source_type: "ODL_SHADOW".to_string(),
                page_number: page,
                chunk_index: idx,
                tags: None,
                summary: None,
                comment: None,
                book_id: Some(item_id),
                normalized_text: Some(normalized),
                score: 0.0,
                match_type: String::new(),
            })
            .collect())
    }

    async fn count_term_occurrences(
        &self,
        user: &str,
        book_id: &str,
        candidates: &[String],
    ) -> DbResult<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let placeholders = BOOK_SOURCE_TYPES.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let mut sql = format!(
            "SELECT normalized_content FROM content WHERE user_id = ? AND item_id = ? AND content_type IN ({placeholders}) AND ("
        );
        let conds: Vec<&str> = candidates.iter().map(|_| "instr(normalized_content, ?) > 0").collect();
        sql.push_str(&conds.join(" OR "));
        sql.push(')');

        let mut query = sqlx::query_as::<_, (String,)>(&sql).bind(user).bind(book_id);
        for st in BOOK_SOURCE_TYPES {
            query = query.bind(*st);
        }
        for candidate in candidates {
            query = query.bind(normalize_match_text(candidate));
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut total = 0usize;
        for (normalized,) in rows {
            total += count_lemma_stem_hits(&normalized, candidates);
        }
        Ok(total)
    }

    async fn keyword_contexts(
        &self,
        user: &str,
        book_id: &str,
        candidates: &[String],
        limit: usize,
    ) -> DbResult<Vec<KwicContext>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = BOOK_SOURCE_TYPES.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let mut sql = format!(
            "SELECT content, page_number, normalized_content FROM content WHERE user_id = ? AND item_id = ? AND content_type IN ({placeholders}) AND ("
        );
        let conds: Vec<&str> = candidates.iter().map(|_| "instr(normalized_content, ?) > 0").collect();
        sql.push_str(&conds.join(" OR "));
        sql.push_str(") LIMIT ?");

        let mut query = sqlx::query_as::<_, (String, Option<i64>, String)>(&sql).bind(user).bind(book_id);
        for st in BOOK_SOURCE_TYPES {
            query = query.bind(*st);
        }
        for candidate in candidates {
            query = query.bind(normalize_match_text(candidate));
        }
        query = query.bind(limit as i64);
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::new();
        for (content, page, _normalized) in rows {
            let lowered = content.to_lowercase();
            for candidate in candidates {
                let needle = candidate.to_lowercase();
                if let Some(pos) = lowered.find(&needle) {
                    // Dynamic windowing around the hit (±150 chars on char boundaries).
                    let start = content
                        .char_indices()
                        .map(|(i, _)| i)
                        .filter(|&i| i <= pos.saturating_sub(150).max(0))
                        .next_back()
                        .unwrap_or(0);
                    let end_target = (pos + needle.len() + 150).min(content.len());
                    let end = content
                        .char_indices()
                        .map(|(i, _)| i)
                        .find(|&i| i >= end_target)
                        .unwrap_or(content.len());
                    let snippet = content[start..end].trim().to_string();
                    out.push(KwicContext { page_number: page, snippet });
                    break;
                }
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn log_search(&self, entry: &SearchLogEntry) -> DbResult<Option<i64>> {
        let strategy_json = serde_json::to_string(&entry.strategy_details)?;
        let inserted = sqlx::query(
            r#"INSERT INTO search_logs
               (user_id, session_id, query_text, intent, rrf_weights, top_result_id, top_result_score, execution_time_ms, strategy_details, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.user_id)
        .bind(&entry.session_id)
        .bind(&entry.query)
        .bind(&entry.intent)
        .bind(&entry.rrf_weights)
        .bind(&entry.top_result_id)
        .bind(entry.top_result_score)
        .bind(entry.execution_time_ms)
        .bind(&strategy_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        let result = match inserted {
            Ok(res) => res,
            Err(err) if err.to_string().contains("strategy_details") => {
                // Schema drift: older deployments miss the diagnostics column.
                warn!(error = %err, "search log downgraded to reduced-column insert");
                sqlx::query(
                    r#"INSERT INTO search_logs
                       (user_id, session_id, query_text, intent, rrf_weights, top_result_id, top_result_score, execution_time_ms, created_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(&entry.user_id)
                .bind(&entry.session_id)
                .bind(&entry.query)
                .bind(&entry.intent)
                .bind(&entry.rrf_weights)
                .bind(&entry.top_result_id)
                .bind(entry.top_result_score)
                .bind(entry.execution_time_ms)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?
            }
            Err(err) => return Err(err.into()),
        };

        let log_id = result.last_insert_rowid();

        if self.retention_cleanup_enabled {
            let now = Utc::now().timestamp();
            let last = LAST_LOG_CLEANUP_TS.load(Ordering::Relaxed);
            if now - last > 3600 {
                LAST_LOG_CLEANUP_TS.store(now, Ordering::Relaxed);
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
                if let Err(err) = sqlx::query("DELETE FROM search_logs WHERE created_at < ?")
                    .bind(cutoff.to_rfc3339())
                    .execute(&self.pool)
                    .await
                {
                    warn!(error = %err, "search log retention cleanup failed");
                } else {
                    info!(days = self.retention_days, "search log retention cleanup ran");
                }
            }
        }

        Ok(Some(log_id))
    }

    async fn append_log_diagnostics(&self, log_id: i64, diagnostics: &Value) -> DbResult<()> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT strategy_details FROM search_logs WHERE id = ?")
                .bind(log_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((existing,)) = row else {
            return Ok(());
        };

        let mut payload: Value = existing
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let (Value::Object(target), Value::Object(extra)) = (&mut payload, diagnostics) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }

        sqlx::query("UPDATE search_logs SET strategy_details = ? WHERE id = ?")
            .bind(serde_json::to_string(&payload)?)
            .bind(log_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_log_model(&self, log_id: i64, model_name: &str) -> DbResult<()> {
        sqlx::query("UPDATE search_logs SET model_name = ? WHERE id = ?")
            .bind(model_name)
            .bind(log_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchLogEntry;
    use crate::test_helpers::{axis_vector, create_test_store, seed_fixture_corpus, seed_fixture_graph, TEST_USER};

    fn default_filters() -> SearchFilters {
        SearchFilters::default()
    }

    #[tokio::test]
    async fn visibility_scope_default_hides_excluded_items() {
        let fixture = create_test_store().await.unwrap();
        seed_fixture_corpus(&fixture.store).await.unwrap();

        let hits = fixture
            .store
            .search_exact(TEST_USER, "vicdan", &default_filters(), 50)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.book_id.as_deref() != Some("p1")));

        let all_scope = SearchFilters {
            visibility_scope: VisibilityScope::All,
            ..Default::default()
        };
        let hits_all = fixture
            .store
            .search_exact(TEST_USER, "vicdan", &all_scope, 50)
            .await
            .unwrap();
        assert!(hits_all.iter().any(|h| h.book_id.as_deref() == Some("p1")));
    }

    #[tokio::test]
    async fn exact_search_matches_deaccented_text() {
        let fixture = create_test_store().await.unwrap();
        seed_fixture_corpus(&fixture.store).await.unwrap();

        let hits = fixture
            .store
            .search_exact(TEST_USER, "kufur", &default_filters(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Küfür"));
    }

    #[tokio::test]
    async fn lemma_search_requires_quoted_token() {
        let fixture = create_test_store().await.unwrap();
        seed_fixture_corpus(&fixture.store).await.unwrap();

        // `medeniyet` contains `niyet` as an inner substring, but the quoted
        // JSON token match must not return it.
        let hits = fixture
            .store
            .search_lemma(TEST_USER, &["niyet".to_string()], &default_filters(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = fixture
            .store
            .search_lemma(TEST_USER, &["medeniyet".to_string()], &default_filters(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn vector_search_orders_by_weighted_distance() {
        let fixture = create_test_store().await.unwrap();
        seed_fixture_corpus(&fixture.store).await.unwrap();

        let hits = fixture
            .store
            .search_vector(TEST_USER, &axis_vector(0), &default_filters(), 3)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].text.starts_with("Vicdan"));
        // Raw weighted distances come back ascending.
        for pair in hits.windows(2) {
            assert!(pair[0].score <= pair[1].score);
        }
    }

    #[tokio::test]
    async fn graph_neighbors_traverses_one_hop() {
        let fixture = create_test_store().await.unwrap();
        seed_fixture_corpus(&fixture.store).await.unwrap();
        seed_fixture_graph(&fixture.store).await.unwrap();

        let seeds = fixture.store.concepts_by_text("vicdan", 5).await.unwrap();
        assert!(!seeds.is_empty());
        let neighbors = fixture
            .store
            .graph_neighbors(TEST_USER, &seeds, 0.1, 10, 0)
            .await
            .unwrap();
        assert!(!neighbors.is_empty());
        assert!(neighbors.iter().all(|n| n.weight > 0.0));
    }

    #[tokio::test]
    async fn search_log_roundtrip_and_diagnostics_merge() {
        let fixture = create_test_store().await.unwrap();

        let entry = SearchLogEntry {
            user_id: TEST_USER.to_string(),
            session_id: None,
            query: "vicdan nedir".to_string(),
            intent: "DIRECT".to_string(),
            rrf_weights: "fusion:concat, vec:1.0, bm25:1.0, graph:1.0".to_string(),
            top_result_id: Some("1".to_string()),
            top_result_score: 100.0,
            execution_time_ms: 12.0,
            strategy_details: serde_json::json!({"router_reason": "intent=DIRECT"}),
        };
        let log_id = fixture.store.log_search(&entry).await.unwrap().unwrap();

        fixture
            .store
            .append_log_diagnostics(log_id, &serde_json::json!({"graph_timeout_triggered": true}))
            .await
            .unwrap();
        fixture.store.update_log_model(log_id, "gemini-2.5-flash").await.unwrap();

        let (details, model): (String, String) =
            sqlx::query_as("SELECT strategy_details, model_name FROM search_logs WHERE id = ?")
                .bind(log_id)
                .fetch_one(fixture.store.pool())
                .await
                .unwrap();
        let parsed: Value = serde_json::from_str(&details).unwrap();
        assert_eq!(parsed["router_reason"], "intent=DIRECT");
        assert_eq!(parsed["graph_timeout_triggered"], true);
        assert_eq!(model, "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn term_occurrences_and_contexts() {
        let fixture = create_test_store().await.unwrap();
        seed_fixture_corpus(&fixture.store).await.unwrap();

        let candidates = vec!["vicdan".to_string()];
        let count = fixture
            .store
            .count_term_occurrences(TEST_USER, "b1", &candidates)
            .await
            .unwrap();
        assert!(count >= 2);

        let contexts = fixture
            .store
            .keyword_contexts(TEST_USER, "b1", &candidates, 5)
            .await
            .unwrap();
        assert!(!contexts.is_empty());
        assert!(contexts[0].snippet.to_lowercase().contains("vicdan"));
    }

    #[tokio::test]
    async fn user_book_ids_and_catalog() {
        let fixture = create_test_store().await.unwrap();
        seed_fixture_corpus(&fixture.store).await.unwrap();

        let books = fixture.store.user_book_ids(TEST_USER).await.unwrap();
        assert!(books.contains("b1"));
        assert!(books.contains("b2"));
        assert!(!books.contains("p1"));

        let catalog = fixture.store.book_title_catalog(TEST_USER).await.unwrap();
        assert!(catalog.iter().any(|b| b.item_id == "b1" && b.title == "Vicdan Üzerine"));
    }
}
