//! Persistence and similarity search for documents, chunks, and FAQ entries.
//!
//! Two search strategies are selected once at startup by probing the
//! backend for the sqlite-vec extension:
//!
//! - **Native-index mode** — KNN queries against `vec0` virtual tables
//!   using the engine's cosine distance operator (`similarity = 1 -
//!   distance`). Preferred beyond trivial dataset sizes.
//! - **In-memory fallback mode** — loads a bounded working set of active
//!   rows and computes cosine similarity per candidate in Rust. Zero
//!   infrastructure dependency, used when the extension is absent.
//!
//! The float BLOB columns on `chunks` and `faq_entries` are the source of
//! truth either way; the `vec0` tables are a best-effort acceleration layer
//! synced after each store.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    ChunkRecord, DocumentInput, FaqInput, KnowledgeStats, SearchResult, SourceType,
};

/// Cap on the working set loaded by the in-memory fallback strategy.
const FALLBACK_SCAN_LIMIT: i64 = 1000;

/// Options for a chunk search.
#[derive(Debug, Clone)]
pub struct ChunkFilter {
    pub top_k: usize,
    pub min_score: f64,
    pub sources: Option<Vec<SourceType>>,
}

pub struct VectorStore {
    pool: SqlitePool,
    dims: usize,
    vector_index: bool,
    strategy: Box<dyn SearchStrategy>,
}

impl VectorStore {
    /// Build the store over an existing pool, probing once for native
    /// vector-index capability. The capability flag is set only here.
    pub async fn connect(pool: SqlitePool, dims: usize) -> Self {
        let vector_index = probe_vector_index(&pool, dims).await;
        let strategy: Box<dyn SearchStrategy> = if vector_index {
            Box::new(NativeIndexSearch { dims })
        } else {
            Box::new(InMemorySearch { dims })
        };

        Self {
            pool,
            dims,
            vector_index,
            strategy,
        }
    }

    pub fn vector_index_enabled(&self) -> bool {
        self.vector_index
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn search_chunks(
        &self,
        query: &[f32],
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult>> {
        self.strategy.search_chunks(&self.pool, query, filter).await
    }

    pub async fn search_faqs(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        self.strategy
            .search_faqs(&self.pool, query, top_k, min_score)
            .await
    }

    /// True when no document exists for `(source, source_id)` or the stored
    /// content hash differs. This is the single re-indexing decision point
    /// for the whole pipeline.
    pub async fn needs_reindex(
        &self,
        source: SourceType,
        source_id: &str,
        content_hash: &str,
    ) -> Result<bool> {
        let stored: Option<String> = sqlx::query_scalar(
            "SELECT content_hash FROM documents WHERE source = ? AND source_id = ?",
        )
        .bind(source.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match stored {
            Some(hash) => hash != content_hash,
            None => true,
        })
    }

    /// Id of the document identified by `(source, source_id)`, if stored.
    pub async fn find_document_id(
        &self,
        source: SourceType,
        source_id: &str,
    ) -> Result<Option<String>> {
        let id = sqlx::query_scalar("SELECT id FROM documents WHERE source = ? AND source_id = ?")
            .bind(source.as_str())
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Upsert the document row and replace its full chunk set in one
    /// transaction, so concurrent readers never observe a partial chunk set.
    ///
    /// The native vector index is synced afterwards as a best-effort
    /// secondary step; its failure is logged but does not fail the store.
    pub async fn store_document(
        &self,
        doc: &DocumentInput,
        content_hash: &str,
        chunks: &[ChunkRecord],
    ) -> Result<String> {
        let now = chrono::Utc::now().timestamp();

        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source = ? AND source_id = ?")
                .bind(doc.source.as_str())
                .bind(&doc.source_id)
                .fetch_optional(&self.pool)
                .await?;
        let doc_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source, source_id, title, content, content_hash, is_active, indexed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(source, source_id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                content_hash = excluded.content_hash,
                is_active = 1,
                indexed_at = excluded.indexed_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc_id)
        .bind(doc.source.as_str())
        .bind(&doc.source_id)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(content_hash)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let old_chunk_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
                .bind(&doc_id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;

        let mut new_chunks: Vec<(String, Vec<f32>)> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let chunk_id = Uuid::new_v4().to_string();
            let metadata = chunk
                .metadata
                .as_ref()
                .map(|m| m.to_string());

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, content, chunk_index, start_char, end_char, embedding, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk_id)
            .bind(&doc_id)
            .bind(&chunk.content)
            .bind(chunk.chunk_index)
            .bind(chunk.start_char)
            .bind(chunk.end_char)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(metadata)
            .execute(&mut *tx)
            .await?;

            new_chunks.push((chunk_id, chunk.embedding.clone()));
        }

        tx.commit().await?;

        if self.vector_index {
            if let Err(e) = self.sync_chunk_index(&old_chunk_ids, &new_chunks).await {
                eprintln!("Warning: vector index sync failed: {}", e);
            }
        }

        Ok(doc_id)
    }

    /// Upsert a FAQ entry. A supplied id updates the existing row; absent
    /// id inserts a new one.
    pub async fn store_faq(&self, faq: &FaqInput, embedding: &[f32]) -> Result<String> {
        let faq_id = faq
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let keywords_json = serde_json::to_string(&faq.keywords)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO faq_entries (id, question, answer, category, keywords_json, priority, embedding, is_active, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(id) DO UPDATE SET
                question = excluded.question,
                answer = excluded.answer,
                category = excluded.category,
                keywords_json = excluded.keywords_json,
                priority = excluded.priority,
                embedding = excluded.embedding,
                is_active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&faq_id)
        .bind(&faq.question)
        .bind(&faq.answer)
        .bind(&faq.category)
        .bind(&keywords_json)
        .bind(faq.priority)
        .bind(vec_to_blob(embedding))
        .bind(now)
        .execute(&self.pool)
        .await?;

        if self.vector_index {
            if let Err(e) = self.sync_faq_index(&faq_id, embedding).await {
                eprintln!("Warning: vector index sync failed: {}", e);
            }
        }

        Ok(faq_id)
    }

    /// Reset the content hash of every document under `source` to the empty
    /// sentinel, forcing `needs_reindex` to return true on the next pass.
    pub async fn reset_source_hashes(&self, source: SourceType) -> Result<u64> {
        let result = sqlx::query("UPDATE documents SET content_hash = '' WHERE source = ?")
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete a document and cascade to its chunks.
    pub async fn delete_document(&self, source: SourceType, source_id: &str) -> Result<bool> {
        let doc_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source = ? AND source_id = ?")
                .bind(source.as_str())
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(doc_id) = doc_id else {
            return Ok(false);
        };

        let old_chunk_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
                .bind(&doc_id)
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if self.vector_index {
            if let Err(e) = self.sync_chunk_index(&old_chunk_ids, &[]).await {
                eprintln!("Warning: vector index sync failed: {}", e);
            }
        }

        Ok(true)
    }

    /// Bulk-convert stored float BLOBs into the native vector index.
    /// Fails loudly when native vector support is unavailable.
    pub async fn migrate_to_vector(&self) -> Result<u64> {
        if !self.vector_index {
            bail!("Native vector index unavailable: sqlite-vec extension not loaded");
        }

        let mut migrated = 0u64;

        let chunk_rows = sqlx::query("SELECT id, embedding FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        for row in &chunk_rows {
            let id: String = row.get("id");
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            if vector.len() != self.dims {
                eprintln!(
                    "Warning: skipping chunk {} with dimension {} (index expects {})",
                    id,
                    vector.len(),
                    self.dims
                );
                continue;
            }
            sqlx::query("DELETE FROM chunk_index WHERE chunk_id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            sqlx::query("INSERT INTO chunk_index (chunk_id, embedding) VALUES (?, ?)")
                .bind(&id)
                .bind(vec_to_blob(&vector))
                .execute(&self.pool)
                .await?;
            migrated += 1;
        }

        let faq_rows = sqlx::query("SELECT id, embedding FROM faq_entries")
            .fetch_all(&self.pool)
            .await?;
        for row in &faq_rows {
            let id: String = row.get("id");
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            if vector.len() != self.dims {
                eprintln!(
                    "Warning: skipping FAQ {} with dimension {} (index expects {})",
                    id,
                    vector.len(),
                    self.dims
                );
                continue;
            }
            sqlx::query("DELETE FROM faq_index WHERE faq_id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            sqlx::query("INSERT INTO faq_index (faq_id, embedding) VALUES (?, ?)")
                .bind(&id)
                .bind(vec_to_blob(&vector))
                .execute(&self.pool)
                .await?;
            migrated += 1;
        }

        Ok(migrated)
    }

    pub async fn stats(&self) -> Result<KnowledgeStats> {
        let total_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let total_faqs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM faq_entries WHERE is_active = 1")
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS doc_count FROM documents GROUP BY source ORDER BY doc_count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_source = rows
            .iter()
            .map(|row| (row.get::<String, _>("source"), row.get::<i64, _>("doc_count")))
            .collect();

        Ok(KnowledgeStats {
            total_documents,
            total_chunks,
            total_faqs,
            by_source,
            vector_index_enabled: self.vector_index,
        })
    }

    async fn sync_chunk_index(
        &self,
        old_ids: &[String],
        new_chunks: &[(String, Vec<f32>)],
    ) -> Result<()> {
        for id in old_ids {
            sqlx::query("DELETE FROM chunk_index WHERE chunk_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        for (id, vector) in new_chunks {
            if vector.len() != self.dims {
                eprintln!(
                    "Warning: skipping chunk {} with dimension {} (index expects {})",
                    id,
                    vector.len(),
                    self.dims
                );
                continue;
            }
            sqlx::query("INSERT INTO chunk_index (chunk_id, embedding) VALUES (?, ?)")
                .bind(id)
                .bind(vec_to_blob(vector))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn sync_faq_index(&self, faq_id: &str, embedding: &[f32]) -> Result<()> {
        sqlx::query("DELETE FROM faq_index WHERE faq_id = ?")
            .bind(faq_id)
            .execute(&self.pool)
            .await?;
        if embedding.len() == self.dims {
            sqlx::query("INSERT INTO faq_index (faq_id, embedding) VALUES (?, ?)")
                .bind(faq_id)
                .bind(vec_to_blob(embedding))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

/// Probe for the sqlite-vec extension and create the `vec0` tables when it
/// is present. Returns the capability flag used for strategy selection.
async fn probe_vector_index(pool: &SqlitePool, dims: usize) -> bool {
    let version: Result<String, sqlx::Error> = sqlx::query_scalar("SELECT vec_version()")
        .fetch_one(pool)
        .await;

    if version.is_err() {
        return false;
    }

    let chunk_ddl = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunk_index USING vec0(chunk_id TEXT PRIMARY KEY, embedding FLOAT[{}] distance_metric=cosine)",
        dims
    );
    let faq_ddl = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS faq_index USING vec0(faq_id TEXT PRIMARY KEY, embedding FLOAT[{}] distance_metric=cosine)",
        dims
    );

    for ddl in [chunk_ddl, faq_ddl] {
        if let Err(e) = sqlx::query(&ddl).execute(pool).await {
            eprintln!("Warning: could not create vector index table: {}", e);
            return false;
        }
    }

    true
}

// ============ Search strategies ============

#[async_trait]
trait SearchStrategy: Send + Sync {
    async fn search_chunks(
        &self,
        pool: &SqlitePool,
        query: &[f32],
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult>>;

    async fn search_faqs(
        &self,
        pool: &SqlitePool,
        query: &[f32],
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>>;
}

/// KNN against the sqlite-vec virtual tables.
struct NativeIndexSearch {
    dims: usize,
}

#[async_trait]
impl SearchStrategy for NativeIndexSearch {
    async fn search_chunks(
        &self,
        pool: &SqlitePool,
        query: &[f32],
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.dims {
            bail!(
                "Query embedding dimension {} does not match index dimension {}",
                query.len(),
                self.dims
            );
        }

        // Over-fetch in the KNN subquery: activity and source filters apply
        // after the nearest-neighbor scan.
        let knn_k = (filter.top_k * 4).max(filter.top_k) as i64;
        let max_distance = 1.0 - filter.min_score;

        let source_clause = match &filter.sources {
            Some(sources) if !sources.is_empty() => {
                let names: Vec<String> = sources
                    .iter()
                    .map(|s| format!("'{}'", s.as_str()))
                    .collect();
                format!("AND d.source IN ({})", names.join(", "))
            }
            _ => String::new(),
        };

        let sql = format!(
            r#"
            SELECT k.chunk_id, k.distance, c.content, c.metadata_json,
                   d.title, d.source, d.source_id
            FROM (
                SELECT chunk_id, distance FROM chunk_index
                WHERE embedding MATCH ? AND k = ?
            ) k
            JOIN chunks c ON c.id = k.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE d.is_active = 1 AND k.distance <= ? {}
            ORDER BY k.distance ASC
            LIMIT ?
            "#,
            source_clause
        );

        let rows = sqlx::query(&sql)
            .bind(vec_to_blob(query))
            .bind(knn_k)
            .bind(max_distance)
            .bind(filter.top_k as i64)
            .fetch_all(pool)
            .await?;

        let results = rows
            .iter()
            .map(|row| {
                let distance: f64 = row.get("distance");
                let source: String = row.get("source");
                let metadata = row
                    .get::<Option<String>, _>("metadata_json")
                    .and_then(|m| serde_json::from_str(&m).ok());
                SearchResult {
                    id: row.get("chunk_id"),
                    content: row.get("content"),
                    score: 1.0 - distance,
                    source: SourceType::parse(&source).unwrap_or(SourceType::Custom),
                    source_ref: row.get("source_id"),
                    title: row.get("title"),
                    metadata,
                }
            })
            .collect();

        Ok(results)
    }

    async fn search_faqs(
        &self,
        pool: &SqlitePool,
        query: &[f32],
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.dims {
            bail!(
                "Query embedding dimension {} does not match index dimension {}",
                query.len(),
                self.dims
            );
        }

        let knn_k = (top_k * 4).max(top_k) as i64;
        let max_distance = 1.0 - min_score;

        let rows = sqlx::query(
            r#"
            SELECT k.faq_id, k.distance, f.question, f.answer, f.category,
                   f.keywords_json, f.priority
            FROM (
                SELECT faq_id, distance FROM faq_index
                WHERE embedding MATCH ? AND k = ?
            ) k
            JOIN faq_entries f ON f.id = k.faq_id
            WHERE f.is_active = 1 AND k.distance <= ?
            ORDER BY k.distance ASC, f.priority DESC
            LIMIT ?
            "#,
        )
        .bind(vec_to_blob(query))
        .bind(knn_k)
        .bind(max_distance)
        .bind(top_k as i64)
        .fetch_all(pool)
        .await?;

        let results = rows.iter().map(faq_row_to_result).collect();
        Ok(results)
    }
}

/// Brute-force cosine over a bounded working set of active rows.
struct InMemorySearch {
    dims: usize,
}

#[async_trait]
impl SearchStrategy for InMemorySearch {
    async fn search_chunks(
        &self,
        pool: &SqlitePool,
        query: &[f32],
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.dims {
            bail!(
                "Query embedding dimension {} does not match expected dimension {}",
                query.len(),
                self.dims
            );
        }

        let source_clause = match &filter.sources {
            Some(sources) if !sources.is_empty() => {
                let names: Vec<String> = sources
                    .iter()
                    .map(|s| format!("'{}'", s.as_str()))
                    .collect();
                format!("AND d.source IN ({})", names.join(", "))
            }
            _ => String::new(),
        };

        let sql = format!(
            r#"
            SELECT c.id, c.content, c.embedding, c.metadata_json,
                   d.title, d.source, d.source_id
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.is_active = 1 {}
            LIMIT ?
            "#,
            source_clause
        );

        let rows = sqlx::query(&sql)
            .bind(FALLBACK_SCAN_LIMIT)
            .fetch_all(pool)
            .await?;

        let mut results: Vec<SearchResult> = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            if blob.is_empty() {
                continue;
            }
            let vector = blob_to_vec(&blob);
            if vector.len() != query.len() {
                continue;
            }
            let score = cosine_similarity(query, &vector)? as f64;
            if score < filter.min_score {
                continue;
            }

            let source: String = row.get("source");
            let metadata = row
                .get::<Option<String>, _>("metadata_json")
                .and_then(|m| serde_json::from_str(&m).ok());
            results.push(SearchResult {
                id: row.get("id"),
                content: row.get("content"),
                score,
                source: SourceType::parse(&source).unwrap_or(SourceType::Custom),
                source_ref: row.get("source_id"),
                title: row.get("title"),
                metadata,
            });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(filter.top_k);
        Ok(results)
    }

    async fn search_faqs(
        &self,
        pool: &SqlitePool,
        query: &[f32],
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.dims {
            bail!(
                "Query embedding dimension {} does not match expected dimension {}",
                query.len(),
                self.dims
            );
        }

        let rows = sqlx::query(
            r#"
            SELECT id AS faq_id, question, answer, category, keywords_json,
                   priority, embedding
            FROM faq_entries
            WHERE is_active = 1
            LIMIT ?
            "#,
        )
        .bind(FALLBACK_SCAN_LIMIT)
        .fetch_all(pool)
        .await?;

        let mut scored: Vec<(SearchResult, i64)> = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            if blob.is_empty() {
                continue;
            }
            let vector = blob_to_vec(&blob);
            if vector.len() != query.len() {
                continue;
            }
            let score = cosine_similarity(query, &vector)? as f64;
            if score < min_score {
                continue;
            }

            let priority: i64 = row.get("priority");
            let mut result = faq_row_to_result(row);
            result.score = score;
            scored.push((result, priority));
        }

        // Priority breaks ties between equally-similar entries
        scored.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        scored.truncate(top_k);
        Ok(scored.into_iter().map(|(r, _)| r).collect())
    }
}

/// Map a FAQ row to the unified result shape: the answer is the retrievable
/// content, the question becomes the title.
fn faq_row_to_result(row: &sqlx::sqlite::SqliteRow) -> SearchResult {
    let keywords: serde_json::Value = row
        .get::<Option<String>, _>("keywords_json")
        .and_then(|k| serde_json::from_str(&k).ok())
        .unwrap_or_else(|| serde_json::json!([]));
    let category: Option<String> = row.get("category");
    let priority: i64 = row.get("priority");

    let distance: Option<f64> = row.try_get("distance").ok();
    let score = distance.map(|d| 1.0 - d).unwrap_or(0.0);

    SearchResult {
        id: row.get("faq_id"),
        content: row.get("answer"),
        score,
        source: SourceType::Faq,
        source_ref: row.get("faq_id"),
        title: Some(row.get("question")),
        metadata: Some(serde_json::json!({
            "category": category,
            "keywords": keywords,
            "priority": priority,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::pseudo_embedding;
    use crate::migrate::apply_schema;
    use tempfile::TempDir;

    const DIMS: usize = 64;

    async fn test_store() -> (TempDir, VectorStore) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        (tmp, VectorStore::connect(pool, DIMS).await)
    }

    fn doc(source_id: &str, content: &str) -> DocumentInput {
        DocumentInput {
            source: SourceType::Docs,
            source_id: source_id.to_string(),
            title: Some(format!("Title {}", source_id)),
            content: content.to_string(),
            metadata: None,
        }
    }

    fn chunk(content: &str, index: i64) -> ChunkRecord {
        ChunkRecord {
            content: content.to_string(),
            chunk_index: index,
            start_char: 0,
            end_char: content.len() as i64,
            embedding: pseudo_embedding(content, DIMS),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_needs_reindex_decision() {
        let (_tmp, store) = test_store().await;

        assert!(store
            .needs_reindex(SourceType::Docs, "d1", "hash-a")
            .await
            .unwrap());

        store
            .store_document(&doc("d1", "content"), "hash-a", &[chunk("content", 0)])
            .await
            .unwrap();

        assert!(!store
            .needs_reindex(SourceType::Docs, "d1", "hash-a")
            .await
            .unwrap());
        assert!(store
            .needs_reindex(SourceType::Docs, "d1", "hash-b")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_store_document_replaces_chunks() {
        let (_tmp, store) = test_store().await;

        let id1 = store
            .store_document(
                &doc("d1", "v1"),
                "h1",
                &[chunk("first", 0), chunk("second", 1), chunk("third", 2)],
            )
            .await
            .unwrap();

        let id2 = store
            .store_document(&doc("d1", "v2"), "h2", &[chunk("replacement", 0)])
            .await
            .unwrap();

        // Same logical document keeps its id across re-ingests
        assert_eq!(id1, id2);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(&id1)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(docs, 1);
    }

    #[tokio::test]
    async fn test_search_chunks_ranks_by_similarity() {
        let (_tmp, store) = test_store().await;

        store
            .store_document(
                &doc("d1", "body"),
                "h1",
                &[
                    chunk("how to create an invoice for a client", 0),
                    chunk("scheduling field technicians on a map", 1),
                ],
            )
            .await
            .unwrap();

        let query = pseudo_embedding("how to create an invoice for a client", DIMS);
        let results = store
            .search_chunks(
                &query,
                &ChunkFilter {
                    top_k: 5,
                    min_score: 0.2,
                    sources: None,
                },
            )
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].content, "how to create an invoice for a client");
        assert!((results[0].score - 1.0).abs() < 1e-5);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_search_chunks_source_filter() {
        let (_tmp, store) = test_store().await;

        store
            .store_document(&doc("d1", "a"), "h1", &[chunk("shared topic text", 0)])
            .await
            .unwrap();
        let help_doc = DocumentInput {
            source: SourceType::HelpCenter,
            source_id: "h1".to_string(),
            title: None,
            content: "b".to_string(),
            metadata: None,
        };
        store
            .store_document(&help_doc, "h2", &[chunk("shared topic text", 0)])
            .await
            .unwrap();

        let query = pseudo_embedding("shared topic text", DIMS);
        let results = store
            .search_chunks(
                &query,
                &ChunkFilter {
                    top_k: 10,
                    min_score: 0.0,
                    sources: Some(vec![SourceType::HelpCenter]),
                },
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, SourceType::HelpCenter);
    }

    #[tokio::test]
    async fn test_search_respects_min_score_and_top_k() {
        let (_tmp, store) = test_store().await;

        let chunks: Vec<ChunkRecord> = (0..6)
            .map(|i| chunk(&format!("unrelated content number {}", i), i))
            .collect();
        store
            .store_document(&doc("d1", "body"), "h1", &chunks)
            .await
            .unwrap();

        let query = pseudo_embedding("unrelated content number 0", DIMS);

        let all = store
            .search_chunks(
                &query,
                &ChunkFilter {
                    top_k: 3,
                    min_score: -1.0,
                    sources: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let strict = store
            .search_chunks(
                &query,
                &ChunkFilter {
                    top_k: 10,
                    min_score: 0.999,
                    sources: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);
    }

    #[tokio::test]
    async fn test_faq_upsert_and_search() {
        let (_tmp, store) = test_store().await;

        let faq = FaqInput {
            id: None,
            question: "How do I reset my password?".to_string(),
            answer: "Use the forgot password link on the login screen.".to_string(),
            category: Some("account".to_string()),
            keywords: vec!["password".to_string()],
            priority: 5,
        };
        let embedding = pseudo_embedding(&faq.question, DIMS);
        let id = store.store_faq(&faq, &embedding).await.unwrap();

        // Upsert with explicit id updates in place
        let updated = FaqInput {
            id: Some(id.clone()),
            answer: "Ask an administrator to reset it.".to_string(),
            ..faq.clone()
        };
        let id2 = store.store_faq(&updated, &embedding).await.unwrap();
        assert_eq!(id, id2);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM faq_entries")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let query = pseudo_embedding("How do I reset my password?", DIMS);
        let results = store.search_faqs(&query, 5, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, SourceType::Faq);
        assert_eq!(
            results[0].content,
            "Ask an administrator to reset it."
        );
        assert_eq!(
            results[0].title.as_deref(),
            Some("How do I reset my password?")
        );
    }

    #[tokio::test]
    async fn test_faq_priority_breaks_ties() {
        let (_tmp, store) = test_store().await;

        // Identical questions produce identical similarity; priority decides.
        let embedding = pseudo_embedding("same question", DIMS);
        for (priority, answer) in [(1, "low"), (9, "high")] {
            let faq = FaqInput {
                id: None,
                question: "same question".to_string(),
                answer: answer.to_string(),
                category: None,
                keywords: vec![],
                priority,
            };
            store.store_faq(&faq, &embedding).await.unwrap();
        }

        let results = store
            .search_faqs(&pseudo_embedding("same question", DIMS), 2, 0.0)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "high");
    }

    #[tokio::test]
    async fn test_reset_source_hashes() {
        let (_tmp, store) = test_store().await;

        store
            .store_document(&doc("d1", "x"), "h1", &[chunk("x", 0)])
            .await
            .unwrap();
        store
            .store_document(&doc("d2", "y"), "h2", &[chunk("y", 0)])
            .await
            .unwrap();

        let reset = store.reset_source_hashes(SourceType::Docs).await.unwrap();
        assert_eq!(reset, 2);
        assert!(store
            .needs_reindex(SourceType::Docs, "d1", "h1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_document_cascades() {
        let (_tmp, store) = test_store().await;

        store
            .store_document(&doc("d1", "x"), "h1", &[chunk("x", 0), chunk("y", 1)])
            .await
            .unwrap();

        assert!(store
            .delete_document(SourceType::Docs, "d1")
            .await
            .unwrap());
        assert!(!store
            .delete_document(SourceType::Docs, "d1")
            .await
            .unwrap());

        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(chunks, 0);
    }

    #[tokio::test]
    async fn test_migrate_to_vector_requires_native_index() {
        let (_tmp, store) = test_store().await;
        // The extension is not loaded in tests, so this must fail loudly.
        assert!(!store.vector_index_enabled());
        assert!(store.migrate_to_vector().await.is_err());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (_tmp, store) = test_store().await;

        store
            .store_document(&doc("d1", "x"), "h1", &[chunk("x", 0), chunk("y", 1)])
            .await
            .unwrap();
        let faq = FaqInput {
            id: None,
            question: "q".to_string(),
            answer: "a".to_string(),
            category: None,
            keywords: vec![],
            priority: 0,
        };
        store
            .store_faq(&faq, &pseudo_embedding("q", DIMS))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_documents, 1);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_faqs, 1);
        assert_eq!(stats.by_source, vec![("docs".to_string(), 1)]);
    }
}
