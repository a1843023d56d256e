//! Content-addressed embedding cache with TTL expiry and bounded size.
//!
//! Entries are keyed by a SHA-256 hash of the lower-cased, trimmed source
//! text, so identical queries hit the same row regardless of surrounding
//! whitespace or casing. The cache is a best-effort optimization layer, not
//! a correctness dependency: every read/write failure is recovered locally
//! (logged, treated as a miss or no-op) and never reaches the caller.
//!
//! When disabled via config, every operation is a no-op behind the same
//! interface — callers never special-case the disabled mode.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::CacheConfig;
use crate::embedding::{blob_to_vec, vec_to_blob};

/// A cache hit: the stored vector and the model that produced it.
#[derive(Debug, Clone)]
pub struct CachedEmbedding {
    pub embedding: Vec<f32>,
    pub model: String,
}

/// Summary counters for `kb cache stats`.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_entries: i64,
    pub total_hits: i64,
    pub oldest_entry: Option<i64>,
    pub newest_entry: Option<i64>,
}

#[derive(Clone)]
pub struct EmbeddingCache {
    pool: SqlitePool,
    config: CacheConfig,
}

impl EmbeddingCache {
    pub fn new(pool: SqlitePool, config: CacheConfig) -> Self {
        Self { pool, config }
    }

    /// Cache key: SHA-256 over normalized (lower-cased, trimmed) text.
    pub fn cache_key(text: &str) -> String {
        let normalized = text.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a single text. Returns `None` on miss, expiry, disabled
    /// cache, or any storage error.
    ///
    /// A hit bumps the entry's hit counter and last-accessed time in a
    /// detached task so the caller's critical path never waits on the
    /// bookkeeping write.
    pub async fn get(&self, text: &str) -> Option<CachedEmbedding> {
        if !self.config.enabled {
            return None;
        }

        let key = Self::cache_key(text);
        let now = now_ms();

        let row = sqlx::query(
            "SELECT embedding, model FROM embedding_cache WHERE text_hash = ? AND expires_at > ?",
        )
        .bind(&key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => {
                self.touch_detached(key);
                let blob: Vec<u8> = row.get("embedding");
                Some(CachedEmbedding {
                    embedding: blob_to_vec(&blob),
                    model: row.get("model"),
                })
            }
            Ok(None) => None,
            Err(e) => {
                eprintln!("Warning: embedding cache read failed: {}", e);
                None
            }
        }
    }

    /// Batch lookup. The returned map only contains entries for hits, keyed
    /// by the original text.
    pub async fn get_many(&self, texts: &[String]) -> HashMap<String, CachedEmbedding> {
        let mut hits = HashMap::new();
        if !self.config.enabled || texts.is_empty() {
            return hits;
        }

        let now = now_ms();
        for text in texts {
            let key = Self::cache_key(text);
            let row = sqlx::query(
                "SELECT embedding, model FROM embedding_cache WHERE text_hash = ? AND expires_at > ?",
            )
            .bind(&key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await;

            match row {
                Ok(Some(row)) => {
                    self.touch_detached(key);
                    let blob: Vec<u8> = row.get("embedding");
                    hits.insert(
                        text.clone(),
                        CachedEmbedding {
                            embedding: blob_to_vec(&blob),
                            model: row.get("model"),
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    eprintln!("Warning: embedding cache read failed: {}", e);
                }
            }
        }

        hits
    }

    /// Store one embedding. Overwriting an existing key refreshes its TTL.
    pub async fn set(&self, text: &str, embedding: &[f32], model: &str) {
        self.set_many(&[(text.to_string(), embedding.to_vec())], model)
            .await;
    }

    /// Store a batch of embeddings produced by `model`, then evict the
    /// least-recently-accessed 10% of capacity if the cache has grown past
    /// its configured maximum.
    pub async fn set_many(&self, entries: &[(String, Vec<f32>)], model: &str) {
        if !self.config.enabled || entries.is_empty() {
            return;
        }

        let now = now_ms();
        let expires_at = now + self.config.ttl_ms;

        for (text, embedding) in entries {
            let key = Self::cache_key(text);
            let blob = vec_to_blob(embedding);

            let result = sqlx::query(
                r#"
                INSERT INTO embedding_cache (text_hash, embedding, model, expires_at, hit_count, last_accessed_at)
                VALUES (?, ?, ?, ?, 0, ?)
                ON CONFLICT(text_hash) DO UPDATE SET
                    embedding = excluded.embedding,
                    model = excluded.model,
                    expires_at = excluded.expires_at,
                    last_accessed_at = excluded.last_accessed_at
                "#,
            )
            .bind(&key)
            .bind(&blob)
            .bind(model)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .await;

            if let Err(e) = result {
                eprintln!("Warning: embedding cache write failed: {}", e);
            }
        }

        self.evict_if_over_capacity().await;
    }

    /// Delete all cache entries. Returns the number removed (0 when disabled).
    pub async fn clear(&self) -> u64 {
        if !self.config.enabled {
            return 0;
        }
        match sqlx::query("DELETE FROM embedding_cache")
            .execute(&self.pool)
            .await
        {
            Ok(r) => r.rows_affected(),
            Err(e) => {
                eprintln!("Warning: embedding cache clear failed: {}", e);
                0
            }
        }
    }

    /// Delete expired entries. Returns the number removed.
    pub async fn cleanup_expired(&self) -> u64 {
        if !self.config.enabled {
            return 0;
        }
        match sqlx::query("DELETE FROM embedding_cache WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await
        {
            Ok(r) => r.rows_affected(),
            Err(e) => {
                eprintln!("Warning: embedding cache cleanup failed: {}", e);
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        if !self.config.enabled {
            return CacheStats::default();
        }

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_entries,
                   COALESCE(SUM(hit_count), 0) AS total_hits,
                   MIN(last_accessed_at) AS oldest_entry,
                   MAX(last_accessed_at) AS newest_entry
            FROM embedding_cache
            "#,
        )
        .fetch_one(&self.pool)
        .await;

        match row {
            Ok(row) => CacheStats {
                total_entries: row.get("total_entries"),
                total_hits: row.get("total_hits"),
                oldest_entry: row.get("oldest_entry"),
                newest_entry: row.get("newest_entry"),
            },
            Err(e) => {
                eprintln!("Warning: embedding cache stats failed: {}", e);
                CacheStats::default()
            }
        }
    }

    /// Fire-and-forget hit bookkeeping: the read path returns immediately
    /// while the counter update runs in the background.
    fn touch_detached(&self, key: String) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = sqlx::query(
                "UPDATE embedding_cache SET hit_count = hit_count + 1, last_accessed_at = ? WHERE text_hash = ?",
            )
            .bind(now_ms())
            .bind(&key)
            .execute(&pool)
            .await;

            if let Err(e) = result {
                eprintln!("Warning: embedding cache hit update failed: {}", e);
            }
        });
    }

    /// Evict the least-recently-accessed entries in one batch (ceil of 10%
    /// of capacity) when the cache exceeds its configured maximum size.
    async fn evict_if_over_capacity(&self) {
        let count: i64 = match sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Warning: embedding cache count failed: {}", e);
                return;
            }
        };

        if count <= self.config.max_entries {
            return;
        }

        let batch = (self.config.max_entries + 9) / 10;
        let result = sqlx::query(
            r#"
            DELETE FROM embedding_cache WHERE text_hash IN (
                SELECT text_hash FROM embedding_cache
                ORDER BY last_accessed_at ASC
                LIMIT ?
            )
            "#,
        )
        .bind(batch)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            eprintln!("Warning: embedding cache eviction failed: {}", e);
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
