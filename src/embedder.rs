//! Cache-aware embedding service.
//!
//! The single source of vector generation for the whole engine: consults
//! the [`EmbeddingCache`] first, batches provider calls for the misses, and
//! writes fresh results back to the cache in a detached task. Cache
//! failures never fail an embed call; provider failures always do.

use anyhow::Result;

use crate::cache::EmbeddingCache;
use crate::config::EmbeddingConfig;
use crate::embedding::{self, EmbeddingProvider};

/// One produced embedding, with provenance.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
    pub from_cache: bool,
}

pub struct EmbeddingService {
    provider: Box<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
    cache: EmbeddingCache,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig, cache: EmbeddingCache) -> Result<Self> {
        let provider = embedding::create_provider(&config)?;
        Ok(Self {
            provider,
            config,
            cache,
        })
    }

    /// Vector dimensionality of the active model. The store uses this to
    /// size its native vector index and validate stored vectors.
    pub fn dimension(&self) -> usize {
        self.provider.dims()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed one text, cache first.
    ///
    /// On a miss the provider result is written back to the cache by a
    /// detached task; the caller never waits on that write.
    pub async fn embed(&self, text: &str) -> Result<Embedding> {
        if let Some(hit) = self.cache.get(text).await {
            return Ok(Embedding {
                vector: hit.embedding,
                model: hit.model,
                from_cache: true,
            });
        }

        let vectors =
            embedding::embed_texts(self.provider.as_ref(), &self.config, &[text.to_string()])
                .await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        self.write_back_detached(vec![(text.to_string(), vector.clone())]);

        Ok(Embedding {
            vector,
            model: self.provider.model_name().to_string(),
            from_cache: false,
        })
    }

    /// Embed a batch, preserving input order.
    ///
    /// Cached and freshly-computed results are interleaved back into their
    /// original positions via an index map, so a partially-warm cache never
    /// reorders the output.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let hits = self.cache.get_many(texts).await;

        let mut slots: Vec<Option<Embedding>> = vec![None; texts.len()];
        let mut miss_indices: Vec<usize> = Vec::new();
        let mut miss_texts: Vec<String> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(hit) = hits.get(text) {
                slots[i] = Some(Embedding {
                    vector: hit.embedding.clone(),
                    model: hit.model.clone(),
                    from_cache: true,
                });
            } else {
                miss_indices.push(i);
                miss_texts.push(text.clone());
            }
        }

        if !miss_texts.is_empty() {
            let vectors =
                embedding::embed_texts(self.provider.as_ref(), &self.config, &miss_texts).await?;
            if vectors.len() != miss_texts.len() {
                anyhow::bail!(
                    "Provider returned {} embeddings for {} texts",
                    vectors.len(),
                    miss_texts.len()
                );
            }

            let model = self.provider.model_name().to_string();
            let mut fresh = Vec::with_capacity(vectors.len());

            for (k, vector) in vectors.into_iter().enumerate() {
                fresh.push((miss_texts[k].clone(), vector.clone()));
                slots[miss_indices[k]] = Some(Embedding {
                    vector,
                    model: model.clone(),
                    from_cache: false,
                });
            }

            self.write_back_detached(fresh);
        }

        // Every slot is filled: each index was either a hit or a miss.
        slots
            .into_iter()
            .map(|s| s.ok_or_else(|| anyhow::anyhow!("Embedding batch left a slot unfilled")))
            .collect()
    }

    /// Cosine similarity between two vectors. Fails on dimension mismatch.
    pub fn cosine_similarity(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        embedding::cosine_similarity(a, b)
    }

    /// Fire-and-forget cache write-back. Failures are logged inside the
    /// cache; a rapid burst of identical cold-cache queries may each call
    /// the provider — accepted tradeoff for request latency.
    fn write_back_detached(&self, entries: Vec<(String, Vec<f32>)>) {
        let cache = self.cache.clone();
        let model = self.provider.model_name().to_string();
        tokio::spawn(async move {
            cache.set_many(&entries, &model).await;
        });
    }
}
