//! Optional cross-encoder reranking boundary.
//!
//! The search service treats reranking as a potentially-absent capability:
//! when no reranker is configured, or when a rerank call fails or returns
//! nothing usable, retrieval falls back to its own score ordering. A
//! reranker problem is never surfaced as a search error.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::RerankerConfig;
use crate::models::SearchResult;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn is_available(&self) -> bool;

    /// Re-score `candidates` against `query`. The returned list is already
    /// filtered by `min_score` and limited to `top_k` — callers treat it as
    /// authoritative when non-empty.
    async fn rerank(
        &self,
        query: &str,
        candidates: &[SearchResult],
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>>;
}

/// Remote cross-encoder service reachable over HTTP.
///
/// POSTs `{query, documents: [...]}` and expects
/// `{results: [{index, score}, ...]}` where `index` refers back into the
/// submitted document list.
pub struct HttpReranker {
    url: String,
    timeout_secs: u64,
}

impl HttpReranker {
    pub fn new(url: String, timeout_secs: u64) -> Self {
        Self { url, timeout_secs }
    }

    /// Build a reranker from config; `None` when no endpoint is configured.
    pub fn from_config(config: &RerankerConfig) -> Option<Self> {
        config
            .url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.timeout_secs))
    }
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    score: f64,
}

#[async_trait]
impl Reranker for HttpReranker {
    fn is_available(&self) -> bool {
        true
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: &[SearchResult],
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let documents: Vec<&str> = candidates.iter().map(|c| c.content.as_str()).collect();
        let body = serde_json::json!({
            "query": query,
            "documents": documents,
            "top_k": top_k,
        });

        let response = client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Reranker error {}: {}", status, body_text);
        }

        let parsed: RerankResponse = response.json().await?;

        let mut reranked: Vec<SearchResult> = parsed
            .results
            .into_iter()
            .filter(|item| item.index < candidates.len() && item.score >= min_score)
            .map(|item| {
                let mut result = candidates[item.index].clone();
                result.score = item.score;
                result
            })
            .collect();

        reranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reranked.truncate(top_k);
        Ok(reranked)
    }
}
