//! Query-time retrieval orchestration.
//!
//! Embeds the query, searches chunks and FAQ entries concurrently, merges
//! and sorts the candidate pool, applies optional reranking, and formats
//! the surviving results into a single LLM-ready context string.
//!
//! A failure in either sub-search aborts the whole call: presenting a
//! partial knowledge base view as a complete answer is considered worse
//! than an explicit error. Reranker trouble, by contrast, is always
//! recovered locally.

use anyhow::Result;
use std::time::Instant;

use crate::config::RetrievalConfig;
use crate::embedder::EmbeddingService;
use crate::models::{SearchResponse, SearchResult, SourceType};
use crate::rerank::Reranker;
use crate::store::{ChunkFilter, VectorStore};

/// First-pass thresholds are relaxed by this factor so candidates that
/// reranking might promote are not discarded prematurely.
const RELAXED_FACTOR: f64 = 0.8;

/// Thresholds for the single-source `search_faq`/`search_docs` variants,
/// which carry higher precision expectations than the generic search.
const VARIANT_INITIAL_MIN_SCORE: f64 = 0.4;
const VARIANT_FINAL_MIN_SCORE: f64 = 0.6;

/// Per-call options; unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub min_score: Option<f64>,
    pub sources: Option<Vec<SourceType>>,
    /// Reranking defaults to on whenever a reranker is available.
    pub rerank: Option<bool>,
    pub include_metadata: bool,
}

pub struct SearchService<'a> {
    embedder: &'a EmbeddingService,
    store: &'a VectorStore,
    reranker: Option<Box<dyn Reranker>>,
    retrieval: RetrievalConfig,
}

impl<'a> SearchService<'a> {
    pub fn new(
        embedder: &'a EmbeddingService,
        store: &'a VectorStore,
        reranker: Option<Box<dyn Reranker>>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            reranker,
            retrieval,
        }
    }

    pub fn reranker_available(&self) -> bool {
        self.reranker.as_ref().is_some_and(|r| r.is_available())
    }

    /// The canonical RAG call: parallel chunk + FAQ retrieval, merge,
    /// optional rerank, and context formatting.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        let started = Instant::now();

        let top_k = options.top_k.unwrap_or(self.retrieval.top_k);
        let min_score = options.min_score.unwrap_or(self.retrieval.min_score);
        let rerank_wanted = options.rerank.unwrap_or(true);
        let active_reranker = if rerank_wanted {
            self.reranker.as_ref().filter(|r| r.is_available())
        } else {
            None
        };
        let rerank_active = active_reranker.is_some();

        let query_embedding = self.embedder.embed(query).await?;

        // Widen the candidate pool when reranking will get a chance to
        // promote lower-ranked hits.
        let fetch_k = if rerank_active {
            top_k.max(self.retrieval.initial_top_k)
        } else {
            top_k
        };
        let relaxed = min_score * RELAXED_FACTOR;

        let chunk_filter = ChunkFilter {
            top_k: fetch_k,
            min_score: relaxed,
            sources: options.sources.clone(),
        };
        let (chunk_results, faq_results) = tokio::join!(
            self.store.search_chunks(&query_embedding.vector, &chunk_filter),
            self.store.search_faqs(&query_embedding.vector, fetch_k, relaxed),
        );
        let chunk_results = chunk_results?;
        let faq_results = faq_results?;

        let mut merged: Vec<SearchResult> = chunk_results;
        merged.extend(faq_results);
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut reranked = false;
        let mut results = if let Some(reranker) =
            active_reranker.filter(|_| !merged.is_empty())
        {
            // The reranked list is authoritative: already top-k limited and
            // threshold-filtered by the reranker's own contract. The final
            // min_score is deliberately not re-applied here.
            match reranker.rerank(query, &merged, top_k, min_score).await {
                Ok(out) if !out.is_empty() => {
                    reranked = true;
                    out
                }
                Ok(_) => fallback_rank(merged, top_k, min_score),
                Err(e) => {
                    eprintln!("Warning: reranking failed, using score order: {}", e);
                    fallback_rank(merged, top_k, min_score)
                }
            }
        } else {
            fallback_rank(merged, top_k, min_score)
        };

        if !options.include_metadata {
            for r in &mut results {
                r.metadata = None;
            }
        }

        let formatted_context = format_context(&results);

        Ok(SearchResponse {
            query: query.to_string(),
            total_results: results.len(),
            results,
            search_time_ms: started.elapsed().as_millis() as u64,
            reranked,
            vector_index_used: self.store.vector_index_enabled(),
            formatted_context,
        })
    }

    /// FAQ-only lookup with a widened pool and a stricter final threshold.
    pub async fn search_faq(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let query_embedding = self.embedder.embed(query).await?;
        let candidates = self
            .store
            .search_faqs(&query_embedding.vector, top_k * 2, VARIANT_INITIAL_MIN_SCORE)
            .await?;

        self.finish_variant(query, candidates, top_k).await
    }

    /// Document-chunk-only lookup, same shape as [`Self::search_faq`].
    pub async fn search_docs(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let query_embedding = self.embedder.embed(query).await?;
        let filter = ChunkFilter {
            top_k: top_k * 2,
            min_score: VARIANT_INITIAL_MIN_SCORE,
            sources: None,
        };
        let candidates = self
            .store
            .search_chunks(&query_embedding.vector, &filter)
            .await?;

        self.finish_variant(query, candidates, top_k).await
    }

    async fn finish_variant(
        &self,
        query: &str,
        mut candidates: Vec<SearchResult>,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        if let Some(reranker) = self.reranker.as_ref().filter(|r| r.is_available()) {
            if !candidates.is_empty() {
                match reranker
                    .rerank(query, &candidates, top_k, VARIANT_FINAL_MIN_SCORE)
                    .await
                {
                    Ok(out) if !out.is_empty() => return Ok(out),
                    Ok(_) => {}
                    Err(e) => {
                        eprintln!("Warning: reranking failed, using score order: {}", e);
                    }
                }
            }
        }

        // Unlike the generic search, the variants filter before slicing.
        candidates.retain(|r| r.score >= VARIANT_FINAL_MIN_SCORE);
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(top_k);
        Ok(candidates)
    }
}

/// No-rerank ranking: take the first `top_k` of the score-sorted merge,
/// then filter by the final threshold — in that order. Because the first
/// pass ran at a relaxed threshold, fewer than `top_k` results can survive.
fn fallback_rank(mut merged: Vec<SearchResult>, top_k: usize, min_score: f64) -> Vec<SearchResult> {
    merged.truncate(top_k);
    merged.retain(|r| r.score >= min_score);
    merged
}

/// Render results as one LLM-ready context block: a `###` section per
/// result under a single top-level heading, separated by horizontal rules.
/// An empty result set yields an empty string, not a placeholder heading.
pub fn format_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return String::new();
    }

    let sections: Vec<String> = results
        .iter()
        .map(|r| {
            let title = r.title.as_deref().unwrap_or("Untitled");
            format!("### {} ({})\n{}", title, r.source.label(), r.content)
        })
        .collect();

    format!("# Knowledge Base Context\n\n{}", sections.join("\n\n---\n\n"))
}

/// Heuristic routing gate: does this message look like a support question
/// rather than a command? Keyword-based (Portuguese and English) plus a
/// long-message-ending-in-`?` rule. Intentionally precision-light: a false
/// positive only costs an extra context lookup.
pub fn is_support_question(message: &str) -> bool {
    let normalized = message.trim().to_lowercase();

    const PATTERNS: &[&str] = &[
        // Portuguese
        "como faço",
        "como posso",
        "como fazer",
        "como funciona",
        "onde encontro",
        "onde fica",
        "o que é",
        "o que significa",
        "não funciona",
        "nao funciona",
        "não consigo",
        "nao consigo",
        "preciso de ajuda",
        "me ajuda",
        "tenho uma dúvida",
        "tenho uma duvida",
        // English
        "how do i",
        "how can i",
        "how to",
        "how does",
        "where do i",
        "where can i",
        "what is",
        "what does",
        "not working",
        "doesn't work",
        "does not work",
        "i need help",
        "help me",
        "i can't",
        "i cannot",
    ];

    if PATTERNS.iter().any(|p| normalized.contains(p)) {
        return true;
    }

    normalized.ends_with('?') && normalized.chars().count() >= 15
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::config::{CacheConfig, ChunkingConfig, EmbeddingConfig};
    use crate::ingest::IngestPipeline;
    use crate::migrate::apply_schema;
    use crate::models::{DocumentInput, FaqInput};
    use crate::rerank::testing::{EmptyReranker, FailingReranker, ReversingReranker};
    use tempfile::TempDir;

    async fn test_env() -> (TempDir, EmbeddingService, VectorStore) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();

        let cache = EmbeddingCache::new(pool.clone(), CacheConfig::default());
        let embedding_config = EmbeddingConfig {
            provider: "fallback".to_string(),
            ..EmbeddingConfig::default()
        };
        let embedder = EmbeddingService::new(embedding_config, cache).unwrap();
        let dims = embedder.dimension();
        let store = VectorStore::connect(pool, dims).await;
        (tmp, embedder, store)
    }

    async fn seed(embedder: &EmbeddingService, store: &VectorStore) {
        let pipeline = IngestPipeline::new(embedder, store, ChunkingConfig::default());

        let doc = DocumentInput {
            source: SourceType::Docs,
            source_id: "invoices".to_string(),
            title: Some("Invoicing guide".to_string()),
            content: "To create an invoice, open the client record and choose New Invoice."
                .to_string(),
            metadata: Some(serde_json::json!({"section": "billing"})),
        };
        let result = pipeline.ingest_document(&doc).await;
        assert!(result.success);

        let faqs = vec![FaqInput {
            id: None,
            question: "How do I create an invoice for a client?".to_string(),
            answer: "Open the client record and choose New Invoice.".to_string(),
            category: Some("billing".to_string()),
            keywords: vec!["invoice".to_string()],
            priority: 1,
        }];
        let result = pipeline.ingest_faqs(&faqs).await;
        assert_eq!(result.failed, 0);
    }

    fn result(id: &str, score: f64) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            content: format!("content {}", id),
            score,
            source: SourceType::Docs,
            source_ref: id.to_string(),
            title: None,
            metadata: None,
        }
    }

    #[test]
    fn test_fallback_rank_slices_before_filtering() {
        // Slice-then-filter: the below-threshold candidate inside the top-k
        // window is dropped, and nothing beyond the window replaces it —
        // fewer than top_k results surface.
        let merged = vec![
            result("a", 0.9),
            result("b", 0.45),
            result("c", 0.8),
            result("d", 0.7),
        ];
        let mut sorted = merged.clone();
        sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());

        let out = fallback_rank(sorted, 3, 0.5);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, "a");
        assert_eq!(out[1].id, "c");
        assert_eq!(out[2].id, "d");

        let out = fallback_rank(
            vec![result("a", 0.9), result("b", 0.45), result("c", 0.4)],
            3,
            0.5,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_top_k_enforcement() {
        let merged = vec![
            result("a", 0.95),
            result("b", 0.9),
            result("c", 0.85),
            result("d", 0.8),
            result("e", 0.75),
        ];
        let out = fallback_rank(merged, 3, 0.5);
        assert_eq!(out.len(), 3);
        assert_eq!(
            out.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_format_context_sections() {
        let results = vec![
            SearchResult {
                title: Some("Invoicing guide".to_string()),
                source: SourceType::Docs,
                ..result("a", 0.9)
            },
            SearchResult {
                title: Some("How do I export?".to_string()),
                source: SourceType::Faq,
                ..result("b", 0.8)
            },
        ];
        let context = format_context(&results);
        assert!(context.starts_with("# Knowledge Base Context"));
        assert!(context.contains("### Invoicing guide (Documentation)"));
        assert!(context.contains("### How do I export? (FAQ)"));
        assert!(context.contains("\n\n---\n\n"));
    }

    #[test]
    fn test_format_context_empty_is_empty_string() {
        assert_eq!(format_context(&[]), "");
    }

    #[test]
    fn test_is_support_question() {
        assert!(is_support_question("como faço para criar um cliente"));
        assert!(is_support_question("How do I add a technician?"));
        assert!(is_support_question("the sync is not working"));
        assert!(is_support_question("preciso de ajuda com faturas"));
        // Long message ending in '?' counts even without a keyword
        assert!(is_support_question(
            "existe alguma forma de exportar os relatórios mensais?"
        ));

        assert!(!is_support_question("crie um cliente João"));
        assert!(!is_support_question("ok"));
        assert!(!is_support_question("ok?"));
    }

    #[tokio::test]
    async fn test_search_merges_and_ranks_faq_above_weaker_chunk() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(&embedder, &store, None, RetrievalConfig::default());
        let response = service
            .search(
                "How do I create an invoice for a client?",
                &SearchOptions {
                    // Floor of -1.0 admits every candidate regardless of the
                    // fallback provider's similarity distribution.
                    min_score: Some(-1.0),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();

        // The FAQ question matches the query exactly, so it must outrank
        // the related-but-different document chunk.
        assert!(response.total_results >= 2);
        assert_eq!(response.results[0].source, SourceType::Faq);
        for pair in response.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(!response.reranked);
        assert!(!response.vector_index_used);
    }

    #[tokio::test]
    async fn test_search_empty_knowledge_base() {
        let (_tmp, embedder, store) = test_env().await;
        let service = SearchService::new(&embedder, &store, None, RetrievalConfig::default());

        let response = service
            .search("test query", &SearchOptions::default())
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.total_results, 0);
        assert_eq!(response.formatted_context, "");
        assert!(!response.reranked);
    }

    #[tokio::test]
    async fn test_search_strips_metadata_by_default() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(&embedder, &store, None, RetrievalConfig::default());

        let plain = service
            .search(
                "invoice",
                &SearchOptions {
                    min_score: Some(-1.0),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(!plain.results.is_empty());
        assert!(plain.results.iter().all(|r| r.metadata.is_none()));

        let with_meta = service
            .search(
                "invoice",
                &SearchOptions {
                    min_score: Some(-1.0),
                    include_metadata: true,
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        // The seeded FAQ carries category and keywords metadata.
        assert!(with_meta.results.iter().any(|r| r.metadata.is_some()));
    }

    #[tokio::test]
    async fn test_rerank_replaces_result_set() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(
            &embedder,
            &store,
            Some(Box::new(ReversingReranker)),
            RetrievalConfig::default(),
        );
        let response = service
            .search(
                "How do I create an invoice for a client?",
                &SearchOptions {
                    min_score: Some(0.0),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(response.reranked);
        // Design note: the reranked branch trusts the reranker's own
        // filtering entirely; the final min_score is not re-applied. This
        // asymmetry with the no-rerank branch is intentional.
        assert!(!response.results.is_empty());
    }

    #[tokio::test]
    async fn test_empty_rerank_output_falls_back() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(
            &embedder,
            &store,
            Some(Box::new(EmptyReranker)),
            RetrievalConfig::default(),
        );
        let response = service
            .search(
                "How do I create an invoice for a client?",
                &SearchOptions {
                    min_score: Some(0.0),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(!response.reranked);
        assert!(!response.results.is_empty());
    }

    #[tokio::test]
    async fn test_failing_reranker_never_errors_the_search() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(
            &embedder,
            &store,
            Some(Box::new(FailingReranker)),
            RetrievalConfig::default(),
        );
        let response = service
            .search(
                "How do I create an invoice for a client?",
                &SearchOptions {
                    min_score: Some(0.0),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(!response.reranked);
        assert!(!response.results.is_empty());
    }

    #[tokio::test]
    async fn test_rerank_disabled_per_call() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(
            &embedder,
            &store,
            Some(Box::new(ReversingReranker)),
            RetrievalConfig::default(),
        );
        let response = service
            .search(
                "invoice",
                &SearchOptions {
                    min_score: Some(0.0),
                    rerank: Some(false),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(!response.reranked);
    }

    #[tokio::test]
    async fn test_search_faq_variant_only_returns_faqs() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(&embedder, &store, None, RetrievalConfig::default());
        let results = service
            .search_faq("How do I create an invoice for a client?", 3)
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.source == SourceType::Faq));
    }

    #[tokio::test]
    async fn test_search_docs_variant_excludes_faqs() {
        let (_tmp, embedder, store) = test_env().await;
        seed(&embedder, &store).await;

        let service = SearchService::new(&embedder, &store, None, RetrievalConfig::default());
        let results = service
            .search_docs(
                "To create an invoice, open the client record and choose New Invoice.",
                3,
            )
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.source != SourceType::Faq));
    }
}
