//! Core data models used throughout the knowledge base engine.
//!
//! These types represent the documents, chunks, FAQ entries, and search
//! results that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Where a knowledge document originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Docs,
    Faq,
    HelpCenter,
    Custom,
}

impl SourceType {
    /// Stable identifier stored in the `documents.source` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Docs => "docs",
            SourceType::Faq => "faq",
            SourceType::HelpCenter => "help_center",
            SourceType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<SourceType> {
        match s {
            "docs" => Some(SourceType::Docs),
            "faq" => Some(SourceType::Faq),
            "help_center" => Some(SourceType::HelpCenter),
            "custom" => Some(SourceType::Custom),
            _ => None,
        }
    }

    /// Human-readable label used in formatted LLM context headers.
    pub fn label(&self) -> &'static str {
        match self {
            SourceType::Docs => "Documentation",
            SourceType::Faq => "FAQ",
            SourceType::HelpCenter => "Help Center",
            SourceType::Custom => "Custom",
        }
    }
}

/// A logical knowledge unit submitted for ingestion.
///
/// `(source, source_id)` uniquely identifies a document; re-ingesting the
/// same pair replaces the stored content and all of its chunks.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub source: SourceType,
    pub source_id: String,
    pub title: Option<String>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

/// A chunk record assembled by the ingest pipeline and persisted by the store.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub content: String,
    pub chunk_index: i64,
    pub start_char: i64,
    pub end_char: i64,
    pub embedding: Vec<f32>,
    pub metadata: Option<serde_json::Value>,
}

/// A standalone question/answer pair, independent of the document structure.
///
/// `id` is `None` on first insert; supplying an existing id makes
/// [`crate::store::VectorStore::store_faq`] an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaqInput {
    #[serde(default)]
    pub id: Option<String>,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

/// A unified search hit: either a document chunk or a FAQ entry.
///
/// Produced fresh per query; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    /// Cosine similarity; higher is better.
    pub score: f64,
    pub source: SourceType,
    pub source_ref: String,
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of ingesting one document. The pipeline never propagates an
/// error past this shape; batch tooling inspects `success` and continues.
#[derive(Debug, Clone)]
pub struct IngestResult {
    pub document_id: String,
    pub chunks_created: usize,
    pub success: bool,
    pub error: Option<String>,
}

/// Tally for a bulk FAQ ingest run.
#[derive(Debug, Clone, Default)]
pub struct FaqIngestResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Response envelope for [`crate::search::SearchService::search`].
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub total_results: usize,
    pub search_time_ms: u64,
    pub reranked: bool,
    pub vector_index_used: bool,
    pub formatted_context: String,
}

/// Aggregate counts reported by `kb stats`.
#[derive(Debug, Clone)]
pub struct KnowledgeStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub total_faqs: i64,
    pub by_source: Vec<(String, i64)>,
    pub vector_index_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_roundtrip() {
        for s in [
            SourceType::Docs,
            SourceType::Faq,
            SourceType::HelpCenter,
            SourceType::Custom,
        ] {
            assert_eq!(SourceType::parse(s.as_str()), Some(s));
        }
        assert_eq!(SourceType::parse("bogus"), None);
    }
}
