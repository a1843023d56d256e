//! Document and FAQ ingestion pipeline.
//!
//! Hash → reindex check → chunk → batch-embed → store. The content hash
//! short-circuit is the primary cost-control mechanism: a document whose
//! content is byte-identical to the stored copy never reaches the chunker
//! or the embedding provider.
//!
//! `ingest_document` never propagates an error past its boundary; failures
//! are converted into a structured [`IngestResult`] so batch tooling can
//! continue and report a final tally.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::chunker::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedder::EmbeddingService;
use crate::models::{
    ChunkRecord, DocumentInput, FaqIngestResult, FaqInput, IngestResult, SourceType,
};
use crate::store::VectorStore;

pub struct IngestPipeline<'a> {
    embedder: &'a EmbeddingService,
    store: &'a VectorStore,
    chunking: ChunkingConfig,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(
        embedder: &'a EmbeddingService,
        store: &'a VectorStore,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            chunking,
        }
    }

    /// Ingest one document. Returns `chunks_created: 0, success: true`
    /// without touching storage or the provider when the stored content
    /// hash matches.
    pub async fn ingest_document(&self, doc: &DocumentInput) -> IngestResult {
        match self.try_ingest(doc).await {
            Ok((document_id, chunks_created)) => IngestResult {
                document_id,
                chunks_created,
                success: true,
                error: None,
            },
            Err(e) => IngestResult {
                document_id: String::new(),
                chunks_created: 0,
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    async fn try_ingest(&self, doc: &DocumentInput) -> Result<(String, usize)> {
        let content_hash = hash_content(&doc.content);

        if !self
            .store
            .needs_reindex(doc.source, &doc.source_id, &content_hash)
            .await?
        {
            let document_id = self
                .store
                .find_document_id(doc.source, &doc.source_id)
                .await?
                .unwrap_or_default();
            return Ok((document_id, 0));
        }

        let text_chunks = chunk_text(&doc.content, &self.chunking);
        let texts: Vec<String> = text_chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let records: Vec<ChunkRecord> = text_chunks
            .iter()
            .zip(embeddings.into_iter())
            .map(|(chunk, embedding)| ChunkRecord {
                content: chunk.content.clone(),
                chunk_index: chunk.index as i64,
                start_char: chunk.start_char as i64,
                end_char: chunk.end_char as i64,
                embedding: embedding.vector,
                metadata: doc.metadata.clone(),
            })
            .collect();

        let resolved = DocumentInput {
            title: Some(resolve_title(doc)),
            ..doc.clone()
        };

        let document_id = self
            .store
            .store_document(&resolved, &content_hash, &records)
            .await?;

        Ok((document_id, records.len()))
    }

    /// Bulk FAQ ingestion. Each question is embedded individually (FAQ sets
    /// are small and arrive with per-item failure tolerance); one bad entry
    /// never aborts the batch.
    pub async fn ingest_faqs(&self, faqs: &[FaqInput]) -> FaqIngestResult {
        let mut result = FaqIngestResult {
            total: faqs.len(),
            ..FaqIngestResult::default()
        };

        for faq in faqs {
            let outcome = async {
                let embedding = self.embedder.embed(&faq.question).await?;
                self.store.store_faq(faq, &embedding.vector).await
            }
            .await;

            match outcome {
                Ok(_) => result.success += 1,
                Err(e) => {
                    eprintln!("Warning: FAQ ingest failed for '{}': {}", faq.question, e);
                    result.failed += 1;
                }
            }
        }

        result
    }

    /// Coarse-grained escape hatch: reset every stored hash under `source`
    /// so the next ingest pass re-indexes everything.
    pub async fn reindex_source(&self, source: SourceType) -> Result<u64> {
        self.store.reset_source_hashes(source).await
    }
}

/// SHA-256 digest of document content, used for change detection.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Title resolution: explicit title, else the first `#` heading, else the
/// first reasonably short line, else the source identifier.
fn resolve_title(doc: &DocumentInput) -> String {
    if let Some(title) = &doc.title {
        if !title.trim().is_empty() {
            return title.trim().to_string();
        }
    }

    for line in doc.content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix('#') {
            return heading.trim_start_matches('#').trim().to_string();
        }
        if trimmed.len() <= 80 {
            return trimmed.to_string();
        }
        break;
    }

    doc.source_id.clone()
}
