//! # Knowledge Base CLI (`kb`)
//!
//! The `kb` binary is the primary interface for KB Engine. It provides
//! commands for database initialization, document and FAQ ingestion,
//! semantic search, message routing, and cache management.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb ingest <file>` | Chunk, embed, and index a document |
//! | `kb faq import <file.json>` | Bulk-load FAQ entries |
//! | `kb search "<query>"` | Search chunks and FAQs, optionally reranked |
//! | `kb search-faq "<query>"` | FAQ-only lookup |
//! | `kb search-docs "<query>"` | Document-chunk-only lookup |
//! | `kb route "<message>"` | Decide whether a message needs knowledge retrieval |
//! | `kb reindex <source>` | Force re-indexing of a source on the next ingest |
//! | `kb migrate-vector` | Backfill the native vector index from stored BLOBs |
//! | `kb cache <stats|cleanup|clear>` | Inspect or prune the embedding cache |
//! | `kb stats` | Show index health and counts |

mod cache;
mod chunker;
mod config;
mod db;
mod embedder;
mod embedding;
mod ingest;
mod migrate;
mod models;
mod rerank;
mod search;
mod stats;
mod store;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use cache::EmbeddingCache;
use config::Config;
use embedder::EmbeddingService;
use ingest::IngestPipeline;
use models::{DocumentInput, FaqInput, SearchResult, SourceType};
use rerank::{HttpReranker, Reranker};
use search::{SearchOptions, SearchService};
use store::VectorStore;

/// Knowledge Base CLI — retrieval-augmented search over docs and FAQs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "KB Engine — retrieval-augmented knowledge base for AI support assistants",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (documents,
    /// chunks, faq_entries, embedding_cache). Idempotent.
    Init,

    /// Ingest a document file or a directory of documents.
    ///
    /// Chunks and embeds the content and stores the result. Directories are
    /// walked recursively for `.md` and `.txt` files. Re-ingesting unchanged
    /// content is a fast no-op thanks to content hashing.
    Ingest {
        /// Path to a document (plain text or Markdown) or a directory.
        path: PathBuf,

        /// Source bucket: `docs`, `help_center`, or `custom`.
        #[arg(long, default_value = "docs")]
        source: String,

        /// Stable identifier within the source. Defaults to the file stem.
        /// Ignored for directories (each file uses its relative path).
        #[arg(long)]
        source_id: Option<String>,

        /// Document title. Derived from the content when omitted.
        /// Ignored for directories.
        #[arg(long)]
        title: Option<String>,
    },

    /// Manage FAQ entries.
    Faq {
        #[command(subcommand)]
        action: FaqAction,
    },

    /// Search the knowledge base (chunks and FAQs).
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity score in [0, 1].
        #[arg(long)]
        min_score: Option<f64>,

        /// Restrict chunk results to a source (repeatable).
        #[arg(long)]
        source: Vec<String>,

        /// Skip reranking even when a reranker is configured.
        #[arg(long)]
        no_rerank: bool,

        /// Include chunk metadata in the output.
        #[arg(long)]
        with_metadata: bool,

        /// Print the formatted LLM context block after the result list.
        #[arg(long)]
        context: bool,
    },

    /// Search FAQ entries only.
    SearchFaq {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value = "3")]
        top_k: usize,
    },

    /// Search document chunks only.
    SearchDocs {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value = "3")]
        top_k: usize,
    },

    /// Route a user message: retrieve context when it looks like a support
    /// question, otherwise do nothing.
    Route {
        /// The user message to classify.
        message: String,
    },

    /// Force re-indexing of every document under a source.
    ///
    /// Resets stored content hashes so the next ingest pass rebuilds chunks
    /// and embeddings from scratch.
    Reindex {
        /// Source bucket: `docs`, `help_center`, or `custom`.
        source: String,
    },

    /// Backfill the native vector index from stored embedding BLOBs.
    ///
    /// Requires the sqlite-vec extension. Useful after enabling the
    /// extension on a database populated in fallback mode.
    MigrateVector,

    /// Inspect or prune the embedding cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show index health and counts.
    Stats,
}

/// FAQ management subcommands.
#[derive(Subcommand)]
enum FaqAction {
    /// Bulk-import FAQ entries from a JSON array.
    ///
    /// Entries with an `id` field update existing rows; entries without one
    /// are inserted. One bad entry never aborts the batch.
    Import {
        /// Path to a JSON file containing an array of FAQ entries.
        path: PathBuf,
    },
}

/// Cache management subcommands.
#[derive(Subcommand)]
enum CacheAction {
    /// Show entry and hit counts.
    Stats,
    /// Delete expired entries.
    Cleanup,
    /// Delete all entries.
    Clear,
}

/// Everything a command needs: shared pool, embedding service, and store.
struct Services {
    pool: sqlx::SqlitePool,
    embedder: EmbeddingService,
    store: VectorStore,
}

async fn build_services(cfg: &Config) -> Result<Services> {
    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;

    let cache = EmbeddingCache::new(pool.clone(), cfg.cache.clone());
    let embedder = EmbeddingService::new(cfg.embedding.clone(), cache)?;
    let store = VectorStore::connect(pool.clone(), embedder.dimension()).await;

    Ok(Services {
        pool,
        embedder,
        store,
    })
}

fn parse_source(s: &str) -> Result<SourceType> {
    SourceType::parse(s)
        .with_context(|| format!("Unknown source '{}'. Must be docs, faq, help_center, or custom.", s))
}

/// Recursively collect `.md` and `.txt` files under `root`, paired with
/// their root-relative path as a stable source id.
fn collect_documents(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("md") | Some("txt")
            ) {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                files.push((path, rel));
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({})",
            i + 1,
            r.score,
            r.title.as_deref().unwrap_or("Untitled"),
            r.source.label()
        );
        let preview: String = r.content.chars().take(120).collect();
        println!("   {}", preview.replace('\n', " "));
        if let Some(meta) = &r.metadata {
            println!("   metadata: {}", meta);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }

        Commands::Ingest {
            path,
            source,
            source_id,
            title,
        } => {
            let source = parse_source(&source)?;
            let services = build_services(&cfg).await?;
            let pipeline =
                IngestPipeline::new(&services.embedder, &services.store, cfg.chunking.clone());

            if path.is_dir() {
                let files = collect_documents(&path)?;
                if files.is_empty() {
                    bail!("No .md or .txt files found under {}", path.display());
                }

                let mut indexed = 0usize;
                let mut skipped = 0usize;
                let mut failed = 0usize;
                for (file, rel_id) in &files {
                    let content = std::fs::read_to_string(file)
                        .with_context(|| format!("Failed to read document: {}", file.display()))?;
                    let doc = DocumentInput {
                        source,
                        source_id: rel_id.clone(),
                        title: None,
                        content,
                        metadata: None,
                    };
                    let result = pipeline.ingest_document(&doc).await;
                    if !result.success {
                        eprintln!(
                            "Warning: ingest failed for {}: {}",
                            rel_id,
                            result.error.unwrap_or_else(|| "unknown error".to_string())
                        );
                        failed += 1;
                    } else if result.chunks_created == 0 {
                        skipped += 1;
                    } else {
                        indexed += 1;
                    }
                }
                println!(
                    "Ingested {} files: {} indexed, {} unchanged, {} failed.",
                    files.len(),
                    indexed,
                    skipped,
                    failed
                );
            } else {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read document: {}", path.display()))?;
                let source_id = source_id.unwrap_or_else(|| {
                    path.file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.display().to_string())
                });

                let doc = DocumentInput {
                    source,
                    source_id,
                    title,
                    content,
                    metadata: None,
                };
                let result = pipeline.ingest_document(&doc).await;

                if !result.success {
                    bail!(
                        "Ingest failed: {}",
                        result.error.unwrap_or_else(|| "unknown error".to_string())
                    );
                }
                if result.chunks_created == 0 {
                    println!("Unchanged, skipped (document {}).", result.document_id);
                } else {
                    println!(
                        "Indexed {} chunk{} (document {}).",
                        result.chunks_created,
                        if result.chunks_created == 1 { "" } else { "s" },
                        result.document_id
                    );
                }
            }
            services.pool.close().await;
        }

        Commands::Faq {
            action: FaqAction::Import { path },
        } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read FAQ file: {}", path.display()))?;
            let faqs: Vec<FaqInput> =
                serde_json::from_str(&content).with_context(|| "Failed to parse FAQ JSON")?;

            let services = build_services(&cfg).await?;
            let pipeline =
                IngestPipeline::new(&services.embedder, &services.store, cfg.chunking.clone());

            let result = pipeline.ingest_faqs(&faqs).await;
            println!(
                "Imported {} / {} FAQ entries ({} failed).",
                result.success, result.total, result.failed
            );
            services.pool.close().await;
            if result.failed > 0 && result.success == 0 {
                bail!("All FAQ entries failed to import");
            }
        }

        Commands::Search {
            query,
            top_k,
            min_score,
            source,
            no_rerank,
            with_metadata,
            context,
        } => {
            let sources = if source.is_empty() {
                None
            } else {
                Some(
                    source
                        .iter()
                        .map(|s| parse_source(s))
                        .collect::<Result<Vec<_>>>()?,
                )
            };

            let services = build_services(&cfg).await?;
            let reranker: Option<Box<dyn Reranker>> = HttpReranker::from_config(&cfg.reranker)
                .map(|r| Box::new(r) as Box<dyn Reranker>);
            let service = SearchService::new(
                &services.embedder,
                &services.store,
                reranker,
                cfg.retrieval.clone(),
            );

            let options = SearchOptions {
                top_k,
                min_score,
                sources,
                rerank: if no_rerank { Some(false) } else { None },
                include_metadata: with_metadata,
            };
            let response = service.search(&query, &options).await?;

            println!(
                "{} result{} in {} ms{}{}",
                response.total_results,
                if response.total_results == 1 { "" } else { "s" },
                response.search_time_ms,
                if response.reranked { ", reranked" } else { "" },
                if response.vector_index_used {
                    ", native index"
                } else {
                    ""
                }
            );
            print_results(&response.results);

            if context && !response.formatted_context.is_empty() {
                println!();
                println!("{}", response.formatted_context);
            }
            services.pool.close().await;
        }

        Commands::SearchFaq { query, top_k } => {
            let services = build_services(&cfg).await?;
            let reranker: Option<Box<dyn Reranker>> = HttpReranker::from_config(&cfg.reranker)
                .map(|r| Box::new(r) as Box<dyn Reranker>);
            let service = SearchService::new(
                &services.embedder,
                &services.store,
                reranker,
                cfg.retrieval.clone(),
            );

            let results = service.search_faq(&query, top_k).await?;
            print_results(&results);
            services.pool.close().await;
        }

        Commands::SearchDocs { query, top_k } => {
            let services = build_services(&cfg).await?;
            let reranker: Option<Box<dyn Reranker>> = HttpReranker::from_config(&cfg.reranker)
                .map(|r| Box::new(r) as Box<dyn Reranker>);
            let service = SearchService::new(
                &services.embedder,
                &services.store,
                reranker,
                cfg.retrieval.clone(),
            );

            let results = service.search_docs(&query, top_k).await?;
            print_results(&results);
            services.pool.close().await;
        }

        Commands::Route { message } => {
            if !search::is_support_question(&message) {
                println!("Not a support question; no retrieval performed.");
                return Ok(());
            }

            let services = build_services(&cfg).await?;
            let reranker: Option<Box<dyn Reranker>> = HttpReranker::from_config(&cfg.reranker)
                .map(|r| Box::new(r) as Box<dyn Reranker>);
            let service = SearchService::new(
                &services.embedder,
                &services.store,
                reranker,
                cfg.retrieval.clone(),
            );

            let response = service.search(&message, &SearchOptions::default()).await?;
            if response.formatted_context.is_empty() {
                println!("Support question, but no relevant knowledge found.");
            } else {
                println!("{}", response.formatted_context);
            }
            services.pool.close().await;
        }

        Commands::Reindex { source } => {
            let source = parse_source(&source)?;
            let services = build_services(&cfg).await?;
            let pipeline =
                IngestPipeline::new(&services.embedder, &services.store, cfg.chunking.clone());

            let count = pipeline.reindex_source(source).await?;
            println!(
                "Marked {} document{} for re-indexing.",
                count,
                if count == 1 { "" } else { "s" }
            );
            services.pool.close().await;
        }

        Commands::MigrateVector => {
            let services = build_services(&cfg).await?;
            let migrated = services.store.migrate_to_vector().await?;
            println!("Migrated {} embeddings into the native vector index.", migrated);
            services.pool.close().await;
        }

        Commands::Cache { action } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let cache = EmbeddingCache::new(pool.clone(), cfg.cache.clone());

            match action {
                CacheAction::Stats => {
                    let s = cache.stats().await;
                    println!("Entries: {}", s.total_entries);
                    println!("Hits:    {}", s.total_hits);
                }
                CacheAction::Cleanup => {
                    let removed = cache.cleanup_expired().await;
                    println!("Removed {} expired entries.", removed);
                }
                CacheAction::Clear => {
                    let removed = cache.clear().await;
                    println!("Removed {} entries.", removed);
                }
            }
            pool.close().await;
        }

        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
