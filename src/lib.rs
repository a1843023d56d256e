//! # KB Engine
//!
//! A retrieval-augmented knowledge base for AI support assistants.
//!
//! KB Engine ingests documentation, help-center articles, and FAQ entries
//! into SQLite, chunking and embedding them, and exposes semantic search
//! with optional cross-encoder reranking via the `kb` CLI. Retrieved
//! results are formatted into an LLM-ready context block.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Documents │──▶│   Pipeline    │──▶│  SQLite    │
//! │  Docs/FAQ  │   │ Chunk+Embed  │   │ BLOB+vec0 │
//! └────────────┘   └──────┬───────┘   └─────┬─────┘
//!                         │                 │
//!                   ┌─────┴─────┐     ┌─────┴─────┐
//!                   │ Embedding │     │  Search   │
//!                   │   Cache   │     │ + Rerank  │
//!                   └───────────┘     └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                            # create database
//! kb ingest guide.md --source docs   # ingest a document
//! kb faq import faqs.json            # bulk-load FAQ entries
//! kb search "how do I invoice a client?"
//! kb stats                           # what's indexed
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunker`] | Separator-aware text chunking |
//! | [`embedding`] | Embedding providers and vector math |
//! | [`cache`] | Content-addressed embedding cache |
//! | [`embedder`] | Cache-aware embedding service |
//! | [`store`] | Persistence and similarity search |
//! | [`ingest`] | Document and FAQ ingestion pipeline |
//! | [`search`] | Retrieve-and-rerank orchestration |
//! | [`rerank`] | Cross-encoder reranking boundary |
//! | [`stats`] | Index health overview |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod rerank;
pub mod search;
pub mod stats;
pub mod store;
