//! Knowledge base statistics and health overview.
//!
//! Provides a quick summary of what's indexed: document, chunk, and FAQ
//! counts, per-source breakdowns, cache usage, and which search strategy is
//! active. Used by `kb stats` to give confidence that ingestion and
//! embeddings are working as expected.

use anyhow::Result;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::embedder::EmbeddingService;
use crate::store::VectorStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::apply_schema(&pool).await?;

    let cache = EmbeddingCache::new(pool.clone(), config.cache.clone());
    let embedder = EmbeddingService::new(config.embedding.clone(), cache.clone())?;
    let store = VectorStore::connect(pool.clone(), embedder.dimension()).await;

    let kb = store.stats().await?;
    let cache_stats = cache.stats().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Knowledge Base — Stats");
    println!("======================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!(
        "  Vector index:  {}",
        if kb.vector_index_enabled {
            "native (sqlite-vec)"
        } else {
            "in-memory fallback"
        }
    );
    println!(
        "  Embedding:     {} ({} dims)",
        embedder.model_name(),
        embedder.dimension()
    );
    println!(
        "  Reranker:      {}",
        match &config.reranker.url {
            Some(url) => url.as_str(),
            None => "not configured",
        }
    );
    println!();
    println!("  Documents:     {}", kb.total_documents);
    println!("  Chunks:        {}", kb.total_chunks);
    println!("  FAQ entries:   {}", kb.total_faqs);

    if !kb.by_source.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<16} {:>6}", "SOURCE", "DOCS");
        println!("  {}", "-".repeat(24));
        for (source, count) in &kb.by_source {
            println!("  {:<16} {:>6}", source, count);
        }
    }

    println!();
    if config.cache.enabled {
        println!(
            "  Cache:         {} entries, {} hits",
            cache_stats.total_entries, cache_stats.total_hits
        );
        if let Some(ts) = cache_stats.newest_entry {
            println!("  Last cached:   {}", format_ts_relative(ts / 1000));
        }
    } else {
        println!("  Cache:         disabled");
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now - 10), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
