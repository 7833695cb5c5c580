//! Core KnowledgeStore implementation

use chrono::Utc;
use eyre::{Context, Result};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::chunk::split_chunks;

/// Options for ingesting a document
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Maximum chunk size in characters
    pub chunk_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Options for retrieval
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Candidate count recalled from the FTS index
    pub recall_limit: usize,
    /// Number of re-ranked chunks kept
    pub top_k: usize,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            recall_limit: crate::DEFAULT_RECALL_LIMIT,
            top_k: crate::DEFAULT_TOP_K,
        }
    }
}

/// Result of a retrieval query
///
/// `context` is the ranked, deduplicated block intended for the model
/// prompt. `trace` is a human-readable diagnostic of how the selection was
/// made and must never be sent to the model.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub context: String,
    pub trace: String,
}

impl Retrieval {
    /// True when nothing was retrieved
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

/// Statistics for the store
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub source_count: usize,
}

/// A recalled candidate prior to re-ranking
#[derive(Debug)]
struct Candidate {
    source: String,
    content: String,
}

/// The local retrieval index
pub struct KnowledgeStore {
    conn: Connection,
}

impl KnowledgeStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .context(format!("Failed to open knowledge store at {}", path.as_ref().display()))?;
        Self::init(conn)
    }

    /// Open an in-memory store (tests, throwaway sessions)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);
            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                content,
                source UNINDEXED,
                content='chunks',
                content_rowid='id'
            );
            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, content, source)
                VALUES (new.id, new.content, new.source);
            END;
            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, content, source)
                VALUES ('delete', old.id, old.content, old.source);
            END;
            "#,
        )
        .context("Failed to initialize knowledge store schema")?;

        debug!("Opened knowledge store");
        Ok(Self { conn })
    }

    /// Ingest document text under a source name, returning the chunk count.
    ///
    /// Re-ingesting the same source deletes and replaces its chunks.
    pub fn ingest(&mut self, source: &str, text: &str, options: &IngestOptions) -> Result<usize> {
        debug!(source, text_len = text.len(), chunk_size = options.chunk_size, "ingest: called");
        let chunks = split_chunks(text, options.chunk_size);
        let now = Utc::now().timestamp_millis();

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE source = ?1", [source])?;
        {
            let mut stmt = tx.prepare("INSERT INTO chunks (source, content, created_at) VALUES (?1, ?2, ?3)")?;
            for chunk in &chunks {
                stmt.execute(rusqlite::params![source, chunk, now])?;
            }
        }
        tx.commit()?;

        info!(source, chunk_count = chunks.len(), "Ingestion complete");
        Ok(chunks.len())
    }

    /// Answer a query with a ranked, deduplicated context block.
    ///
    /// Empty query or empty index yields an empty result, never an error.
    pub fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<Retrieval> {
        debug!(query, "retrieve: called");
        let terms = extract_terms(query);
        if terms.is_empty() {
            debug!("retrieve: no usable terms in query");
            return Ok(Retrieval::default());
        }

        let match_expr = terms
            .iter()
            .map(|t| format!("\"{}\"*", t))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut stmt = self.conn.prepare(
            "SELECT c.source, c.content
             FROM chunks_fts f JOIN chunks c ON c.id = f.rowid
             WHERE chunks_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;

        let candidates: Vec<Candidate> = stmt
            .query_map(rusqlite::params![match_expr, options.recall_limit as i64], |row| {
                Ok(Candidate {
                    source: row.get(0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        debug!(candidate_count = candidates.len(), "retrieve: recall complete");
        if candidates.is_empty() {
            return Ok(Retrieval::default());
        }

        // Re-rank by coverage: distinct terms found as case-insensitive
        // substrings / total distinct terms. Native FTS rank breaks ties.
        let mut scored: Vec<(f64, usize, &Candidate)> = candidates
            .iter()
            .enumerate()
            .map(|(rank, c)| (coverage_score(&terms, &c.content), rank, c))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));

        let mut seen = HashSet::new();
        let mut blocks = Vec::new();
        let mut trace_lines = vec![
            format!("terms: {}", terms.join(", ")),
            format!("candidates: {}", candidates.len()),
        ];

        for (score, rank, candidate) in scored.into_iter().take(options.top_k) {
            if !seen.insert(candidate.content.clone()) {
                continue;
            }
            blocks.push(format!("source: {}\n{}", candidate.source, candidate.content));
            trace_lines.push(format!(
                "score={:.2} rank={} source={} preview={:?}",
                score,
                rank,
                candidate.source,
                preview(&candidate.content, 80)
            ));
        }

        Ok(Retrieval {
            context: blocks.join("\n---\n"),
            trace: trace_lines.join("\n"),
        })
    }

    /// Remove all chunks ingested under a source name
    pub fn delete_by_source(&self, source: &str) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM chunks WHERE source = ?1", [source])?;
        info!(source, removed, "Deleted chunks by source");
        Ok(removed)
    }

    /// Remove every chunk in the store
    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM chunks", [])?;
        info!("Cleared knowledge store");
        Ok(())
    }

    /// Chunk and source counts
    pub fn stats(&self) -> Result<StoreStats> {
        let chunk_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        let source_count: i64 =
            self.conn
                .query_row("SELECT COUNT(DISTINCT source) FROM chunks", [], |r| r.get(0))?;
        Ok(StoreStats {
            chunk_count: chunk_count as usize,
            source_count: source_count as usize,
        })
    }
}

/// Sanitize a query to alphanumeric (incl. CJK) plus whitespace, then
/// tokenize into distinct lowercase terms, preserving first-seen order.
fn extract_terms(query: &str) -> Vec<String> {
    let sanitized: String = query
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();

    let mut seen = HashSet::new();
    sanitized
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of distinct query terms found as a substring of the chunk
fn coverage_score(terms: &[String], content: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = content.to_lowercase();
    let found = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    found as f64 / terms.len() as f64
}

fn preview(content: &str, max_chars: usize) -> String {
    let flat = content.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        flat.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(chunks: &[(&str, &str)]) -> KnowledgeStore {
        let mut store = KnowledgeStore::open_in_memory().unwrap();
        for (source, text) in chunks {
            store.ingest(source, text, &IngestOptions::default()).unwrap();
        }
        store
    }

    #[test]
    fn test_retrieve_ranks_full_match_first() {
        let store = store_with(&[
            ("geo.txt", "Paris is the capital of France."),
            ("geo2.txt", "Tokyo is the capital of Japan."),
        ]);

        let result = store.retrieve("capital France", &RetrieveOptions::default()).unwrap();

        let blocks: Vec<&str> = result.context.split("\n---\n").collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("Paris"));
        assert!(blocks[1].contains("Tokyo"));
        assert!(result.trace.contains("score=1.00"));
        assert!(result.trace.contains("score=0.50"));
    }

    #[test]
    fn test_coverage_score_bounds() {
        let terms = vec!["capital".to_string(), "france".to_string()];
        assert_eq!(coverage_score(&terms, "Paris is the capital of France."), 1.0);
        assert_eq!(coverage_score(&terms, "Tokyo is the capital of Japan."), 0.5);
        assert_eq!(coverage_score(&terms, "unrelated text"), 0.0);
    }

    #[test]
    fn test_empty_query_yields_empty_result() {
        let store = store_with(&[("a.txt", "some content here")]);
        let result = store.retrieve("", &RetrieveOptions::default()).unwrap();
        assert!(result.is_empty());
        // punctuation-only sanitizes to nothing
        let result = store.retrieve("!!! ???", &RetrieveOptions::default()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_empty_index_yields_empty_result() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        let result = store.retrieve("anything", &RetrieveOptions::default()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_reingest_replaces_by_source() {
        let mut store = store_with(&[("doc.txt", "old content about rust")]);
        store
            .ingest("doc.txt", "new content about rust", &IngestOptions::default())
            .unwrap();

        let result = store.retrieve("rust content", &RetrieveOptions::default()).unwrap();
        assert!(result.context.contains("new content"));
        assert!(!result.context.contains("old content"));
        assert_eq!(store.stats().unwrap().chunk_count, 1);
    }

    #[test]
    fn test_delete_by_source_and_clear() {
        let store = store_with(&[("a.txt", "alpha text"), ("b.txt", "beta text")]);
        assert_eq!(store.delete_by_source("a.txt").unwrap(), 1);
        assert_eq!(store.stats().unwrap().source_count, 1);

        store.clear().unwrap();
        assert_eq!(store.stats().unwrap().chunk_count, 0);
    }

    #[test]
    fn test_duplicate_content_deduplicated() {
        let store = store_with(&[
            ("a.txt", "identical chunk of text"),
            ("b.txt", "identical chunk of text"),
        ]);
        let result = store.retrieve("identical chunk", &RetrieveOptions::default()).unwrap();
        assert_eq!(result.context.matches("identical chunk of text").count(), 1);
    }

    #[test]
    fn test_prefix_wildcard_recall() {
        let store = store_with(&[("doc.txt", "The orchestration engine coordinates streams.")]);
        let result = store.retrieve("orchestr", &RetrieveOptions::default()).unwrap();
        assert!(result.context.contains("orchestration"));
    }

    #[test]
    fn test_trace_lists_terms_and_candidates() {
        let store = store_with(&[("geo.txt", "Paris is the capital of France.")]);
        let result = store.retrieve("capital France", &RetrieveOptions::default()).unwrap();
        assert!(result.trace.contains("terms: capital, france"));
        assert!(result.trace.contains("candidates: 1"));
    }

    #[test]
    fn test_source_prefix_in_context() {
        let store = store_with(&[("notes.md", "Rust ownership rules.")]);
        let result = store.retrieve("ownership", &RetrieveOptions::default()).unwrap();
        assert!(result.context.starts_with("source: notes.md\n"));
    }
}
