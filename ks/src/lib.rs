//! KnowledgeStore - local full-text retrieval for prompt augmentation
//!
//! Ingests plain-text documents into an SQLite FTS5 index and answers
//! natural-language queries with a ranked, deduplicated context block.
//! Recall happens in two stages: FTS5 keyword recall in native rank order,
//! then an in-memory re-rank by query-term coverage.
//!
//! # Example
//!
//! ```ignore
//! use knowledgestore::{KnowledgeStore, IngestOptions, RetrieveOptions};
//!
//! let store = KnowledgeStore::open("knowledge.db")?;
//! store.ingest("notes.txt", &text, &IngestOptions::default())?;
//! let result = store.retrieve("capital France", &RetrieveOptions::default())?;
//! println!("{}", result.context);
//! ```

pub mod chunk;
pub mod cli;
pub mod config;
mod store;

pub use chunk::split_chunks;
pub use store::{IngestOptions, KnowledgeStore, Retrieval, RetrieveOptions, StoreStats};

/// Default chunk size in characters
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default FTS recall candidate count
pub const DEFAULT_RECALL_LIMIT: usize = 20;

/// Default number of re-ranked chunks kept for the context block
pub const DEFAULT_TOP_K: usize = 5;
