//! CLI argument parsing for knowledgestore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ks")]
#[command(author, version, about = "Local full-text retrieval engine", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest text files into the index
    Ingest {
        /// File paths to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Chunk size in characters
        #[arg(short = 's', long)]
        chunk_size: Option<usize>,
    },

    /// Query the index for relevant context
    Query {
        /// Natural-language query text
        #[arg(required = true)]
        text: String,

        /// Number of chunks to keep
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Print the diagnostic trace instead of the context block
        #[arg(long)]
        trace: bool,
    },

    /// Remove all chunks ingested from a source file
    Forget {
        /// Source filename to remove
        #[arg(required = true)]
        source: String,
    },

    /// Remove every chunk in the index
    Clear,

    /// Show index statistics
    Stats,
}
