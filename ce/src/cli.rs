//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ChatEngine - streaming conversation engine
#[derive(Parser)]
#[command(name = "ce", about = "Streaming conversation engine with local knowledge retrieval")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one prompt and stream the reply to stdout
    Send {
        /// The prompt text
        prompt: String,

        /// Image files to attach
        #[arg(short, long)]
        image: Vec<PathBuf>,

        /// Disable knowledge retrieval for this turn
        #[arg(long)]
        no_retrieval: bool,
    },

    /// Ingest files into the knowledge store
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Validate the configuration and print the resolved providers
    Check,
}
