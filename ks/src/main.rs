use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use knowledgestore::cli::{Cli, Command};
use knowledgestore::config::Config;
use knowledgestore::{IngestOptions, KnowledgeStore, RetrieveOptions};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("knowledgestore starting");

    if let Some(parent) = config.store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match cli.command {
        Command::Ingest { files, chunk_size } => {
            let mut store = KnowledgeStore::open(&config.store_path)?;
            let options = IngestOptions {
                chunk_size: chunk_size.unwrap_or(config.chunk_size),
            };
            for file in files {
                let text = std::fs::read_to_string(&file)
                    .context(format!("Failed to read {}", file.display()))?;
                let source = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| file.display().to_string());
                let count = store.ingest(&source, &text, &options)?;
                println!("{} Ingested {} as {} chunks", "✓".green(), source.cyan(), count);
            }
        }
        Command::Query { text, top_k, trace } => {
            let store = KnowledgeStore::open(&config.store_path)?;
            let options = RetrieveOptions {
                recall_limit: config.recall_limit,
                top_k: top_k.unwrap_or(config.top_k),
            };
            let result = store.retrieve(&text, &options)?;
            if result.is_empty() {
                println!("No matching chunks");
            } else if trace {
                println!("{}", result.trace);
            } else {
                println!("{}", result.context);
            }
        }
        Command::Forget { source } => {
            let store = KnowledgeStore::open(&config.store_path)?;
            let removed = store.delete_by_source(&source)?;
            println!("{} Removed {} chunks from {}", "✓".green(), removed, source);
        }
        Command::Clear => {
            let store = KnowledgeStore::open(&config.store_path)?;
            store.clear()?;
            println!("{} Cleared index", "✓".green());
        }
        Command::Stats => {
            let store = KnowledgeStore::open(&config.store_path)?;
            let stats = store.stats()?;
            println!("Chunks: {}", stats.chunk_count);
            println!("Sources: {}", stats.source_count);
        }
    }

    Ok(())
}
