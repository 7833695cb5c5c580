//! ChatEngine CLI entry point

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use chatengine::cli::{Cli, Command};
use chatengine::config::Config;
use chatengine::gateway::{KnowledgeRetriever, NullGateway, PersistenceGateway, Retriever, UiEvent};
use chatengine::orchestrator::{Orchestrator, TurnStatus};
use chatengine::transport::{StreamClient, StreamTransport};
use chatengine::Role;
use knowledgestore::{IngestOptions, KnowledgeStore};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to WARN", other);
            tracing::Level::WARN
        }
        None => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate()?;

    match cli.command {
        Command::Send {
            prompt,
            image,
            no_retrieval,
        } => {
            send_one(&config, &prompt, &image, no_retrieval).await?;
        }
        Command::Ingest { files } => {
            if let Some(parent) = config.knowledge_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut store = KnowledgeStore::open(&config.knowledge_path)?;
            let options = IngestOptions::default();
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
        Command::Check => {
            println!("{} configuration is valid", "✓".green());
            println!("  provider: {} ({})", config.provider.label().cyan(), config.provider.model());
            match &config.fallback {
                Some(fb) => println!("  fallback: {} ({})", fb.label().cyan(), fb.model()),
                None => println!("  fallback: {}", "none".dimmed()),
            }
            println!("  knowledge: {}", config.knowledge_path.display());
        }
    }

    Ok(())
}

/// Run one orchestrated turn, streaming the reply to stdout.
async fn send_one(config: &Config, prompt: &str, images: &[std::path::PathBuf], no_retrieval: bool) -> Result<()> {
    let mut orchestrator_config = config.orchestrator.clone();
    if no_retrieval {
        orchestrator_config.retrieval = false;
    }

    let retriever: Option<Arc<dyn Retriever>> = if orchestrator_config.retrieval && config.knowledge_path.exists() {
        let store = KnowledgeStore::open(&config.knowledge_path)?;
        Some(Arc::new(KnowledgeRetriever::new(store)))
    } else {
        None
    };

    let transport: Arc<dyn StreamTransport> = Arc::new(StreamClient::new(config.proxy.clone()));
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(NullGateway);
    let (ui_tx, ui_rx) = mpsc::channel(256);

    let session_id = uuid::Uuid::now_v7().to_string();
    info!(%session_id, "starting one-shot turn");

    let printer = tokio::spawn(print_ui_events(ui_rx));

    let mut orchestrator = Orchestrator::new(
        session_id,
        config.provider.clone(),
        config.fallback.clone(),
        orchestrator_config,
        transport,
        gateway,
        retriever,
        ui_tx,
    );

    let report = orchestrator.send(prompt, images).await?;
    drop(orchestrator);
    let _ = printer.await;

    match report.status {
        TurnStatus::Completed { .. } => {
            println!();
            Ok(())
        }
        TurnStatus::Cancelled => {
            println!();
            eprintln!("{}", "generation cancelled".yellow());
            Ok(())
        }
        TurnStatus::Failed(err) => Err(eyre::eyre!("{}", err.user_message())),
    }
}

/// Render orchestrator UI events on the terminal.
async fn print_ui_events(mut ui_rx: mpsc::Receiver<UiEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = ui_rx.recv().await {
        match event {
            UiEvent::AppendToLast(delta) => {
                print!("{}", delta);
                let _ = stdout.flush();
            }
            UiEvent::ReplaceLastContent(content) if !content.is_empty() => {
                println!("\n{}", content);
            }
            UiEvent::MessageAdded { role: Role::System, content } => {
                eprintln!("{}", content.yellow());
            }
            _ => {}
        }
    }
}
