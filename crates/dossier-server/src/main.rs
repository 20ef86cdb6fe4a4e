// crates/dossier-server/src/main.rs
// Dossier - investigative question answering over an immutable document corpus

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use dossier::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.dossier/.env only (never from CWD - an untrusted
    // working directory must not be able to override API keys)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".dossier/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Some(Commands::Serve) | None => Level::INFO,
        Some(Commands::Search { .. }) => Level::WARN,
        Some(Commands::Stats) => Level::WARN,
        Some(Commands::Ingest { .. }) => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        None | Some(Commands::Serve) => dossier::cli::run_serve().await,
        Some(Commands::Search { query, limit }) => dossier::cli::run_search(query, limit).await,
        Some(Commands::Stats) => dossier::cli::run_stats().await,
        Some(Commands::Ingest { file }) => dossier::cli::run_ingest(file).await,
    }
}
