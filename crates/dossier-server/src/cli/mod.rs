// crates/dossier-server/src/cli/mod.rs
// Command-line interface

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dossier_types::Document;

use crate::config::EngineConfig;
use crate::db::{
    DatabasePool, count_documents_sync, insert_document_sync, read_budget_sync, today_utc,
    total_admissions_sync,
};
use crate::search::SearchIndex;
use crate::services::Services;

#[derive(Parser)]
#[command(name = "dossier", version, about = "Investigative corpus QA engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Run a ranked search against the corpus and print the hits
    Search {
        /// Search terms
        query: Vec<String>,
        /// Maximum hits to print
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Print today's counters and corpus size
    Stats,
    /// Load documents into the corpus from a JSON-lines file
    Ingest {
        /// File with one JSON document object per line
        file: PathBuf,
    },
}

/// `dossier serve`
pub async fn run_serve() -> Result<()> {
    let config = EngineConfig::from_env();
    let services = Services::from_config(config).await?;
    crate::web::serve(services).await
}

/// `dossier search <terms>`
pub async fn run_search(query: Vec<String>, limit: u32) -> Result<()> {
    let config = EngineConfig::from_env();
    let db = Arc::new(DatabasePool::open(Path::new(&config.database_url)).await?);
    let index = SearchIndex::new(db, config.ranking.clone());

    let terms = query.join(" ");
    let hits = index
        .search(&terms, limit)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    for hit in hits {
        let date = hit
            .timestamp
            .map(|t| t.to_string())
            .unwrap_or_else(|| "undated".into());
        println!(
            "[#{}] {:.3} {} ({}, {})\n    {}",
            hit.doc_id,
            hit.score,
            hit.title,
            hit.kind.as_str(),
            date,
            hit.snippet
        );
    }
    Ok(())
}

/// `dossier stats`
pub async fn run_stats() -> Result<()> {
    let config = EngineConfig::from_env();
    let db = DatabasePool::open(Path::new(&config.database_url)).await?;

    let day = today_utc();
    let (documents, budget, admissions) = db
        .read(move |conn| {
            Ok((
                count_documents_sync(conn)?,
                read_budget_sync(conn, &day)?,
                total_admissions_sync(conn, &day)?,
            ))
        })
        .await?;

    println!("corpus documents:    {documents}");
    println!("admissions today:    {admissions}");
    println!("external calls:      {}/{}", budget.external_calls, config.external_daily_cap);
    println!(
        "external cost (µ$):  {}/{}",
        budget.cost_micro_usd, config.cost_cap_micro_usd
    );
    Ok(())
}

/// `dossier ingest <file>` - load document rows produced by the
/// extraction tooling. One JSON object per line; the whole file is
/// written as a batch so a malformed line loads nothing.
pub async fn run_ingest(file: PathBuf) -> Result<()> {
    let config = EngineConfig::from_env();
    let db = DatabasePool::open(Path::new(&config.database_url)).await?;

    let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;

    let mut documents = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let doc = parse_document_line(line)
            .with_context(|| format!("{}:{}", file.display(), lineno + 1))?;
        documents.push(doc);
    }
    if documents.is_empty() {
        println!("Nothing to ingest.");
        return Ok(());
    }

    let count = documents.len();
    db.write(move |conn| {
        for doc in &documents {
            insert_document_sync(conn, doc)?;
        }
        Ok(())
    })
    .await?;

    println!("Ingested {count} documents.");
    Ok(())
}

/// Parse one JSON-lines record into a document.
fn parse_document_line(line: &str) -> Result<Document> {
    serde_json::from_str(line).map_err(|e| anyhow::anyhow!("not a document object: {e}"))
}
