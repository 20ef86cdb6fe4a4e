// crates/dossier-server/src/pipeline/retrieve.rs
// Stage 2: translate the intent into a corpus search

use std::time::Duration;

use dossier_types::{Intent, IntentKind, SearchHit};
use tracing::debug;

use crate::error::EngineError;
use crate::pipeline::intent::tokenize_nouns;
use crate::search::SearchIndex;

/// Hits fed to the analysis stage.
pub const RETRIEVE_LIMIT: u32 = 10;

/// Build the search term string for an intent.
///
/// `search` joins the entities; `connections` adds the configured
/// expansion tokens; `timeline` searches entities only (ordering happens
/// after retrieval). Empty entities fall back to the question's content
/// words.
pub fn build_search_terms(intent: &Intent, question: &str, expansion: &[String]) -> String {
    let mut terms: Vec<String> = if intent.entities.is_empty() {
        tokenize_nouns(question)
    } else {
        intent.entities.clone()
    };

    if intent.kind == IntentKind::Connections {
        terms.extend(expansion.iter().cloned());
    }

    terms.join(" ")
}

/// Run retrieval for the intent. Zero matches is a valid empty result.
pub async fn retrieve(
    index: &SearchIndex,
    intent: &Intent,
    question: &str,
    expansion: &[String],
    timeout: Duration,
) -> Result<Vec<SearchHit>, EngineError> {
    let terms = build_search_terms(intent, question, expansion);
    if terms.trim().is_empty() {
        debug!("No searchable terms in question, returning empty retrieval");
        return Ok(Vec::new());
    }

    let mut hits = tokio::time::timeout(timeout, index.search(&terms, RETRIEVE_LIMIT))
        .await
        .map_err(|_| EngineError::IndexUnavailable("search deadline elapsed".into()))??;

    if intent.kind == IntentKind::Timeline {
        // Chronological story order; undated documents go last.
        hits.sort_by(|a, b| match (a.timestamp, b.timestamp) {
            (Some(ta), Some(tb)) => ta.cmp(&tb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.doc_id.cmp(&b.doc_id),
        });
    }

    debug!(kind = intent.kind.as_str(), hits = hits.len(), "Retrieval complete");
    Ok(hits)
}
