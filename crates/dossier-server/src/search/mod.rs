// crates/dossier-server/src/search/mod.rs
// Lexical search over the corpus: FTS retrieval, rank composition,
// snippet extraction

pub mod rank;
pub mod snippet;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dossier_types::SearchHit;
use tracing::{debug, warn};

use crate::config::RankingConfig;
use crate::db::{DatabasePool, fts_search_sync};
use crate::error::EngineError;

/// Maximum hits a single query may request.
pub const MAX_SEARCH_LIMIT: u32 = 100;

/// Candidates fetched from the index before re-ranking. Wider than any
/// allowed limit so rank composition can promote late lexical matches.
const CANDIDATE_POOL: u32 = 100;

/// Delay before the single retry on an unavailable index.
const INDEX_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Split a raw term string into lowercase alphanumeric tokens,
/// deduplicated but order-preserving.
pub fn tokenize_terms(terms: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in terms
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if !seen.iter().any(|s| s == token) {
            seen.push(token.to_string());
        }
    }
    seen
}

/// Ranked full-text search over the document corpus.
pub struct SearchIndex {
    db: Arc<DatabasePool>,
    ranking: RankingConfig,
}

impl SearchIndex {
    pub fn new(db: Arc<DatabasePool>, ranking: RankingConfig) -> Self {
        Self { db, ranking }
    }

    /// Search the corpus and return up to `limit` ranked hits.
    ///
    /// Fails with `InvalidQuery` for blank terms or a limit outside
    /// [1, 100]. A database failure is retried once after 200 ms, then
    /// surfaced as `IndexUnavailable`. Zero matches is an empty result,
    /// never an error.
    pub async fn search(&self, terms: &str, limit: u32) -> Result<Vec<SearchHit>, EngineError> {
        if terms.trim().is_empty() {
            return Err(EngineError::InvalidQuery("empty search terms".into()));
        }
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(EngineError::InvalidQuery(format!(
                "limit must be in [1, {MAX_SEARCH_LIMIT}], got {limit}"
            )));
        }

        let tokens = tokenize_terms(terms);
        if tokens.is_empty() {
            return Err(EngineError::InvalidQuery(
                "search terms contain no searchable tokens".into(),
            ));
        }

        let candidates = match self.fetch_candidates(tokens.clone()).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Search index query failed, retrying once: {e}");
                tokio::time::sleep(INDEX_RETRY_DELAY).await;
                self.fetch_candidates(tokens.clone())
                    .await
                    .map_err(|e| EngineError::IndexUnavailable(e.to_string()))?
            }
        };

        let today = Utc::now().date_naive();
        let scored: Vec<_> = candidates
            .into_iter()
            .map(|c| {
                let score =
                    rank::compose_score(c.lexical, c.kind, c.timestamp, today, &self.ranking);
                (c, score)
            })
            .collect();

        let hits: Vec<SearchHit> = rank::order_candidates(scored)
            .into_iter()
            .take(limit as usize)
            .map(|(c, score)| SearchHit {
                doc_id: c.doc_id,
                title: c.title,
                snippet: snippet::build_snippet(&c.body, &tokens),
                score,
                kind: c.kind,
                timestamp: c.timestamp,
                sender: c.sender,
            })
            .collect();

        debug!(terms = %terms, hits = hits.len(), "Search complete");
        Ok(hits)
    }

    async fn fetch_candidates(
        &self,
        tokens: Vec<String>,
    ) -> anyhow::Result<Vec<crate::db::FtsCandidate>> {
        self.db
            .read(move |conn| fts_search_sync(conn, &tokens, CANDIDATE_POOL))
            .await
    }
}
