// crates/dossier-server/src/pipeline/analyze.rs
// Stage 3: grounded analysis of the retrieved hits
//
// The external analyst is preferred; budget exhaustion or a dead
// upstream reroutes through the local pool with a reduced prompt that
// asks only for findings and sources. Whatever path produced the
// analysis, its sources are clamped to the retrieval context before the
// formatting stage sees them.

use dossier_types::{Analysis, Confidence, SearchHit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::llm::external::{fallback_analysis, parse_analysis};
use crate::llm::{CompletionRequest, ExternalModelClient, LocalModelPool};

/// Token budget for the external analysis completion.
const ANALYZE_MAX_TOKENS: u32 = 1024;

/// Token budget for the reduced local fallback.
const LOCAL_ANALYZE_MAX_TOKENS: u32 = 256;

const ANALYSIS_SYSTEM: &str = "You are an investigative analyst. You receive numbered corpus \
documents and answer with exactly one JSON object, no prose around it:\n\
{\"findings\": [\"...\"], \"sources\": [id, ...], \"confidence\": \"low\"|\"medium\"|\"high\", \
\"hypotheses\": [\"...\"], \"contradictions\": [\"...\"], \"suggested_queries\": [\"...\"]}\n\
Every finding must be supported by a listed source id. Only cite ids that appear in the \
context block.";

/// Serialize the hits into the compact context block both analysis
/// prompts share.
pub fn build_context_block(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| {
            let date = h
                .timestamp
                .map(|t| t.to_string())
                .unwrap_or_else(|| "undated".to_string());
            let sender = h.sender.as_deref().unwrap_or("unknown sender");
            format!(
                "[#{}] {} ({}, {}, {}): {}",
                h.doc_id,
                h.title,
                h.kind.as_str(),
                date,
                sender,
                h.snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_analysis_prompt(question: &str, hits: &[SearchHit]) -> String {
    format!(
        "Question: {question}\n\nContext documents:\n{}\n\nRespond with the JSON object.",
        build_context_block(hits)
    )
}

fn build_local_prompt(question: &str, hits: &[SearchHit]) -> String {
    format!(
        "Question: {question}\n\nContext documents:\n{}\n\n\
         Respond with exactly one JSON object on a single line: \
         {{\"findings\": [\"short factual statement\", ...], \"sources\": [id, ...]}} \
         Use only ids from the context block.",
        build_context_block(hits)
    )
}

/// Keep only sources that were actually in the retrieval context,
/// preserving the analysis order.
fn clamp_sources(analysis: &mut Analysis, hits: &[SearchHit]) {
    analysis
        .sources
        .retain(|id| hits.iter().any(|h| h.doc_id == *id));
    if analysis.sources.is_empty() {
        // An analysis with no resolvable sources cannot ground an answer;
        // fall back to citing the top hits.
        analysis.sources = hits.iter().take(5).map(|h| h.doc_id).collect();
    }
}

/// Run stage 3.
///
/// `budget_exhausted` comes from admission; the external client also
/// re-checks at call time. `Budget`/`Upstream` failures reroute locally
/// and are invisible to the caller; only cancellation propagates.
pub async fn analyze(
    external: Option<&ExternalModelClient>,
    pool: &LocalModelPool,
    question: &str,
    hits: &[SearchHit],
    budget_exhausted: bool,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Analysis, EngineError> {
    let context_ids: Vec<i64> = hits.iter().map(|h| h.doc_id).collect();

    if !budget_exhausted {
        if let Some(client) = external {
            let prompt = build_analysis_prompt(question, hits);
            match client
                .analyze(
                    ANALYSIS_SYSTEM,
                    &prompt,
                    ANALYZE_MAX_TOKENS,
                    &context_ids,
                    hits.len(),
                    cancel,
                )
                .await
            {
                Ok(mut analysis) => {
                    clamp_sources(&mut analysis, hits);
                    return Ok(analysis);
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(EngineError::Budget) => {
                    debug!("External budget exhausted, rerouting analysis locally");
                }
                Err(e) => {
                    info!("External analysis failed ({e}), rerouting locally");
                }
            }
        }
    }

    analyze_locally(pool, question, hits, &context_ids, deadline, cancel).await
}

/// Reduced-quality local path: findings and sources only, confidence
/// capped at medium.
async fn analyze_locally(
    pool: &LocalModelPool,
    question: &str,
    hits: &[SearchHit],
    context_ids: &[i64],
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Analysis, EngineError> {
    let req = CompletionRequest::new(
        build_local_prompt(question, hits),
        LOCAL_ANALYZE_MAX_TOKENS,
        0.2,
    );

    let mut analysis = match pool.complete_with_retry(req, deadline, cancel).await {
        Ok(raw) => parse_analysis(&raw, hits.len(), context_ids),
        Err(EngineError::Cancelled) if cancel.is_cancelled() => return Err(EngineError::Cancelled),
        Err(e) => {
            debug!("Local analysis degraded ({e}), synthesizing from hits");
            fallback_analysis(hits.len(), context_ids)
        }
    };

    // The local path never produces hypotheses or contradictions, and
    // its confidence is at most medium.
    analysis.hypotheses.clear();
    analysis.contradictions.clear();
    analysis.confidence = Confidence::Medium;
    clamp_sources(&mut analysis, hits);

    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::backend::testing::{ScriptStep, ScriptedBackend};
    use dossier_types::DocumentKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn hit(doc_id: i64, title: &str) -> SearchHit {
        SearchHit {
            doc_id,
            title: title.into(),
            snippet: format!("snippet of {title}"),
            score: 1.0,
            kind: DocumentKind::Deposition,
            timestamp: chrono::NaiveDate::from_ymd_opt(2004, 2, 11),
            sender: None,
        }
    }

    fn pool(steps: Vec<ScriptStep>) -> LocalModelPool {
        LocalModelPool::new(Arc::new(ScriptedBackend::new(steps)), 1, 8)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_context_block_lines() {
        let block = build_context_block(&[hit(10, "Flight log 2002"), hit(11, "Deposition of A")]);
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[#10] Flight log 2002 (deposition, 2004-02-11,"));
        assert!(lines[1].contains("snippet of Deposition of A"));
    }

    #[tokio::test]
    async fn test_budget_exhausted_skips_external_and_uses_local() {
        // No external client configured at all also exercises this path.
        let pool = pool(vec![ScriptStep::Reply(
            r#"{"findings": ["A met B"], "sources": [11]}"#.into(),
        )]);
        let cancel = CancellationToken::new();
        let hits = vec![hit(10, "log"), hit(11, "deposition")];

        let analysis = analyze(None, &pool, "q", &hits, true, soon(), &cancel)
            .await
            .unwrap();
        assert_eq!(analysis.findings, vec!["A met B"]);
        assert_eq!(analysis.sources, vec![11]);
        assert_eq!(analysis.confidence, Confidence::Medium);
        assert!(analysis.hypotheses.is_empty());
    }

    #[tokio::test]
    async fn test_local_fallback_clamps_foreign_sources() {
        let pool = pool(vec![ScriptStep::Reply(
            r#"{"findings": ["x"], "sources": [99, 10]}"#.into(),
        )]);
        let cancel = CancellationToken::new();
        let hits = vec![hit(10, "log")];

        let analysis = analyze(None, &pool, "q", &hits, false, soon(), &cancel)
            .await
            .unwrap();
        assert_eq!(analysis.sources, vec![10]);
    }

    #[tokio::test]
    async fn test_local_model_failure_synthesizes_from_hits() {
        let pool = pool(vec![ScriptStep::Fail("dead".into()), ScriptStep::Fail("dead".into())]);
        let cancel = CancellationToken::new();
        let hits = vec![hit(10, "log"), hit(11, "deposition")];

        let analysis = analyze(None, &pool, "q", &hits, true, soon(), &cancel)
            .await
            .unwrap();
        assert_eq!(analysis.sources, vec![10, 11]);
        assert_eq!(analysis.confidence, Confidence::Medium);
        assert!(analysis.findings[0].contains("2 hits"));
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let pool = pool(vec![ScriptStep::Hang]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let hits = vec![hit(10, "log")];

        let res = analyze(None, &pool, "q", &hits, true, soon(), &cancel).await;
        assert!(matches!(res, Err(EngineError::Cancelled)));
    }
}
