// crates/dossier-server/src/pipeline/format.rs
// Stage 4: render the analysis as cited prose
//
// The local model writes the final answer under a strict style contract
// (prose only, the user's language, a [#id] citation after every
// factual claim, trailing Sources line). The citation normalizer then
// enforces the grounding discipline regardless of how well the model
// followed instructions; if the model is unavailable the answer is
// composed deterministically from the findings.

use dossier_types::Analysis;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::llm::{CompletionRequest, LocalModelPool};
use crate::pipeline::citations::normalize_answer;
use crate::pipeline::language::{Language, language_name};

/// Token budget for the formatting completion.
const FORMAT_MAX_TOKENS: u32 = 512;

/// Sampling temperature for prose generation.
const FORMAT_TEMPERATURE: f32 = 0.7;

/// Soft upper bound for one chunk event, split on word boundaries.
const CHUNK_CHARS: usize = 400;

fn build_format_prompt(question: &str, analysis: &Analysis, lang: Language) -> String {
    let analysis_json =
        serde_json::to_string_pretty(analysis).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Write the final answer for an investigative research tool.\n\
         Question: {question}\n\nAnalysis (JSON):\n{analysis_json}\n\n\
         Style contract:\n\
         - Prose only. No bullet lists, no headings.\n\
         - Respond in {language}.\n\
         - After every factual claim, cite its document like [#123], using only ids \
           from the analysis \"sources\" list.\n\
         - End with a final line: Sources: [#id1] [#id2] ...\n",
        language = language_name(lang),
    )
}

/// Deterministic fallback prose when the formatting model is out of
/// reach: findings joined into a paragraph, each carrying a citation.
pub fn compose_fallback_prose(analysis: &Analysis) -> String {
    if analysis.findings.is_empty() {
        return String::new();
    }
    let mut sources = analysis.sources.iter().cycle();
    analysis
        .findings
        .iter()
        .map(|finding| {
            let sentence = finding.trim_end_matches(['.', ' ']).to_string();
            match sources.next() {
                Some(id) => format!("{sentence} [#{id}]."),
                None => format!("{sentence}."),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split prose into chunk-event sized pieces on word boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_inclusive(char::is_whitespace) {
        if !current.is_empty() && current.chars().count() + word.chars().count() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Run stage 4: generate, normalize, and chunk the final answer.
///
/// Returns the normalized full text plus its chunk events. Model
/// trouble degrades to the deterministic composition; only cancellation
/// propagates.
pub async fn format_answer(
    pool: &LocalModelPool,
    question: &str,
    analysis: &Analysis,
    lang: Language,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(String, Vec<String>), EngineError> {
    let req = CompletionRequest::new(
        build_format_prompt(question, analysis, lang),
        FORMAT_MAX_TOKENS,
        FORMAT_TEMPERATURE,
    );

    let raw = match pool.complete_with_retry(req, deadline, cancel).await {
        Ok(raw) if !raw.trim().is_empty() => raw,
        Ok(_) => {
            debug!("Formatting model returned empty prose, composing deterministically");
            compose_fallback_prose(analysis)
        }
        Err(EngineError::Cancelled) if cancel.is_cancelled() => return Err(EngineError::Cancelled),
        Err(e) => {
            debug!("Formatting stage degraded ({e}), composing deterministically");
            compose_fallback_prose(analysis)
        }
    };

    let answer = normalize_answer(&raw, &analysis.sources);
    let chunks = chunk_text(&answer, CHUNK_CHARS);
    Ok((answer, chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::backend::testing::{ScriptStep, ScriptedBackend};
    use dossier_types::Confidence;
    use std::sync::Arc;
    use std::time::Duration;

    fn analysis() -> Analysis {
        Analysis {
            findings: vec![
                "A and B were on the 2002 flight".into(),
                "A met B on the island".into(),
            ],
            sources: vec![10, 11],
            confidence: Confidence::High,
            hypotheses: vec![],
            contradictions: vec![],
            suggested_queries: vec!["who is B".into()],
        }
    }

    fn pool(steps: Vec<ScriptStep>) -> LocalModelPool {
        LocalModelPool::new(Arc::new(ScriptedBackend::new(steps)), 1, 8)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_chunk_text_respects_boundaries() {
        let text = "alpha beta gamma delta".repeat(40);
        let chunks = chunk_text(&text, 100);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 101);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_chunk_text_short_is_single() {
        assert_eq!(chunk_text("short answer", 400), vec!["short answer"]);
        assert!(chunk_text("", 400).is_empty());
    }

    #[test]
    fn test_fallback_prose_cites_every_finding() {
        let prose = compose_fallback_prose(&analysis());
        assert!(prose.contains("[#10]"));
        assert!(prose.contains("[#11]"));
        assert!(prose.contains("2002 flight"));
    }

    #[test]
    fn test_fallback_prose_empty_findings() {
        let a = Analysis::default();
        assert_eq!(compose_fallback_prose(&a), "");
    }

    #[tokio::test]
    async fn test_format_normalizes_model_output() {
        let pool = pool(vec![ScriptStep::Reply(
            "A flew with B [#10] [3]. They met later [#11] and [#999].\nSources: [#10]".into(),
        )]);
        let cancel = CancellationToken::new();
        let (answer, chunks) =
            format_answer(&pool, "q", &analysis(), Language::English, soon(), &cancel)
                .await
                .unwrap();

        assert!(answer.contains("[#10]"));
        assert!(answer.contains("[#11]"));
        assert!(!answer.contains("[3]"));
        assert!(!answer.contains("999"));
        assert!(answer.ends_with("Sources: [#10] [#11]"));
        assert_eq!(chunks.concat(), answer);
    }

    #[tokio::test]
    async fn test_format_model_failure_composes_deterministically() {
        let pool = pool(vec![
            ScriptStep::Fail("down".into()),
            ScriptStep::Fail("down".into()),
        ]);
        let cancel = CancellationToken::new();
        let (answer, _) =
            format_answer(&pool, "q", &analysis(), Language::English, soon(), &cancel)
                .await
                .unwrap();

        // Degraded, but still grounded with a valid Sources line
        assert!(answer.contains("[#10]"));
        assert!(answer.ends_with("Sources: [#10] [#11]"));
    }

    #[tokio::test]
    async fn test_format_cancellation_propagates() {
        let pool = pool(vec![ScriptStep::Hang]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = format_answer(&pool, "q", &analysis(), Language::English, soon(), &cancel).await;
        assert!(matches!(res, Err(EngineError::Cancelled)));
    }
}
