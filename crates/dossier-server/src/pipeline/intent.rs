// crates/dossier-server/src/pipeline/intent.rs
// Stage 1: classify the question into a structured intent
//
// The local model gets a strict single-JSON-object prompt at
// temperature 0. Its output is parsed defensively: code fences and list
// markers are stripped, then the first line that starts with `{` and
// parses as JSON with `intent` and `entities` keys wins. Anything else
// falls back to a heuristic search intent over the question's content
// words.

use dossier_types::{Intent, IntentFilters, IntentKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::llm::{CompletionRequest, LocalModelPool};
use crate::pipeline::language::english_stopwords;

/// Token budget for the intent completion.
const INTENT_MAX_TOKENS: u32 = 128;

/// Prompt template demanding a single JSON object.
const INTENT_PROMPT: &str = r#"Classify the investigative question below.

Respond with exactly one JSON object on a single line and nothing else:
{"intent": "search" | "connections" | "timeline", "entities": ["term", ...], "filters": {"date_from": "", "date_to": "", "sender": "", "recipient": ""}}

- "search": find documents about the entities
- "connections": how the entities are linked to each other
- "timeline": order events involving the entities chronologically
- "entities": the names, places and subjects the question is about, normalized to lowercase
- omit filter keys you cannot fill

Question: "#;

/// Build the stage 1 prompt for a question.
pub fn build_intent_prompt(question: &str) -> String {
    format!("{INTENT_PROMPT}{question}")
}

/// Heuristic entity extraction: lowercase content words of the question,
/// stopwords and single letters removed, order preserved, deduplicated.
pub fn tokenize_nouns(question: &str) -> Vec<String> {
    let stopwords = english_stopwords();
    let mut seen = Vec::new();
    for token in question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .filter(|t| !stopwords.contains(t))
    {
        if !seen.iter().any(|s| s == token) {
            seen.push(token.to_string());
        }
    }
    seen
}

/// Strip code-fence markers and leading list markers from a model line.
fn clean_line(line: &str) -> &str {
    let mut line = line.trim();
    for marker in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(marker) {
            line = rest.trim_start();
        }
    }
    line
}

/// Parse the model's intent output. Returns None when no line qualifies.
pub fn parse_intent_response(raw: &str) -> Option<Intent> {
    for line in raw.lines() {
        let line = clean_line(line);
        if line.starts_with("```") {
            continue;
        }
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        // The contract requires both keys; reject lookalike objects.
        let (Some(intent), Some(entities)) = (value.get("intent"), value.get("entities")) else {
            continue;
        };

        let kind = intent.as_str().map(IntentKind::parse).unwrap_or_default();
        let entities: Vec<String> = entities
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| e.as_str())
                    .map(|e| e.trim().to_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let filters = value
            .get("filters")
            .map(parse_filters)
            .unwrap_or_default();

        return Some(Intent {
            kind,
            entities,
            filters,
        });
    }
    None
}

fn parse_filters(value: &serde_json::Value) -> IntentFilters {
    let field = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    IntentFilters {
        date_from: field("date_from"),
        date_to: field("date_to"),
        sender: field("sender"),
        recipient: field("recipient"),
    }
}

/// Run stage 1 against the local pool.
///
/// Model trouble of any kind (deadline, queue pressure, panic, garbage
/// output) falls back to the heuristic intent; only cancellation
/// propagates.
pub async fn parse_intent(
    pool: &LocalModelPool,
    question: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Intent, EngineError> {
    let req = CompletionRequest::new(build_intent_prompt(question), INTENT_MAX_TOKENS, 0.0);

    match pool.complete_with_retry(req, deadline, cancel).await {
        Ok(raw) => Ok(parse_intent_response(&raw).unwrap_or_else(|| {
            debug!("Intent output unparseable, using heuristic fallback");
            Intent::fallback(tokenize_nouns(question))
        })),
        Err(EngineError::Cancelled) if cancel.is_cancelled() => Err(EngineError::Cancelled),
        Err(e) => {
            debug!("Intent stage degraded ({e}), using heuristic fallback");
            Ok(Intent::fallback(tokenize_nouns(question)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::backend::testing::{ScriptStep, ScriptedBackend};
    use std::sync::Arc;
    use std::time::Duration;

    // ============================================================================
    // parse_intent_response tests
    // ============================================================================

    #[test]
    fn test_parses_plain_object() {
        let intent = parse_intent_response(
            r#"{"intent": "connections", "entities": ["A", "B"], "filters": {}}"#,
        )
        .unwrap();
        assert_eq!(intent.kind, IntentKind::Connections);
        assert_eq!(intent.entities, vec!["a", "b"]);
        assert!(intent.filters.is_empty());
    }

    #[test]
    fn test_parses_fenced_object() {
        let raw = "```json\n{\"intent\": \"timeline\", \"entities\": [\"island\"]}\n```";
        let intent = parse_intent_response(raw).unwrap();
        assert_eq!(intent.kind, IntentKind::Timeline);
        assert_eq!(intent.entities, vec!["island"]);
    }

    #[test]
    fn test_parses_list_marker_prefix() {
        let raw = "- {\"intent\": \"search\", \"entities\": [\"flight\"]}";
        let intent = parse_intent_response(raw).unwrap();
        assert_eq!(intent.entities, vec!["flight"]);
    }

    #[test]
    fn test_skips_preamble_lines() {
        let raw = "Sure, here is the classification:\n{\"intent\": \"search\", \"entities\": []}";
        assert!(parse_intent_response(raw).is_some());
    }

    #[test]
    fn test_rejects_object_missing_keys() {
        assert!(parse_intent_response(r#"{"intent": "search"}"#).is_none());
        assert!(parse_intent_response(r#"{"entities": []}"#).is_none());
        assert!(parse_intent_response("no json at all").is_none());
    }

    #[test]
    fn test_unknown_intent_defaults_to_search() {
        let intent =
            parse_intent_response(r#"{"intent": "interrogate", "entities": ["x"]}"#).unwrap();
        assert_eq!(intent.kind, IntentKind::Search);
    }

    #[test]
    fn test_filters_parsed_and_blank_dropped() {
        let raw = r#"{"intent": "search", "entities": ["mail"],
                      "filters": {"sender": "g@example.com", "date_from": "  "}}"#
            .replace('\n', " ");
        let intent = parse_intent_response(&raw).unwrap();
        assert_eq!(intent.filters.sender.as_deref(), Some("g@example.com"));
        assert!(intent.filters.date_from.is_none());
    }

    // ============================================================================
    // tokenize_nouns tests
    // ============================================================================

    #[test]
    fn test_tokenize_nouns_drops_stopwords() {
        assert_eq!(
            tokenize_nouns("who flew with the passenger"),
            vec!["flew", "passenger"]
        );
    }

    #[test]
    fn test_tokenize_nouns_dedups_preserving_order() {
        assert_eq!(
            tokenize_nouns("island flights island"),
            vec!["island", "flights"]
        );
    }

    #[test]
    fn test_idempotent_for_same_question() {
        let a = tokenize_nouns("search for X and the island");
        let b = tokenize_nouns("search for X and the island");
        assert_eq!(a, b);
    }

    // ============================================================================
    // parse_intent stage tests
    // ============================================================================

    fn pool(steps: Vec<ScriptStep>) -> LocalModelPool {
        LocalModelPool::new(Arc::new(ScriptedBackend::new(steps)), 1, 8)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_stage_uses_model_output() {
        let pool = pool(vec![ScriptStep::Reply(
            r#"{"intent": "timeline", "entities": ["2002"]}"#.into(),
        )]);
        let cancel = CancellationToken::new();
        let intent = parse_intent(&pool, "what happened in 2002", soon(), &cancel)
            .await
            .unwrap();
        assert_eq!(intent.kind, IntentKind::Timeline);
    }

    #[tokio::test]
    async fn test_stage_parse_failure_falls_back() {
        let pool = pool(vec![ScriptStep::Reply("I cannot classify this.".into())]);
        let cancel = CancellationToken::new();
        let intent = parse_intent(&pool, "who flew with A", soon(), &cancel)
            .await
            .unwrap();
        assert_eq!(intent.kind, IntentKind::Search);
        assert_eq!(intent.entities, vec!["flew"]);
    }

    #[tokio::test]
    async fn test_stage_deadline_falls_back() {
        let pool = pool(vec![ScriptStep::Hang]);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(80);
        let intent = parse_intent(&pool, "who flew with A", deadline, &cancel)
            .await
            .unwrap();
        assert_eq!(intent.kind, IntentKind::Search);
    }

    #[tokio::test]
    async fn test_stage_cancellation_propagates() {
        let pool = pool(vec![ScriptStep::Hang]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = parse_intent(&pool, "who flew with A", soon(), &cancel).await;
        assert!(matches!(res, Err(EngineError::Cancelled)));
    }
}
