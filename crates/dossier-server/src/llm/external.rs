// crates/dossier-server/src/llm/external.rs
// Client for the paid remote completion API
//
// Every call that reaches the remote endpoint is written to the audit
// log together with a budget counter increment, in one transaction.
// Malformed model output never propagates: the first balanced JSON
// object is extracted, and when that fails a low-confidence fallback
// analysis is synthesized from the retrieval context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dossier_types::{Analysis, Confidence};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::{DatabasePool, ExternalCallRecord, read_budget_sync, record_external_call_sync, today_utc};
use crate::error::EngineError;
use crate::llm::pricing::CostTable;
use crate::llm::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};

/// Base delay before the single retry on a transport fault; jitter is
/// added on top.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Extract the first balanced JSON object from free-form model output.
///
/// Scans for `{`, then tracks brace depth with string/escape awareness.
/// Returns the balanced slice, or None when no object closes.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fallback analysis when the model's JSON cannot be recovered.
pub fn fallback_analysis(hit_count: usize, context_ids: &[i64]) -> Analysis {
    Analysis {
        findings: vec![format!(
            "Parser failed; raw search returned {hit_count} hits"
        )],
        sources: context_ids.iter().copied().take(5).collect(),
        confidence: Confidence::Low,
        hypotheses: Vec::new(),
        contradictions: Vec::new(),
        suggested_queries: Vec::new(),
    }
}

/// Client for the paid external completion endpoint.
pub struct ExternalModelClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    pricing: CostTable,
    db: Arc<DatabasePool>,
    daily_cap: u32,
    cost_cap_micro_usd: u64,
    call_timeout: Duration,
}

impl ExternalModelClient {
    /// Build the client when an API key is configured.
    pub fn from_config(config: &EngineConfig, db: Arc<DatabasePool>) -> Option<Self> {
        let api_key = config.external_api_key.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            api_url: config.external_api_url.clone(),
            api_key,
            model: config.external_model.clone(),
            pricing: CostTable::from_env(),
            db,
            daily_cap: config.external_daily_cap,
            cost_cap_micro_usd: config.cost_cap_micro_usd,
            call_timeout: config.timeouts.external_call,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Whether today's budget still admits an external call.
    pub async fn budget_available(&self) -> bool {
        let day = today_utc();
        let (daily_cap, cost_cap) = (self.daily_cap, self.cost_cap_micro_usd);
        self.db
            .read(move |conn| read_budget_sync(conn, &day))
            .await
            .map(|b| b.external_calls < daily_cap && b.cost_micro_usd < cost_cap)
            .unwrap_or(false)
    }

    /// Run the analysis prompt against the remote endpoint.
    ///
    /// `context_ids` and `hit_count` describe the retrieval context and
    /// seed the fallback analysis on unparseable output. Returns
    /// `Budget` when today's caps are spent and `Upstream` after the
    /// one retried transport fault; both route the caller to the local
    /// fallback.
    pub async fn analyze(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
        context_ids: &[i64],
        hit_count: usize,
        cancel: &CancellationToken,
    ) -> Result<Analysis, EngineError> {
        if !self.budget_available().await {
            debug!("External budget exhausted, short-circuiting");
            return Err(EngineError::Budget);
        }

        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(prompt)],
            max_tokens,
            temperature: 0.2,
            stream: false,
        };

        let response = tokio::select! {
            res = self.send_with_retry(&request_id, &body) => res?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let usage = response.usage.unwrap_or_default();
        let cost = self
            .pricing
            .pricing_for(&self.model)
            .cost_micro_usd(usage.prompt_tokens, usage.completion_tokens);

        // The call reached the endpoint: audit row + budget increment,
        // atomically, before any output parsing can bail.
        let record = ExternalCallRecord {
            request_id: request_id.clone(),
            day: today_utc(),
            model: self.model.clone(),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            cost_micro_usd: cost,
            duration_ms: Some(duration_ms),
        };
        self.db
            .write(move |conn| record_external_call_sync(conn, &record))
            .await
            .map_err(|e| EngineError::Other(format!("audit write failed: {e}")))?;

        info!(
            request_id = %request_id,
            duration_ms,
            tokens_in = usage.prompt_tokens,
            tokens_out = usage.completion_tokens,
            cost_micro_usd = cost,
            "External analysis call complete"
        );

        let content = response.content();
        Ok(parse_analysis(&content, hit_count, context_ids))
    }

    async fn send_with_retry(
        &self,
        request_id: &str,
        body: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, EngineError> {
        match self.send_once(body).await {
            Ok(resp) => Ok(resp),
            Err(first) => {
                let jitter = rand::rng().random_range(0..200);
                let delay = RETRY_BASE_DELAY + Duration::from_millis(jitter);
                warn!(request_id, "External call failed ({first}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                self.send_once(body).await.map_err(|second| {
                    EngineError::Upstream(format!("retry also failed: {second}"))
                })
            }
        }
    }

    async fn send_once(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, EngineError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(self.call_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Upstream(format!("{status}: {text}")));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Upstream(format!("unreadable response: {e}")))
    }
}

/// Leniently parse model output into an Analysis. Never fails.
pub fn parse_analysis(content: &str, hit_count: usize, context_ids: &[i64]) -> Analysis {
    let Some(object) = extract_first_json_object(content) else {
        debug!("No JSON object in analysis output, synthesizing fallback");
        return fallback_analysis(hit_count, context_ids);
    };

    match serde_json::from_str::<Analysis>(object) {
        Ok(analysis) => analysis,
        Err(e) => {
            debug!("Analysis JSON did not match schema ({e}), synthesizing fallback");
            fallback_analysis(hit_count, context_ids)
        }
    }
}
