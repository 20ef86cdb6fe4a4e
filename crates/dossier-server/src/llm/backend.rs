// crates/dossier-server/src/llm/backend.rs
// Completion backend abstraction for the local model pool

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::llm::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionRequest};

/// Generates one completion. Implementations must be cancel-safe: the
/// pool drops the in-flight future on deadline or client disconnect.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<String, EngineError>;

    /// Model identifier, for logs and stats.
    fn model_name(&self) -> &str;
}

/// Normalize a local server base URL by stripping trailing slashes and a
/// /v1 suffix.
fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim_end_matches('/').to_string();
    if url.ends_with("/v1") {
        url.truncate(url.len() - 3);
    }
    url
}

/// Check if a URL points to a local address (localhost, 127.0.0.1, [::1])
fn is_local_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.host() {
            Some(url::Host::Domain(d)) => d == "localhost",
            Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
            Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
            None => true,
        },
        Err(_) => true, // Can't parse - don't warn on malformed URLs
    }
}

/// Backend talking to a warm local inference server over its
/// OpenAI-compatible endpoint (no auth required).
pub struct HttpLocalBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLocalBackend {
    pub fn new(base_url: &str, model: &str, generation_timeout: Duration) -> Self {
        let normalized = normalize_base_url(base_url);

        if !is_local_url(&normalized) {
            warn!(
                "LOCAL_MODEL_URL points to non-local address '{}'. The local pool is sized \
                 for a same-host server.",
                normalized
            );
        }

        let client = reqwest::Client::builder()
            .timeout(generation_timeout)
            .build()
            .unwrap_or_default();

        Self {
            base_url: normalized,
            model: model.to_string(),
            client,
        }
    }
}

#[async_trait]
impl CompletionBackend for HttpLocalBackend {
    async fn complete(&self, req: CompletionRequest) -> Result<String, EngineError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(req.prompt)],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Model(format!("local model request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Model(format!(
                "local model returned {status}: {text}"
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Model(format!("local model response unreadable: {e}")))?;

        debug!(model = %self.model, "Local completion finished");
        Ok(parsed.content())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
