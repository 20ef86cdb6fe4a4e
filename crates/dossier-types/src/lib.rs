// crates/dossier-types/src/lib.rs

//! Shared data contracts between the Dossier engine and its clients.
//!
//! This crate provides the core domain model for:
//! - **Corpus**: immutable documents and ranked search hits
//! - **Pipeline**: parsed intents and grounded analyses
//! - **Conversations**: persisted message logs with source citations
//! - **Wire**: the server-push event stream consumed by clients
//!
//! These types are designed to work across native and WASM builds,
//! with no native-only dependencies allowed.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ===================================================
// CORPUS
// ===================================================

/// Category of a corpus document. Affects ranking (depositions and
/// filings outrank emails, which outrank raw logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Email,
    Deposition,
    Filing,
    Log,
    Other,
}

impl DocumentKind {
    /// Stable string form used in the database and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Deposition => "deposition",
            Self::Filing => "filing",
            Self::Log => "log",
            Self::Other => "other",
        }
    }

    /// Parse from the stored string form. Unknown values map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "email" => Self::Email,
            "deposition" => Self::Deposition,
            "filing" => Self::Filing,
            "log" => Self::Log,
            _ => Self::Other,
        }
    }
}

/// An immutable corpus document. Once written it never changes;
/// its `id` is the citation key used in grounded answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub kind: DocumentKind,
    pub timestamp: Option<NaiveDate>,
    pub sender: Option<String>,
    /// Opaque JSON blob carried through from ingestion.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A ranked search result for a single query. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: i64,
    pub title: String,
    /// Window of the body around the best match, with matched tokens
    /// wrapped in `«…»`.
    pub snippet: String,
    /// Composite relevance score, higher is better.
    pub score: f64,
    pub kind: DocumentKind,
    pub timestamp: Option<NaiveDate>,
    pub sender: Option<String>,
}

// ===================================================
// INTENT
// ===================================================

/// What the user is trying to do, as classified by the intent stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    #[default]
    Search,
    Connections,
    Timeline,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Connections => "connections",
            Self::Timeline => "timeline",
        }
    }

    /// Parse from the model's output. Unknown values map to `Search`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "connections" => Self::Connections,
            "timeline" => Self::Timeline,
            _ => Self::Search,
        }
    }
}

/// Optional constraints extracted alongside the intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IntentFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

impl IntentFilters {
    pub fn is_empty(&self) -> bool {
        self.date_from.is_none()
            && self.date_to.is_none()
            && self.sender.is_none()
            && self.recipient.is_none()
    }
}

/// Structured representation of a user question.
///
/// `kind` is always populated; unparseable questions default to
/// `Search` with heuristically tokenized entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    /// Normalized terms, in the order the model produced them.
    pub entities: Vec<String>,
    #[serde(default)]
    pub filters: IntentFilters,
}

impl Intent {
    /// Fallback intent for questions the model could not classify.
    pub fn fallback(entities: Vec<String>) -> Self {
        Self {
            kind: IntentKind::Search,
            entities,
            filters: IntentFilters::default(),
        }
    }
}

// ===================================================
// ANALYSIS
// ===================================================

/// Analyst confidence in the findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Grounded analysis of a set of search hits.
///
/// Every id in `sources` must have appeared among the hits the
/// analysis was produced from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Analysis {
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub sources: Vec<i64>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub hypotheses: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
    #[serde(default)]
    pub suggested_queries: Vec<String>,
}

// ===================================================
// CONVERSATIONS
// ===================================================

/// A persisted conversation. `updated_at` tracks the `created_at`
/// of its most recent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One entry in a conversation's append-only message log.
/// Assistant messages carry the document ids that grounded them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Document ids cited by this message. Never null; empty for
    /// user messages and ungrounded replies.
    #[serde(default)]
    pub sources: Vec<i64>,
    /// True when the message was produced by the auto-investigator.
    #[serde(default)]
    pub is_auto: bool,
    pub created_at: String,
}

// ===================================================
// AUTO-INVESTIGATION
// ===================================================

/// Lifecycle of an auto-investigation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoSessionStatus {
    Running,
    Stopped,
    Completed,
}

impl AutoSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A bounded loop of model-generated follow-up questions over one
/// conversation. At most one `Running` session per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSession {
    pub id: i64,
    pub conversation_id: Uuid,
    pub status: AutoSessionStatus,
    pub query_count: u32,
    pub max_queries: u32,
    pub started_at: String,
    pub stopped_at: Option<String>,
}

// ===================================================
// WIRE EVENTS
// ===================================================

/// One event on the server-push stream.
///
/// The wire format is `event: <name>\ndata: <json>\n\n`; `name()` and
/// `data()` produce the two halves. Event order within one invocation
/// is preserved verbatim on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Human-readable progress note.
    Status { msg: String },
    /// Progress note from a nested auto-investigation pipeline.
    AutoStatus { msg: String },
    /// Ranked document ids used as context.
    Sources { ids: Vec<i64> },
    /// Partial prose to append.
    Chunk { text: String },
    /// Follow-up suggestions.
    Suggestions { queries: Vec<String> },
    /// The auto-investigator's next question.
    AutoQuery { query: String },
    /// Auto session ended.
    AutoComplete { total_queries: u32 },
    /// Fatal error for this invocation.
    Error { msg: String, code: u16 },
    /// End of stream.
    Done,
}

impl StreamEvent {
    /// Wire event name (`event:` line).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::AutoStatus { .. } => "auto:status",
            Self::Sources { .. } => "sources",
            Self::Chunk { .. } => "chunk",
            Self::Suggestions { .. } => "suggestions",
            Self::AutoQuery { .. } => "auto_query",
            Self::AutoComplete { .. } => "auto_complete",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// Wire payload (`data:` line). Always a JSON object.
    pub fn data(&self) -> serde_json::Value {
        match self {
            Self::Status { msg } | Self::AutoStatus { msg } => {
                serde_json::json!({ "msg": msg })
            }
            Self::Sources { ids } => serde_json::json!({ "ids": ids }),
            Self::Chunk { text } => serde_json::json!({ "text": text }),
            Self::Suggestions { queries } => serde_json::json!({ "queries": queries }),
            Self::AutoQuery { query } => serde_json::json!({ "query": query }),
            Self::AutoComplete { total_queries } => {
                serde_json::json!({ "total_queries": total_queries })
            }
            Self::Error { msg, code } => serde_json::json!({ "msg": msg, "code": code }),
            Self::Done => serde_json::json!({}),
        }
    }
}

// ===================================================
// API ENVELOPE
// ===================================================

/// Standard JSON envelope for non-streaming REST responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
