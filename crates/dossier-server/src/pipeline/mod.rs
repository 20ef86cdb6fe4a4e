// crates/dossier-server/src/pipeline/mod.rs
// The query pipeline: intent -> retrieve -> analyze -> format,
// produced as an ordered event stream
//
// One invocation owns its transient Intent/Analysis/SearchHit values
// and emits events into an mpsc channel; the stream dispatcher on the
// other end owns the wire. A send failure means the receiver is gone
// (client disconnect), which cancels the invocation. Persistence
// happens only on reaching `done`; cancelled invocations write nothing.

pub mod analyze;
pub mod citations;
pub mod format;
pub mod intent;
pub mod language;
pub mod retrieve;

use dossier_types::{Analysis, StreamEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{append_exchange_sync, create_conversation_sync, derive_title, get_conversation_sync};
use crate::error::EngineError;
use crate::services::Services;

/// Cap on the suggestions event payload.
const MAX_SUGGESTIONS: usize = 5;

/// One pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub question: String,
    /// Existing conversation to append to; None creates one.
    pub conversation_id: Option<Uuid>,
    /// True for auto-investigator iterations: status events are
    /// re-tagged `auto:status` and persisted messages carry `is_auto`.
    pub is_auto: bool,
    /// From admission: routes analysis through the local fallback.
    pub budget_exhausted: bool,
}

/// What an invocation produced, for callers that consume the stream
/// programmatically (the auto-investigator).
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub conversation_id: Uuid,
    pub answer: String,
    pub sources: Vec<i64>,
    pub suggestions: Vec<String>,
}

/// Send one event; a dropped receiver means the client disconnected and
/// the invocation is cancelled.
async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), EngineError> {
    tx.send(event).await.map_err(|_| {
        debug!("Event receiver dropped, treating as cancellation");
        EngineError::Cancelled
    })
}

fn stage_deadline(root: Instant, stage: std::time::Duration) -> Instant {
    std::cmp::min(root, Instant::now() + stage)
}

/// Run the four-stage pipeline, emitting events into `tx`.
///
/// The caller establishes the root deadline and cancellation token;
/// this function honors both at every stage boundary and inside every
/// model call. On success the exchange is persisted and `done` has been
/// emitted.
#[instrument(skip_all, fields(is_auto = request.is_auto))]
pub async fn run_pipeline(
    services: &Services,
    request: PipelineRequest,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome, EngineError> {
    let question = request.question.trim().to_string();
    if question.is_empty() {
        return Err(EngineError::InvalidQuery("empty question".into()));
    }

    let timeouts = &services.config.timeouts;
    let root_deadline = Instant::now() + timeouts.invocation;
    let lang = language::detect_language(&question);

    let status = |msg: &str| {
        if request.is_auto {
            StreamEvent::AutoStatus { msg: msg.into() }
        } else {
            StreamEvent::Status { msg: msg.into() }
        }
    };

    // Stage 1: intent
    emit(tx, status("Reading the question")).await?;
    let intent = intent::parse_intent(
        &services.local,
        &question,
        stage_deadline(root_deadline, timeouts.intent),
        cancel,
    )
    .await?;
    check_cancelled(cancel)?;
    debug!(kind = intent.kind.as_str(), entities = intent.entities.len(), "Intent parsed");

    // Stage 2: retrieve
    emit(tx, status("Searching the corpus")).await?;
    let hits = retrieve::retrieve(
        &services.index,
        &intent,
        &question,
        &services.config.connection_expansion_terms,
        timeouts.search,
    )
    .await?;
    check_cancelled(cancel)?;

    if hits.is_empty() {
        return finish_empty(services, &request, &question, lang, tx, cancel).await;
    }

    let hit_ids: Vec<i64> = hits.iter().map(|h| h.doc_id).collect();
    emit(tx, StreamEvent::Sources { ids: hit_ids.clone() }).await?;

    // Stage 3: analyze
    emit(tx, status("Analyzing the documents")).await?;
    let analysis = analyze::analyze(
        services.external.as_deref(),
        &services.local,
        &question,
        &hits,
        request.budget_exhausted,
        stage_deadline(root_deadline, timeouts.analyze),
        cancel,
    )
    .await?;
    check_cancelled(cancel)?;

    // Stage 4: format and stream
    let (answer, chunks) = format::format_answer(
        &services.local,
        &question,
        &analysis,
        lang,
        stage_deadline(root_deadline, timeouts.format),
        cancel,
    )
    .await?;
    for chunk in chunks {
        emit(tx, StreamEvent::Chunk { text: chunk }).await?;
    }

    // Canonical sources: grounding ids first, then the rest of the
    // retrieval set in rank order (a permutation of the retrieved ids).
    let canonical = canonical_sources(&analysis, &hit_ids);
    emit(tx, StreamEvent::Sources { ids: canonical }).await?;

    let suggestions: Vec<String> = analysis
        .suggested_queries
        .iter()
        .take(MAX_SUGGESTIONS)
        .cloned()
        .collect();
    emit(
        tx,
        StreamEvent::Suggestions {
            queries: suggestions.clone(),
        },
    )
    .await?;

    check_cancelled(cancel)?;
    let conversation_id = persist_exchange(
        services,
        &request,
        &question,
        &answer,
        &analysis.sources,
    )
    .await?;

    // Auto iterations share the caller's stream; the auto loop owns
    // stream termination, so the nested done is swallowed.
    if !request.is_auto {
        emit(tx, StreamEvent::Done).await?;
    }
    info!(sources = analysis.sources.len(), "Pipeline invocation complete");

    Ok(PipelineOutcome {
        conversation_id,
        answer,
        sources: analysis.sources,
        suggestions,
    })
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Zero hits: a localized notice, persistence with an empty source set,
/// then done.
async fn finish_empty(
    services: &Services,
    request: &PipelineRequest,
    question: &str,
    lang: language::Language,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome, EngineError> {
    let notice = language::no_results_message(lang).to_string();
    emit(
        tx,
        StreamEvent::Chunk {
            text: notice.clone(),
        },
    )
    .await?;

    check_cancelled(cancel)?;
    let conversation_id = persist_exchange(services, request, question, &notice, &[]).await?;

    if !request.is_auto {
        emit(tx, StreamEvent::Done).await?;
    }
    Ok(PipelineOutcome {
        conversation_id,
        answer: notice,
        sources: Vec::new(),
        suggestions: Vec::new(),
    })
}

/// Grounding sources first, then the remaining retrieved ids.
fn canonical_sources(analysis: &Analysis, hit_ids: &[i64]) -> Vec<i64> {
    let mut out = analysis.sources.clone();
    for id in hit_ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

/// Append the question and answer under one logical transaction,
/// creating the conversation when needed.
async fn persist_exchange(
    services: &Services,
    request: &PipelineRequest,
    question: &str,
    answer: &str,
    sources: &[i64],
) -> Result<Uuid, EngineError> {
    // A caller-supplied id that does not exist yet is created rather
    // than rejected: ids are client-generated for new threads.
    let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);

    let question = question.to_string();
    let answer = answer.to_string();
    let sources = sources.to_vec();
    let is_auto = request.is_auto;

    services
        .db
        .write(move |conn| {
            if get_conversation_sync(conn, &conversation_id)?.is_none() {
                create_conversation_sync(conn, conversation_id, &derive_title(&question))?;
            }
            append_exchange_sync(conn, &conversation_id, &question, &answer, &sources, is_auto)
        })
        .await
        .map_err(|e| {
            warn!("Persisting exchange failed: {e}");
            EngineError::Other(format!("conversation write failed: {e}"))
        })?;

    Ok(conversation_id)
}
