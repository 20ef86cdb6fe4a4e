// crates/dossier-server/src/auto/mod.rs
// Auto-investigator: a bounded loop that feeds the pipeline with
// model-generated follow-up questions
//
// Each iteration passes admission with the session's originating IP,
// answers the current question through the full pipeline (multiplexed
// into the caller's stream), then picks the first suggestion that is
// sufficiently different from every user question already on record.
// The stop flag is observed between pipeline invocations only; it never
// interrupts one mid-flight.

use std::net::IpAddr;

use dossier_types::{AutoSession, AutoSessionStatus, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{
    bump_query_count_sync, create_auto_session_sync, get_auto_session_sync,
    get_conversation_sync, last_user_message_sync, set_session_status_sync, user_questions_sync,
};
use crate::error::EngineError;
use crate::pipeline::{PipelineRequest, run_pipeline};
use crate::services::Services;

/// Bounds for `max_queries`.
pub const MAX_QUERIES_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

/// Normalized edit distance between two questions (0.0 identical,
/// 1.0 disjoint).
pub fn question_distance(a: &str, b: &str) -> f64 {
    1.0 - similar::TextDiff::from_chars(a.trim(), b.trim()).ratio() as f64
}

/// First suggestion whose distance to every previous user question
/// exceeds the threshold. Prevents the loop from re-asking itself.
pub fn pick_next_question(
    suggestions: &[String],
    previous_questions: &[String],
    threshold: f64,
) -> Option<String> {
    suggestions
        .iter()
        .find(|s| {
            !s.trim().is_empty()
                && previous_questions
                    .iter()
                    .all(|q| question_distance(s, q) > threshold)
        })
        .cloned()
}

/// Validate and create the `running` session. Called by the handler
/// before the stream starts, so rejections surface as status codes.
pub async fn start_session(
    services: &Services,
    conversation_id: Uuid,
    max_queries: u32,
) -> Result<AutoSession, EngineError> {
    if !MAX_QUERIES_RANGE.contains(&max_queries) {
        return Err(EngineError::InvalidQuery(format!(
            "max_queries must be in [1, 50], got {max_queries}"
        )));
    }

    services
        .db
        .write(move |conn| {
            if get_conversation_sync(conn, &conversation_id)?.is_none() {
                anyhow::bail!("conversation {conversation_id} not found");
            }
            create_auto_session_sync(conn, &conversation_id, max_queries).map_err(|e| {
                if matches!(&e, rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ffi::ErrorCode::ConstraintViolation)
                {
                    anyhow::anyhow!("an auto session is already running for this conversation")
                } else {
                    e.into()
                }
            })
        })
        .await
        .map_err(|e| EngineError::InvalidQuery(e.to_string()))
}

/// Run a started session to completion, multiplexing pipeline events
/// into `tx`.
pub async fn run_auto_session(
    services: &Services,
    session: AutoSession,
    ip: IpAddr,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let conversation_id = session.conversation_id;

    let Some(mut question) = read_last_user_question(services, &conversation_id).await? else {
        emit(tx, StreamEvent::Error {
            msg: "conversation has no user messages to investigate".into(),
            code: 400,
        })
        .await?;
        finish(services, session.id, AutoSessionStatus::Stopped).await;
        emit(tx, StreamEvent::AutoComplete { total_queries: 0 }).await?;
        emit(tx, StreamEvent::Done).await?;
        return Ok(());
    };

    let mut count = 0u32;
    let mut terminal = AutoSessionStatus::Completed;

    loop {
        // Boundary checks: external stop, then the query bound.
        if stop_requested(services, session.id).await {
            info!(session_id = session.id, "Auto session stopped by external signal");
            terminal = AutoSessionStatus::Stopped;
            break;
        }
        if count >= session.max_queries {
            break;
        }

        // Every inner invocation passes the same admission gate as a
        // user query.
        let admission = match services.gate.admit(ip).await {
            Ok(a) => a,
            Err(EngineError::RateLimited) => {
                warn!(session_id = session.id, "Auto session denied by rate limit");
                emit(tx, StreamEvent::Error {
                    msg: "rate limit reached, stopping auto-investigation".into(),
                    code: 429,
                })
                .await?;
                terminal = AutoSessionStatus::Stopped;
                break;
            }
            Err(e) => return Err(e),
        };

        emit(tx, StreamEvent::AutoQuery {
            query: question.clone(),
        })
        .await?;

        let request = PipelineRequest {
            question: question.clone(),
            conversation_id: Some(conversation_id),
            is_auto: true,
            budget_exhausted: admission.budget_exhausted,
        };

        let outcome = match run_pipeline(services, request, tx, cancel).await {
            Ok(outcome) => outcome,
            Err(EngineError::Cancelled) => {
                finish(services, session.id, AutoSessionStatus::Stopped).await;
                return Err(EngineError::Cancelled);
            }
            Err(e) => {
                warn!(session_id = session.id, "Auto iteration failed: {e}");
                emit(tx, StreamEvent::Error {
                    msg: e.to_string(),
                    code: 500,
                })
                .await?;
                terminal = AutoSessionStatus::Stopped;
                break;
            }
        };

        count = bump_count(services, session.id).await.unwrap_or(count + 1);

        // Choose the next question from the fresh suggestions.
        let previous = read_user_questions(services, &conversation_id).await?;
        match pick_next_question(
            &outcome.suggestions,
            &previous,
            services.config.auto_distance_threshold,
        ) {
            Some(next) => {
                debug!(session_id = session.id, "Auto follow-up selected");
                question = next;
            }
            None => {
                debug!(session_id = session.id, "No sufficiently novel suggestion, completing");
                break;
            }
        }
    }

    finish(services, session.id, terminal).await;
    emit(tx, StreamEvent::AutoComplete {
        total_queries: count,
    })
    .await?;
    emit(tx, StreamEvent::Done).await?;
    info!(session_id = session.id, total_queries = count, "Auto session ended");
    Ok(())
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), EngineError> {
    tx.send(event).await.map_err(|_| EngineError::Cancelled)
}

async fn read_last_user_question(
    services: &Services,
    conversation_id: &Uuid,
) -> Result<Option<String>, EngineError> {
    let id = *conversation_id;
    services
        .db
        .read(move |conn| last_user_message_sync(conn, &id))
        .await
        .map(|m| m.map(|m| m.content))
        .map_err(|e| EngineError::Other(e.to_string()))
}

async fn read_user_questions(
    services: &Services,
    conversation_id: &Uuid,
) -> Result<Vec<String>, EngineError> {
    let id = *conversation_id;
    services
        .db
        .read(move |conn| user_questions_sync(conn, &id))
        .await
        .map_err(|e| EngineError::Other(e.to_string()))
}

/// Whether the session left `running` through the stop endpoint.
async fn stop_requested(services: &Services, session_id: i64) -> bool {
    services
        .db
        .read(move |conn| get_auto_session_sync(conn, session_id))
        .await
        .ok()
        .flatten()
        .map(|s| s.status != AutoSessionStatus::Running)
        .unwrap_or(false)
}

async fn bump_count(services: &Services, session_id: i64) -> Option<u32> {
    services
        .db
        .write(move |conn| Ok(bump_query_count_sync(conn, session_id)?))
        .await
        .ok()
}

/// Best-effort terminal status write; an externally-stopped session
/// keeps its status.
async fn finish(services: &Services, session_id: i64, status: AutoSessionStatus) {
    let result = services
        .db
        .write(move |conn| {
            if let Some(current) = get_auto_session_sync(conn, session_id)? {
                if current.status == AutoSessionStatus::Running {
                    set_session_status_sync(conn, session_id, status)?;
                }
            }
            Ok(())
        })
        .await;
    if let Err(e) = result {
        warn!(session_id, "Failed to finalize auto session: {e}");
    }
}

#[cfg(test)]
mod auto_tests;
