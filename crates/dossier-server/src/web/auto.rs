// crates/dossier-server/src/web/auto.rs
// Auto-investigation endpoints: start a session stream, stop a session

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, State};
use axum::response::sse::{Event, Sse};
use dossier_types::{ApiResponse, StreamEvent};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auto::{run_auto_session, start_session};
use crate::db::request_stop_sync;
use crate::error::EngineError;
use crate::services::Services;
use crate::web::error::{ApiError, status_for};
use crate::web::stream::{EVENT_CHANNEL_CAPACITY, sse_response};

#[derive(Debug, Deserialize)]
pub struct AutoStartRequest {
    pub conversation_id: String,
    pub max_queries: u32,
}

#[derive(Debug, Deserialize)]
pub struct AutoStopRequest {
    pub conversation_id: String,
}

fn parse_conversation_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(EngineError::InvalidQuery("conversation_id is not a UUID".into())))
}

/// POST /auto/start - create the session, then stream its events.
pub async fn auto_start(
    State(services): State<Services>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<AutoStartRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let conversation_id = parse_conversation_id(&req.conversation_id)?;

    // Validation failures (bad bounds, unknown conversation, session
    // already running) surface as status codes before the stream opens.
    let session = start_session(&services, conversation_id, req.max_queries).await?;
    info!(
        session_id = session.id,
        max_queries = session.max_queries,
        "Auto session started"
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    {
        let services = services.clone();
        let cancel = cancel.clone();
        let ip = addr.ip();
        tokio::spawn(async move {
            if let Err(e) = run_auto_session(&services, session, ip, &tx, &cancel).await {
                match e {
                    EngineError::Cancelled => debug!("Auto session cancelled by disconnect"),
                    other => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                msg: other.to_string(),
                                code: status_for(&other).as_u16(),
                            })
                            .await;
                    }
                }
            }
        });
    }

    Ok(sse_response(rx, cancel))
}

/// POST /auto/stop - flag the running session; the loop exits at its
/// next boundary.
pub async fn auto_stop(
    State(services): State<Services>,
    Json(req): Json<AutoStopRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let conversation_id = parse_conversation_id(&req.conversation_id)?;

    let stopped = services
        .db
        .write(move |conn| Ok(request_stop_sync(conn, &conversation_id)?))
        .await
        .map_err(|e| ApiError(EngineError::Other(e.to_string())))?;

    Ok(Json(ApiResponse::ok(serde_json::json!({
        "stopped": stopped
    }))))
}
