// crates/dossier-server/src/web/ask.rs
// GET /ask - one pipeline invocation as an SSE stream

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::response::sse::{Event, Sse};
use dossier_types::StreamEvent;
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::pipeline::{PipelineRequest, run_pipeline};
use crate::services::Services;
use crate::web::error::{ApiError, status_for};
use crate::web::stream::{EVENT_CHANNEL_CAPACITY, sse_response};

#[derive(Debug, Deserialize)]
pub struct AskParams {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Admission, then the four-stage pipeline as a push stream.
pub async fn ask(
    State(services): State<Services>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<AskParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let question = params.q.trim().to_string();
    if question.is_empty() {
        return Err(EngineError::InvalidQuery("q must not be empty".into()).into());
    }

    let conversation_id = match params.conversation_id.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
            ApiError(EngineError::InvalidQuery("conversation_id is not a UUID".into()))
        })?),
    };

    // Admission before any pipeline work
    let admission = services.gate.admit(addr.ip()).await?;

    // A saturated local queue cannot even parse intent; refuse up front
    // rather than failing one event into the stream.
    if services.local.is_saturated() {
        return Err(EngineError::Capacity.into());
    }

    info!(budget_exhausted = admission.budget_exhausted, "Query admitted");

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let request = PipelineRequest {
        question,
        conversation_id,
        is_auto: false,
        budget_exhausted: admission.budget_exhausted,
    };

    {
        let services = services.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_pipeline(&services, request, &tx, &cancel).await {
                match e {
                    EngineError::Cancelled => {
                        debug!("Invocation cancelled, stream closed silently")
                    }
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
