// crates/dossier-server/src/web/conversations.rs
// REST surface over the conversation store

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use dossier_types::{ApiResponse, Conversation, Message};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::db::{
    create_conversation_sync, delete_conversation_sync, get_conversation_sync, get_messages_sync,
    list_conversations_sync,
};
use crate::error::EngineError;
use crate::services::Services;
use crate::web::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(EngineError::InvalidQuery("conversation id is not a UUID".into())))
}

/// GET /conversations
pub async fn list_conversations(
    State(services): State<Services>,
) -> Result<Json<ApiResponse<Vec<Conversation>>>, ApiError> {
    let conversations = services
        .db
        .read(list_conversations_sync)
        .await
        .map_err(|e| ApiError(EngineError::Other(e.to_string())))?;
    Ok(Json(ApiResponse::ok(conversations)))
}

/// POST /conversations
pub async fn create_conversation(
    State(services): State<Services>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<ApiResponse<Conversation>>, ApiError> {
    let title = req
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("New investigation")
        .to_string();

    let conversation = services
        .db
        .write(move |conn| Ok(create_conversation_sync(conn, Uuid::new_v4(), &title)?))
        .await
        .map_err(|e| ApiError(EngineError::Other(e.to_string())))?;

    info!(conversation_id = %conversation.id, "Conversation created");
    Ok(Json(ApiResponse::ok(conversation)))
}

/// GET /conversations/{id}/messages
pub async fn get_messages(
    State(services): State<Services>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<Message>>>, ApiError> {
    let id = parse_id(&id)?;

    let (conversation, messages) = services
        .db
        .read(move |conn| {
            let conversation = get_conversation_sync(conn, &id)?;
            let messages = get_messages_sync(conn, &id)?;
            Ok((conversation, messages))
        })
        .await
        .map_err(|e| ApiError(EngineError::Other(e.to_string())))?;

    if conversation.is_none() {
        return Err(ApiError(EngineError::InvalidQuery(
            "conversation not found".into(),
        )));
    }
    Ok(Json(ApiResponse::ok(messages)))
}

/// DELETE /conversations/{id} - cascades to messages and auto sessions.
pub async fn delete_conversation(
    State(services): State<Services>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ApiResponse<serde_json::Value>>), ApiError> {
    let id = parse_id(&id)?;

    let deleted = services
        .db
        .write(move |conn| Ok(delete_conversation_sync(conn, &id)?))
        .await
        .map_err(|e| ApiError(EngineError::Other(e.to_string())))?;

    if deleted {
        info!(conversation_id = %id, "Conversation deleted");
        Ok((
            StatusCode::OK,
            Json(ApiResponse::ok(serde_json::json!({ "deleted": true }))),
        ))
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("conversation not found")),
        ))
    }
}
