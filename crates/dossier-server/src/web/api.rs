// crates/dossier-server/src/web/api.rs
// Health, stats, corpus search and document lookup handlers

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use dossier_types::{ApiResponse, Document, SearchHit};
use serde::Deserialize;

use crate::db::{
    count_documents_sync, count_external_calls_sync, get_document_sync, read_budget_sync,
    today_utc, total_admissions_sync,
};
use crate::error::EngineError;
use crate::services::Services;
use crate::web::error::ApiError;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /stats - daily counters, pool pressure, corpus size
pub async fn stats(
    State(services): State<Services>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let day = today_utc();
    let (documents, budget, admissions, audit_rows) = services
        .db
        .read(move |conn| {
            Ok((
                count_documents_sync(conn)?,
                read_budget_sync(conn, &day)?,
                total_admissions_sync(conn, &day)?,
                count_external_calls_sync(conn, &day)?,
            ))
        })
        .await
        .map_err(|e| ApiError(EngineError::Other(e.to_string())))?;

    let db_status = services.db.status();

    Ok(Json(ApiResponse::ok(serde_json::json!({
        "corpus": { "documents": documents },
        "today": {
            "admissions": admissions,
            "external_calls": budget.external_calls,
            "external_cost_micro_usd": budget.cost_micro_usd,
            "audit_rows": audit_rows,
        },
        "local_pool": {
            "workers": services.local.worker_count(),
            "queue_depth": services.local.queue_depth(),
            "queue_capacity": services.local.queue_capacity(),
            "model": services.local.model_name(),
        },
        "db_pool": {
            "size": db_status.size,
            "available": db_status.available,
            "waiting": db_status.waiting,
        },
        "external_configured": services.external.is_some(),
    }))))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

fn default_search_limit() -> u32 {
    10
}

/// GET /search?q=&limit= - direct ranked corpus search
pub async fn search(
    State(services): State<Services>,
    Query(params): Query<SearchParams>,
) -> Result<Json<ApiResponse<Vec<SearchHit>>>, ApiError> {
    let hits = services.index.search(&params.q, params.limit).await?;
    Ok(Json(ApiResponse::ok(hits)))
}

/// GET /documents/{id} - resolve a citation to its document
pub async fn get_document(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<ApiResponse<Document>>), ApiError> {
    let document = services
        .db
        .read(move |conn| get_document_sync(conn, id))
        .await
        .map_err(|e| ApiError(EngineError::Other(e.to_string())))?;

    match document {
        Some(doc) => Ok((StatusCode::OK, Json(ApiResponse::ok(doc)))),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err(format!("document {id} not found"))),
        )),
    }
}
