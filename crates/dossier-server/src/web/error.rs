// crates/dossier-server/src/web/error.rs
// EngineError -> HTTP status mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dossier_types::ApiResponse;

use crate::error::EngineError;

/// Status code for an engine error, shared by REST responses and the
/// `code` field of stream error events.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        EngineError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        EngineError::Capacity | EngineError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Wrapper making EngineError usable as an axum rejection.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = Json(ApiResponse::<()>::err(self.0.to_string()));
        (status, body).into_response()
    }
}
