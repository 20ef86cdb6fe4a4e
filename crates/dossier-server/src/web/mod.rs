// crates/dossier-server/src/web/mod.rs
// HTTP surface: SSE query streams plus the REST API

pub mod api;
pub mod ask;
pub mod auto;
pub mod conversations;
pub mod error;
pub mod stream;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::services::Services;

/// Create the web server router
pub fn create_router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Pipeline stream
        .route("/ask", get(ask::ask))
        // Auto-investigation
        .route("/auto/start", post(auto::auto_start))
        .route("/auto/stop", post(auto::auto_stop))
        // Conversation store
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/{id}/messages",
            get(conversations::get_messages),
        )
        .route("/conversations/{id}", delete(conversations::delete_conversation))
        // Corpus
        .route("/search", get(api::search))
        .route("/documents/{id}", get(api::get_document))
        // Operations
        .route("/health", get(api::health))
        .route("/stats", get(api::stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

/// Serve the router until the process is stopped.
pub async fn serve(services: Services) -> anyhow::Result<()> {
    let bind_addr = services.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on {bind_addr}");

    let router = create_router(services);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
