//! JSON-RPC over HTTP: `POST /mcp` carries one message per request and
//! `GET /health` reports the session state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::server::{McpServer, SERVER_VERSION};

/// Build the router.
pub fn router(server: Arc<McpServer>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/health", get(health))
        .with_state(server)
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
}

/// Serve on `addr` until the process exits.
pub async fn serve(server: Arc<McpServer>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("MCP server listening on http://{}", addr);
    axum::serve(listener, router(server)).await?;
    Ok(())
}

async fn mcp_handler(State(server): State<Arc<McpServer>>, body: String) -> Response {
    match server.handle_message(&body).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health(State(server): State<Arc<McpServer>>) -> Json<Value> {
    let status = server.session_status().await;
    Json(json!({
        "healthy": true,
        "site": status.site,
        "authenticated": status.authenticated,
        "version": SERVER_VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
