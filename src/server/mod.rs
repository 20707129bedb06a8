//! HTTP and WebSocket surface.
//!
//! A thin axum layer over the daemon's shared state: application CRUD, a
//! queue view, and the `/ws` status stream. Handlers only orchestrate store,
//! queue and supervisor calls; everything stateful lives in [`AppState`].

pub mod api;
pub mod ws;

pub use api::{ApiError, AppState, SharedState, api_router};

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// The full application router: REST API plus the WebSocket status stream.
pub fn build_router(state: SharedState) -> Router {
    api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve the HTTP API until the cancellation token fires.
pub async fn serve(
    state: SharedState,
    listen_addr: String,
    dev_mode: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", listen_addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    tracing::info!("HTTP API stopped");
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────
