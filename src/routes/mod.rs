//! HTTP route handlers.
//!
//! - [`sse`] — `GET <sse_path>`, opens a session and streams it
//! - [`messages`] — `POST <messages_path>?sessionId=<id>`, routes one message
//! - [`health`] — `GET /health`, liveness check
//!
//! [`router`] mounts them at the configured paths.

pub mod health;
pub mod messages;
pub mod sse;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the relay's router over `state`.
pub fn router(state: AppState) -> Router {
    let config = Arc::clone(&state.config);
    let server = &config.server;
    Router::new()
        .route(&server.sse_path, get(sse::open_stream))
        .route(
            &server.messages_path,
            post(messages::post_message).layer(DefaultBodyLimit::max(server.max_body_bytes)),
        )
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
