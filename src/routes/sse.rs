//! `GET <sse_path>` — open a session and stream it as Server-Sent Events.
//!
//! The first event is always `endpoint`, whose data is the URL to POST this
//! session's messages to. Every later event is a `message` carrying one
//! message from the child. The stream ends when the session is torn down;
//! the remote peer disconnecting tears the session down.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::StreamExt;
use tracing::error;

use crate::error::SessionError;
use crate::state::AppState;

/// `GET <sse_path>` — SSE session stream.
///
/// # Errors
///
/// - `503 Service Unavailable` — the relay is shutting down
/// - `500 Internal Server Error` — the child could not be launched
///
/// A `keep_alive_secs` of 0 disables keep-alive comments.
pub async fn open_stream(State(state): State<AppState>) -> Result<Response, (StatusCode, String)> {
    let opened = state.relay.open_session().await.map_err(|e| match e {
        SessionError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        other => {
            error!("Failed to open session: {other}");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    })?;

    let stream = opened
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(frame.into_event()));

    let sse = Sse::new(stream);
    match state.config.server.keep_alive_secs {
        0 => Ok(sse.into_response()),
        secs => Ok(sse
            .keep_alive(KeepAlive::default().interval(Duration::from_secs(secs)))
            .into_response()),
    }
}
