//! `POST <messages_path>?sessionId=<id>` — deliver one message to a session.
//!
//! The body must be a single JSON value; it is relayed to the session's child
//! verbatim (multi-line bodies are compacted onto one line). Acceptance means
//! the message is queued for the child, not that the child has answered: the
//! answer arrives on the session's event stream.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::message::Message;
use crate::state::AppState;

/// Query string of a message POST.
#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `POST <messages_path>` — route one message.
///
/// # Errors
///
/// - `400 Bad Request` — missing or unknown `sessionId`, or a body that is
///   not JSON
/// - `413 Payload Too Large` — body exceeds `server.max_body_bytes`
pub async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), (StatusCode, String)> {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "No transport found for sessionId".to_string(),
        ));
    };

    let message = Message::from_slice(&body).map_err(|e| {
        debug!(session = %session_id, "Rejecting invalid JSON body: {e}");
        (StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}"))
    })?;

    state.relay.route(&session_id, message).await.map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "No transport found for sessionId".to_string(),
        )
    })?;
    Ok((StatusCode::ACCEPTED, "Accepted"))
}
