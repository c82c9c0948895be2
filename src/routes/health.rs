//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health` — liveness check.
///
/// Returns status, version, uptime, the number of live sessions and the
/// isolation mode. `status` is `"shutting_down"` once shutdown has begun.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let relay = &state.relay;
    let status = if relay.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": relay.uptime_secs(),
        "sessions": relay.session_count().await,
        "isolation": relay.isolation().as_str(),
    }))
}
