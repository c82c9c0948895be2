//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;

use crate::config::Config;
use crate::relay::RelayController;

/// Shared application state for the relay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration resolved at startup.
    pub config: Arc<Config>,
    /// Owns every session and the child processes behind them.
    pub relay: RelayController,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let relay = RelayController::new(config.child.clone(), &config.server);
        Self {
            config: Arc::new(config),
            relay,
        }
    }
}
