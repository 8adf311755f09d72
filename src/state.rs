//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the immutable bridge config and the relay registry. Relays
//! share nothing else: each one owns its two connections outright.

use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::registry::RelayRegistry;

/// Clone is required by Axum. All inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub relays: RelayRegistry,
}

impl AppState {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let relays = RelayRegistry::new(config.max_relays);
        Self { config: Arc::new(config), relays }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
