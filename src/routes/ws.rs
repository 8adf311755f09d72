//! WebSocket handler: one relay per upgraded connection.
//!
//! DESIGN
//! ======
//! The handler only gates the upgrade: it takes a registry slot (refusing
//! with 503 when a relay cap is configured and reached), then hands the
//! socket to `Relay::run`. The slot lives inside the upgrade task, so it is
//! released when the relay finishes or if the upgrade never completes.

use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::UpstreamAddr;
use crate::registry::RelaySlot;
use crate::relay::Relay;
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(error = %rejection, "ws: not an upgrade request");
            return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
        }
    };

    let relay_id = Uuid::new_v4();
    let slot = match state.relays.try_register(relay_id) {
        Ok(slot) => slot,
        Err(e) => {
            warn!(%relay_id, error = %e, "ws: refusing client");
            return (StatusCode::SERVICE_UNAVAILABLE, "server at capacity").into_response();
        }
    };

    let upstream = state.config.upstream.clone();
    ws.on_failed_upgrade(move |e| warn!(%relay_id, error = %e, "ws: upgrade failed"))
        .on_upgrade(move |socket| run_relay(socket, upstream, slot))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_relay(socket: WebSocket, upstream: UpstreamAddr, slot: RelaySlot) {
    let summary = Relay::new(slot.id(), upstream).run(socket).await;
    debug!(relay_id = %summary.id, phase = ?summary.phase, "ws: relay finished");
    drop(slot);
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
