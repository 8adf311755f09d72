//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! `/healthz` reports liveness and the number of active relays. Every other
//! path is treated as a websocket upgrade and handed to a fresh relay, so
//! clients can connect on `/` or any path they were configured with.

pub mod ws;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(ws::handle_ws)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub active_relays: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_relays: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_relay_secs: Option<u64>,
}

async fn healthz(State(state): State<AppState>) -> Json<Health> {
    Json(health(&state))
}

fn health(state: &AppState) -> Health {
    Health {
        status: "ok",
        active_relays: state.relays.active(),
        max_relays: state.relays.limit(),
        oldest_relay_secs: state.relays.oldest_age().map(|age| age.as_secs()),
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
