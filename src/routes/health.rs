//! Health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /rio/health`: liveness probe.
///
/// Returns status, uptime, version, session counts and whether new sessions
/// are being admitted.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "app": state.app.name(),
        "sessions": {
            "latent": state.registry.latent_count().await,
            "active": state.registry.active_count().await,
        },
        "pending_uploads": state.uploads.len().await,
        "hosted_assets": state.assets.len().await,
        "accepting_sessions": state.gate.is_open(),
    }))
}
