//! Health probe and metrics snapshot.

use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len(),
        "active_session_actors": state.orchestrator.session_count(),
        "pending_deliveries": state.deliveries.pending_count(),
    }))
}

/// `GET /v1/metrics` — flat counter snapshot.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.router.metrics().snapshot())
}
