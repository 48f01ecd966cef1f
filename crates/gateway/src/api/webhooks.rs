//! Webhook delivery inspection.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DeliveriesQuery {
    #[serde(default = "d_limit")]
    pub limit: usize,
}

fn d_limit() -> usize {
    50
}

/// `GET /v1/webhooks/deliveries` — recent terminal deliveries plus the
/// open-queue depth.
pub async fn list_deliveries(
    State(state): State<AppState>,
    Query(query): Query<DeliveriesQuery>,
) -> impl IntoResponse {
    let history = state.deliveries.history(query.limit.min(500));
    Json(serde_json::json!({
        "pending": state.deliveries.pending_count(),
        "recent": history,
    }))
}
