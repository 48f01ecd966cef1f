//! `POST /v1/inbound` — the normalized envelope entry point.
//!
//! Connectors post a [`RawMessage`] and get back the logical turn the
//! message landed in. The turn runs asynchronously; responses surface
//! through the live event stream or the connector's own sink.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use ruche_domain::envelope::RawMessage;

use crate::api::error_response;
use crate::state::AppState;

pub async fn inbound(
    State(state): State<AppState>,
    Json(envelope): Json<RawMessage>,
) -> impl IntoResponse {
    match state.ingress.submit(envelope).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(err) => error_response(err),
    }
}
