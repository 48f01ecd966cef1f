pub mod events;
pub mod health;
pub mod inbound;
pub mod sessions;
pub mod webhooks;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use ruche_domain::error::Error;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Health + metrics
        .route("/healthz", get(health::healthz))
        .route("/v1/metrics", get(health::metrics))
        // Ingress (channel connector contract)
        .route("/v1/inbound", post(inbound::inbound))
        // Session inspection
        .route("/v1/sessions", get(sessions::list_sessions))
        .route("/v1/sessions/:key", get(sessions::get_session))
        // Events
        .route("/v1/events/stream", get(events::events_sse))
        .route("/v1/turns/:id/events", get(events::turn_events))
        // Webhook delivery inspection
        .route("/v1/webhooks/deliveries", get(webhooks::list_deliveries))
}

/// Build a standardized JSON error response: `{ "error", "code" }`.
pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into(), "code": code })),
    )
        .into_response()
}

/// Map a fabric error onto an HTTP response.
pub(crate) fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::InvalidRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::IdentityConflict(_) | Error::Conflict(_) => StatusCode::CONFLICT,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::IdentityUnavailable(_) | Error::MutexTimeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.code(), err.to_string())
}
