//! Event endpoints: the live SSE stream and per-turn audit queries.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_core::Stream;
use serde::Deserialize;
use uuid::Uuid;

use ruche_domain::event::{pattern_matches, AcfEvent};
use ruche_fabric::AuditStore;

use crate::api::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Subscription-grammar filter: `*`, `{category}.*`, or exact.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Restrict to one session key.
    #[serde(default)]
    pub session_key: Option<String>,
}

/// `GET /v1/events/stream` — best-effort live fan-out of fabric events.
pub async fn events_sse(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let rx = state.core.router.subscribe_live();
    let pattern = query.pattern.unwrap_or_else(|| "*".to_owned());
    let stream = make_event_stream(rx, pattern, query.session_key);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn make_event_stream(
    mut rx: tokio::sync::broadcast::Receiver<AcfEvent>,
    pattern: String,
    session_key: Option<String>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !pattern_matches(&pattern, &event.event_type) {
                        continue;
                    }
                    if let Some(key) = &session_key {
                        if event.session_key.as_deref() != Some(key.as_str()) {
                            continue;
                        }
                    }
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event(event.event_type.clone()).data(data));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    let msg = format!("{{\"warning\":\"missed {n} events\"}}");
                    yield Ok(Event::default().event("warning").data(msg));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}

/// `GET /v1/turns/:id/events` — audit trail of one logical turn.
pub async fn turn_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.audit.events_for_turn(id).await {
        Ok(events) if events.is_empty() => {
            api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "no events for turn")
        }
        Ok(events) => Json(serde_json::json!({
            "logical_turn_id": id,
            "events": events,
        }))
        .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string()),
    }
}
