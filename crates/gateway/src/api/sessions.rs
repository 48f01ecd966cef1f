//! Session inspection endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ruche_domain::session::{SessionState, SessionStatus};
use ruche_sessions::store::SessionStore;

use crate::api::api_error;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_key: String,
    pub status: SessionStatus,
    pub version: u64,
    pub turn_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_turn_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_scenario_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_step_id: Option<String>,
    /// Messages currently queued behind the session's in-flight turn.
    pub pending_messages: usize,
}

impl SessionSummary {
    fn of(state: &AppState, session: &SessionState) -> Self {
        let pending = state
            .orchestrator
            .mailbox(&session.session_key)
            .map_or(0, |mb| mb.pending_count());
        Self {
            session_key: session.session_key.clone(),
            status: session.status,
            version: session.version,
            turn_count: session.turn_count,
            last_turn_at: session.last_turn_at,
            active_scenario_id: session.scenario.as_ref().map(|s| s.scenario_id.clone()),
            active_step_id: session.scenario.as_ref().map(|s| s.step_id.clone()),
            pending_messages: pending,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

/// `GET /v1/sessions[?status=active|idle|closed]`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let sessions = match state.sessions.list().await {
        Ok(s) => s,
        Err(e) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.code(),
                e.to_string(),
            )
        }
    };
    let filter = query.status.as_deref().and_then(parse_status);
    let mut summaries: Vec<SessionSummary> = sessions
        .iter()
        .filter(|s| filter.map_or(true, |f| s.status == f))
        .map(|s| SessionSummary::of(&state, s))
        .collect();
    summaries.sort_by(|a, b| b.last_turn_at.cmp(&a.last_turn_at));
    Json(serde_json::json!({
        "sessions": summaries,
        "total": summaries.len(),
    }))
    .into_response()
}

/// `GET /v1/sessions/:key` — the full session state.
pub async fn get_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get(&key).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "session not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string()),
    }
}

fn parse_status(s: &str) -> Option<SessionStatus> {
    match s {
        "active" => Some(SessionStatus::Active),
        "idle" => Some(SessionStatus::Idle),
        "closed" => Some(SessionStatus::Closed),
        _ => None,
    }
}
