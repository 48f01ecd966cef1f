//! Session lifecycle — idle marking and automatic close.
//!
//! Evaluated by the gateway's periodic sweep: a session past the idle
//! window moves `active → idle`, and past the close window `idle → closed`.
//! Closing is also triggered explicitly (API) and on fatal errors.

use chrono::{DateTime, Duration, Utc};

use ruche_domain::config::SessionsConfig;
use ruche_domain::session::{SessionState, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTransition {
    MarkIdle,
    Close,
}

impl std::fmt::Display for LifecycleTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MarkIdle => write!(f, "idle timeout"),
            Self::Close => write!(f, "close timeout"),
        }
    }
}

pub struct LifecycleManager {
    config: SessionsConfig,
}

impl LifecycleManager {
    pub fn new(config: SessionsConfig) -> Self {
        Self { config }
    }

    /// Decide whether `session` needs a lifecycle transition at `now`.
    pub fn evaluate(
        &self,
        session: &SessionState,
        now: DateTime<Utc>,
    ) -> Option<LifecycleTransition> {
        let last_activity = session.last_turn_at.unwrap_or(session.created_at);
        let elapsed = now.signed_duration_since(last_activity);

        match session.status {
            SessionStatus::Closed => None,
            SessionStatus::Active => {
                let idle_after = Duration::minutes(self.config.idle_after_minutes as i64);
                (elapsed >= idle_after).then_some(LifecycleTransition::MarkIdle)
            }
            SessionStatus::Idle => {
                let close_after = self.config.close_after_minutes?;
                let close_after = Duration::minutes(close_after as i64);
                (elapsed >= close_after).then_some(LifecycleTransition::Close)
            }
        }
    }
}
