//! Fabric events — the `{category}.{name}` records flowing through the
//! event router to audit, metrics, live streams, and webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Category
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Turn,
    Tool,
    Supersede,
    Commit,
    Enforcement,
    Session,
    Mutex,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Turn => "turn",
            Self::Tool => "tool",
            Self::Supersede => "supersede",
            Self::Commit => "commit",
            Self::Enforcement => "enforcement",
            Self::Session => "session",
            Self::Mutex => "mutex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "turn" => Some(Self::Turn),
            "tool" => Some(Self::Tool),
            "supersede" => Some(Self::Supersede),
            "commit" => Some(Self::Commit),
            "enforcement" => Some(Self::Enforcement),
            "session" => Some(Self::Session),
            "mutex" => Some(Self::Mutex),
            _ => None,
        }
    }

    /// Categories whose events must be durably audited before the turn
    /// reaches a terminal state.
    pub fn is_durable(self) -> bool {
        matches!(self, Self::Turn | Self::Tool | Self::Commit)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AcfEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One fabric event. `event_type` follows the `{category}.{name}` grammar
/// with a lowercase name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcfEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_turn_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interlocutor_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Set when the router truncated the payload to fit the size cap.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub payload_truncated: bool,
}

impl AcfEvent {
    pub fn new(category: EventCategory, name: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: format!("{}.{name}", category.as_str()),
            timestamp: Utc::now(),
            logical_turn_id: None,
            session_key: None,
            tenant_id: None,
            agent_id: None,
            interlocutor_id: None,
            payload: serde_json::Map::new(),
            payload_truncated: false,
        }
    }

    pub fn category(&self) -> Option<EventCategory> {
        let (cat, _) = self.event_type.split_once('.')?;
        EventCategory::parse(cat)
    }

    pub fn with_turn(mut self, logical_turn_id: Uuid) -> Self {
        self.logical_turn_id = Some(logical_turn_id);
        self
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_scope(mut self, tenant_id: Uuid, agent_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_interlocutor(mut self, interlocutor_id: Uuid) -> Self {
        self.interlocutor_id = Some(interlocutor_id);
        self
    }

    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription pattern grammar
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Match an event type against a subscription pattern.
///
/// Grammar: `"*"` matches everything, `"{category}.*"` matches the whole
/// category, anything else is an exact match.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(category) = pattern.strip_suffix(".*") {
        return event_type
            .split_once('.')
            .map_or(false, |(cat, _)| cat == category);
    }
    pattern == event_type
}

/// Whether a string is a well-formed subscription pattern.
pub fn pattern_is_valid(pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let category = pattern
        .strip_suffix(".*")
        .or_else(|| pattern.split_once('.').map(|(cat, _)| cat));
    category.map_or(false, |c| EventCategory::parse(c).is_some())
}
