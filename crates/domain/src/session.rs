//! Session state — the per-conversation record serialized under the session
//! key and mutated exclusively through compare-and-swap writes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounded length of `step_history`.
pub const STEP_HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Closed,
}

/// Interlocutor kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterlocutorKind {
    Human,
    Agent,
    System,
    Bot,
}

/// The active scenario triple. Either all three of scenario id, version, and
/// step are set, or the session has no active scenario — the `Option`
/// enforces the invariant structurally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveScenario {
    pub scenario_id: String,
    pub version: u32,
    pub step_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepHistoryEntry {
    pub step_id: String,
    pub entered_at: DateTime<Utc>,
    pub turn_number: u64,
    /// Why the step was entered: `"transition"`, `"entry"`,
    /// `"relocalize:step_deleted"`, …
    pub reason: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_key: String,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub interlocutor_id: Uuid,
    pub channel: String,
    /// Monotonic CAS version. Every persisted mutation increments it.
    pub version: u64,
    #[serde(default)]
    pub scenario: Option<ActiveScenario>,
    #[serde(default)]
    pub step_history: Vec<StepHistoryEntry>,
    #[serde(default)]
    pub relocalization_count: u32,
    /// Consecutive turns whose navigator max score fell below the sanity
    /// threshold; feeds the re-localization trigger.
    #[serde(default)]
    pub low_confidence_streak: u32,
    #[serde(default)]
    pub last_turn_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub turn_count: u64,
    pub status: SessionStatus,
    /// Small customer/variable map; opaque to the fabric.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(
        session_key: impl Into<String>,
        tenant_id: Uuid,
        agent_id: Uuid,
        interlocutor_id: Uuid,
        channel: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_key: session_key.into(),
            tenant_id,
            agent_id,
            interlocutor_id,
            channel: channel.into(),
            version: 0,
            scenario: None,
            step_history: Vec::new(),
            relocalization_count: 0,
            low_confidence_streak: 0,
            last_turn_at: None,
            turn_count: 0,
            status: SessionStatus::Active,
            variables: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a step-history entry, evicting the oldest past the cap.
    pub fn push_step(&mut self, entry: StepHistoryEntry) {
        self.step_history.push(entry);
        while self.step_history.len() > STEP_HISTORY_CAP {
            self.step_history.remove(0);
        }
    }

    /// Record a completed turn on the session counters.
    pub fn record_turn(&mut self, at: DateTime<Utc>) {
        self.turn_count += 1;
        self.last_turn_at = Some(at);
        self.status = SessionStatus::Active;
    }

    /// Enter a scenario step, updating the active triple and the history.
    pub fn enter_step(
        &mut self,
        scenario_id: &str,
        version: u32,
        step_id: &str,
        reason: &str,
        confidence: f32,
    ) {
        self.scenario = Some(ActiveScenario {
            scenario_id: scenario_id.into(),
            version,
            step_id: step_id.into(),
        });
        let turn_number = self.turn_count;
        self.push_step(StepHistoryEntry {
            step_id: step_id.into(),
            entered_at: Utc::now(),
            turn_number,
            reason: reason.into(),
            confidence,
        });
    }

    /// Leave the active scenario (terminal step reached or navigator exit).
    pub fn exit_scenario(&mut self) {
        self.scenario = None;
    }
}
