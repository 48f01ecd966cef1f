//! Logical turns — the unit of work produced by aggregating one or more
//! inbound messages for a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{RawMessage, ResponseSegment};
use crate::session::SessionState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `accumulating → running → (committed | superseded | failed)`.
/// `committed` is terminal and blocks supersede.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Accumulating,
    Running,
    Committed,
    Superseded,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Superseded | Self::Failed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool attempts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Declared side-effect class of a tool. An `irreversible` success is the
/// turn's commit point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffectPolicy {
    None,
    Reversible,
    Irreversible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAttemptStatus {
    Authorized,
    Executed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptedTool {
    pub tool_id: String,
    pub side_effect_policy: SideEffectPolicy,
    pub idempotency_key: String,
    pub status: ToolAttemptStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LogicalTurn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalTurn {
    pub logical_turn_id: Uuid,
    pub session_key: String,
    /// Aggregated messages in arrival order.
    pub messages: Vec<RawMessage>,
    pub started_at: DateTime<Utc>,
    pub state: TurnState,
    /// Flipped by the first successful irreversible tool; blocks supersede.
    pub commit_reached: bool,
    pub attempted_tools: Vec<AttemptedTool>,
}

impl LogicalTurn {
    pub fn open(logical_turn_id: Uuid, session_key: impl Into<String>) -> Self {
        Self {
            logical_turn_id,
            session_key: session_key.into(),
            messages: Vec::new(),
            started_at: Utc::now(),
            state: TurnState::Accumulating,
            commit_reached: false,
            attempted_tools: Vec::new(),
        }
    }

    /// Total textual payload bytes across absorbed messages.
    pub fn payload_bytes(&self) -> usize {
        self.messages.iter().map(RawMessage::payload_len).sum()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnResult
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the cognitive pipeline hands back to the scheduler.
///
/// `abort = true` is the cooperative supersede path: the pipeline noticed
/// pending messages before any irreversible work and yields; `segments` and
/// `session` are ignored in that case. Unexpected failures propagate as
/// `Err(_)` instead.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub segments: Vec<ResponseSegment>,
    /// Updated session state to persist via CAS at commit.
    pub session: SessionState,
    pub abort: bool,
}

impl TurnResult {
    pub fn respond(session: SessionState, segments: Vec<ResponseSegment>) -> Self {
        Self {
            segments,
            session,
            abort: false,
        }
    }

    pub fn abort(session: SessionState) -> Self {
        Self {
            segments: Vec::new(),
            session,
            abort: true,
        }
    }
}
