use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ConfigIssue, ConfigSeverity};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Concurrency
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the orchestrator handles a new signal while a turn is in flight for
/// the same session key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyStrategy {
    /// Queue the signal; the running turn completes first.
    #[default]
    #[serde(rename = "GROUP_ROUND_ROBIN")]
    GroupRoundRobin,
    /// Cancel the running turn, unless its commit point has been reached.
    #[serde(rename = "CANCEL_IN_PROGRESS")]
    CancelInProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default)]
    pub strategy: ConcurrencyStrategy,
    /// Always 1 in this design; kept configurable for forward compatibility
    /// but validated to 1.
    #[serde(default = "d_one")]
    pub max_runs_per_session: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            strategy: ConcurrencyStrategy::default(),
            max_runs_per_session: 1,
        }
    }
}

impl ConcurrencyConfig {
    pub(super) fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        if self.max_runs_per_session != 1 {
            issues.push(ConfigIssue::error(
                "concurrency.max_runs_per_session",
                "only 1 is supported",
            ));
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aggregation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-channel overrides for the aggregation window and supersede policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelPolicy {
    /// `0` closes the window as soon as the queue drains (web/voice).
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub strategy: Option<ConcurrencyStrategy>,
    #[serde(default)]
    pub max_messages: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Quiet period after which the window closes.
    #[serde(default = "d_window_ms")]
    pub window_ms_default: u64,
    /// Hard cap on messages per logical turn.
    #[serde(default = "d_max_messages")]
    pub max_messages: u32,
    /// Hard cap on aggregated textual payload bytes per logical turn.
    #[serde(default = "d_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub per_channel: HashMap<String, ChannelPolicy>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_ms_default: d_window_ms(),
            max_messages: d_max_messages(),
            max_payload_bytes: d_max_payload_bytes(),
            per_channel: HashMap::new(),
        }
    }
}

impl AggregationConfig {
    pub fn window_ms(&self, channel: &str) -> u64 {
        self.per_channel
            .get(channel)
            .and_then(|c| c.window_ms)
            .unwrap_or(self.window_ms_default)
    }

    pub fn max_messages(&self, channel: &str) -> u32 {
        self.per_channel
            .get(channel)
            .and_then(|c| c.max_messages)
            .unwrap_or(self.max_messages)
    }

    pub(super) fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        if self.max_messages == 0 {
            issues.push(ConfigIssue::error(
                "aggregation.max_messages",
                "must be at least 1",
            ));
        }
        if self.window_ms_default > 60_000 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "aggregation.window_ms_default".into(),
                message: "windows above 60s make turns feel unresponsive".into(),
            });
        }
    }
}

/// Resolve the effective supersede strategy for a channel.
pub fn effective_strategy(
    concurrency: &ConcurrencyConfig,
    aggregation: &AggregationConfig,
    channel: &str,
) -> ConcurrencyStrategy {
    aggregation
        .per_channel
        .get(channel)
        .and_then(|c| c.strategy)
        .unwrap_or(concurrency.strategy)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeouts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Budget for one cognitive-pipeline invocation.
    #[serde(default = "d_brain_ms")]
    pub brain_ms: u64,
    /// Budget for one tool execution.
    #[serde(default = "d_tool_ms")]
    pub tool_ms: u64,
    /// Envelope over the whole turn including retries.
    #[serde(default = "d_total_ms")]
    pub total_ms: u64,
    /// Optional cap on session-slot wait; `None` waits indefinitely.
    #[serde(default)]
    pub mutex_ms: Option<u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            brain_ms: d_brain_ms(),
            tool_ms: d_tool_ms(),
            total_ms: d_total_ms(),
            mutex_ms: None,
        }
    }
}

impl TimeoutsConfig {
    pub(super) fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        if self.total_ms < self.brain_ms {
            issues.push(ConfigIssue::error(
                "timeouts.total_ms",
                "must be at least timeouts.brain_ms",
            ));
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_one() -> u32 {
    1
}
fn d_window_ms() -> u64 {
    3_000
}
fn d_max_messages() -> u32 {
    10
}
fn d_max_payload_bytes() -> usize {
    64 * 1024
}
fn d_brain_ms() -> u64 {
    30_000
}
fn d_tool_ms() -> u64 {
    15_000
}
fn d_total_ms() -> u64 {
    60_000
}
