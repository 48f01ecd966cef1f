use serde::{Deserialize, Serialize};

use super::ConfigIssue;

/// Scenario-navigator thresholds. Defaults follow the platform tuning; all
/// similarity values are cosine scores in `[-1, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigatorConfig {
    #[serde(default = "d_entry")]
    pub entry_threshold: f32,
    /// Minimum score for a transition to be a candidate.
    #[serde(default = "d_transition")]
    pub transition_threshold: f32,
    /// Below this, the session is considered lost on its current step.
    #[serde(default = "d_sanity")]
    pub sanity_threshold: f32,
    /// Required gap between the top candidate and the runner-up.
    #[serde(default = "d_margin")]
    pub min_margin: f32,
    /// Minimum score to accept a re-localization target.
    #[serde(default = "d_reloc")]
    pub relocalization_threshold: f32,
    /// Consecutive low-score turns before re-localization triggers.
    #[serde(default = "d_trigger_turns")]
    pub relocalization_trigger_turns: u32,
    #[serde(default = "d_hops")]
    pub max_relocalization_hops: usize,
    #[serde(default = "d_candidates")]
    pub max_relocalization_candidates: usize,
    /// A step visited this many times within the detection window suppresses
    /// further transitions to it.
    #[serde(default = "d_loop_iters")]
    pub max_loop_iterations: usize,
    #[serde(default = "d_loop_window")]
    pub loop_detection_window: usize,
    /// Whether multi-candidate ties are adjudicated by the LLM hook.
    #[serde(default = "d_true")]
    pub llm_adjudication: bool,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            entry_threshold: d_entry(),
            transition_threshold: d_transition(),
            sanity_threshold: d_sanity(),
            min_margin: d_margin(),
            relocalization_threshold: d_reloc(),
            relocalization_trigger_turns: d_trigger_turns(),
            max_relocalization_hops: d_hops(),
            max_relocalization_candidates: d_candidates(),
            max_loop_iterations: d_loop_iters(),
            loop_detection_window: d_loop_window(),
            llm_adjudication: d_true(),
        }
    }
}

impl NavigatorConfig {
    pub(super) fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        for (field, value) in [
            ("scenario_navigator.entry_threshold", self.entry_threshold),
            (
                "scenario_navigator.transition_threshold",
                self.transition_threshold,
            ),
            ("scenario_navigator.sanity_threshold", self.sanity_threshold),
            (
                "scenario_navigator.relocalization_threshold",
                self.relocalization_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                issues.push(ConfigIssue::error(field, "must be in [0, 1]"));
            }
        }
        if self.sanity_threshold > self.transition_threshold {
            issues.push(ConfigIssue::error(
                "scenario_navigator.sanity_threshold",
                "must not exceed transition_threshold",
            ));
        }
        if self.loop_detection_window == 0 || self.max_loop_iterations == 0 {
            issues.push(ConfigIssue::error(
                "scenario_navigator.loop_detection_window",
                "loop detection parameters must be non-zero",
            ));
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_entry() -> f32 {
    0.65
}
fn d_transition() -> f32 {
    0.65
}
fn d_sanity() -> f32 {
    0.35
}
fn d_margin() -> f32 {
    0.10
}
fn d_reloc() -> f32 {
    0.70
}
fn d_trigger_turns() -> u32 {
    3
}
fn d_hops() -> usize {
    3
}
fn d_candidates() -> usize {
    10
}
fn d_loop_iters() -> usize {
    5
}
fn d_loop_window() -> usize {
    10
}
fn d_true() -> bool {
    true
}
