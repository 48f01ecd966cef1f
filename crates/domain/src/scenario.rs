//! Scenario graphs — versioned multi-step flows navigated by the scenario
//! navigator. A scenario is a finite set of steps with ordered, semantically
//! scored transitions.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub to_step_id: String,
    /// Natural-language condition, scored against the turn embedding.
    pub condition_text: String,
    /// Pre-computed embedding of `condition_text`. A missing embedding
    /// scores 1.0 (always eligible).
    #[serde(default)]
    pub condition_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_entry: bool,
    #[serde(default)]
    pub is_terminal: bool,
    /// Eligible as a re-localization target from any point in the flow.
    #[serde(default)]
    pub reachable_from_anywhere: bool,
    /// A checkpoint marks work that must not be silently re-entered when a
    /// scenario update adds an upstream fork.
    #[serde(default)]
    pub is_checkpoint: bool,
    /// Session variables this step needs; missing ones trigger a gap-fill
    /// pass during scenario-update reconciliation.
    #[serde(default)]
    pub required_variables: Vec<String>,
    /// Outgoing transitions in definition order.
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Step {
    /// Compact textual descriptor for re-localization scoring:
    /// name, description, and up to three transition conditions.
    pub fn descriptor(&self) -> String {
        let mut parts = vec![self.name.clone()];
        if let Some(desc) = &self.description {
            parts.push(desc.clone());
        }
        parts.extend(
            self.transitions
                .iter()
                .take(3)
                .map(|t| t.condition_text.clone()),
        );
        parts.join(" | ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub scenario_id: String,
    pub version: u32,
    pub entry_step_id: String,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn entry_step(&self) -> Option<&Step> {
        self.step(&self.entry_step_id)
    }

    pub fn step_ids(&self) -> HashSet<&str> {
        self.steps.iter().map(|s| s.step_id.as_str()).collect()
    }

    /// Structural validation: the entry step must exist and every transition
    /// target must resolve within this version.
    pub fn validate(&self) -> Result<()> {
        let ids = self.step_ids();
        if !ids.contains(self.entry_step_id.as_str()) {
            return Err(Error::Config(format!(
                "scenario {}: entry step '{}' is not a member of steps",
                self.scenario_id, self.entry_step_id
            )));
        }
        for step in &self.steps {
            for t in &step.transitions {
                if !ids.contains(t.to_step_id.as_str()) {
                    return Err(Error::Config(format!(
                        "scenario {}: step '{}' targets unknown step '{}'",
                        self.scenario_id, step.step_id, t.to_step_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Step ids reachable from `from` within `max_hops` transitions
    /// (breadth-first, excluding `from` itself).
    pub fn reachable_within(&self, from: &str, max_hops: usize) -> Vec<String> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        let mut out = Vec::new();
        queue.push_back((from, 0));
        seen.insert(from, 0);

        while let Some((id, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            let Some(step) = self.step(id) else { continue };
            for t in &step.transitions {
                let target = t.to_step_id.as_str();
                if !seen.contains_key(target) {
                    seen.insert(target, depth + 1);
                    out.push(target.to_owned());
                    queue.push_back((target, depth + 1));
                }
            }
        }
        out
    }

    /// Whether `target` is reachable from `from` (any number of hops), or is
    /// flagged `reachable_from_anywhere`.
    pub fn is_reachable(&self, from: &str, target: &str) -> bool {
        if let Some(step) = self.step(target) {
            if step.reachable_from_anywhere {
                return true;
            }
        }
        if from == target {
            return true;
        }
        self.reachable_within(from, self.steps.len())
            .iter()
            .any(|s| s == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn step(id: &str, targets: &[&str]) -> Step {
        Step {
            step_id: id.into(),
            name: id.replace('_', " "),
            description: None,
            is_entry: false,
            is_terminal: targets.is_empty(),
            reachable_from_anywhere: false,
            is_checkpoint: false,
            required_variables: Vec::new(),
            transitions: targets
                .iter()
                .map(|t| Transition {
                    to_step_id: (*t).into(),
                    condition_text: format!("go to {t}"),
                    condition_embedding: None,
                    priority: 0,
                })
                .collect(),
        }
    }

    fn linear_scenario() -> Scenario {
        Scenario {
            scenario_id: "returns".into(),
            version: 1,
            entry_step_id: "greet".into(),
            steps: vec![
                step("greet", &["collect"]),
                step("collect", &["confirm"]),
                step("confirm", &["done"]),
                step("done", &[]),
            ],
        }
    }

    #[test]
    fn validates_well_formed_graph() {
        assert!(linear_scenario().validate().is_ok());
    }

    #[test]
    fn rejects_missing_entry() {
        let mut s = linear_scenario();
        s.entry_step_id = "ghost".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_dangling_transition() {
        let mut s = linear_scenario();
        s.steps[0].transitions[0].to_step_id = "nowhere".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn reachability_within_hops() {
        let s = linear_scenario();
        let one_hop = s.reachable_within("greet", 1);
        assert_eq!(one_hop, vec!["collect".to_string()]);

        let three_hops = s.reachable_within("greet", 3);
        assert!(three_hops.contains(&"done".to_string()));
        assert!(!s.reachable_within("greet", 2).contains(&"done".to_string()));
    }

    #[test]
    fn reachable_from_anywhere_always_reachable() {
        let mut s = linear_scenario();
        s.steps[3].reachable_from_anywhere = true;
        assert!(s.is_reachable("greet", "done"));
        // Backwards edge absent: greet unreachable from done unless flagged.
        assert!(!s.is_reachable("done", "greet"));
    }

    #[test]
    fn descriptor_caps_transition_conditions() {
        let mut st = step("hub", &["a", "b", "c", "d", "e"]);
        st.description = Some("routing hub".into());
        let d = st.descriptor();
        assert!(d.starts_with("hub | routing hub"));
        // Only three conditions included.
        assert_eq!(d.matches("go to").count(), 3);
    }
}
