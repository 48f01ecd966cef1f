//! Scenario-update reconciliation — applied at turn entry when the
//! published scenario version differs from the session's stored version.
//!
//! Rules, in order: a surviving active step is kept on the new version; a
//! deleted step forces re-localization; a newly added upstream fork whose
//! condition matches the turn may pull the session backwards, but never
//! across a checkpoint step the session has already visited. Newly added
//! upstream steps with unmet variable requirements surface as gap-fill
//! hints for the pipeline.

use ruche_domain::scenario::Scenario;
use ruche_domain::session::SessionState;

use crate::embedding::cosine_similarity;

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Versions already match.
    UpToDate,
    /// Active step survives; session should adopt the new version.
    Kept { new_version: u32 },
    /// Active step was deleted; force re-localization.
    StepDeleted,
    /// A new upstream fork matched; jump the session to it.
    Jump {
        to_step_id: String,
        new_version: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub outcome: Reconciliation,
    /// Session variables required by newly added upstream steps but missing
    /// from the session; the pipeline should re-ask or backfill.
    pub gaps: Vec<String>,
}

/// Reconcile the session against a newly published scenario version.
///
/// `old` is the previously stored version's graph when the config store
/// still retains it; without it, fork detection degrades to keep/delete.
pub fn reconcile_scenario(
    old: Option<&Scenario>,
    new: &Scenario,
    session: &SessionState,
    turn_embedding: Option<&[f32]>,
    transition_threshold: f32,
) -> ReconcileReport {
    let Some(active) = &session.scenario else {
        return ReconcileReport {
            outcome: Reconciliation::UpToDate,
            gaps: Vec::new(),
        };
    };
    if active.version == new.version {
        return ReconcileReport {
            outcome: Reconciliation::UpToDate,
            gaps: Vec::new(),
        };
    }

    // (b) Deleted step: re-localization takes over.
    if new.step(&active.step_id).is_none() {
        return ReconcileReport {
            outcome: Reconciliation::StepDeleted,
            gaps: Vec::new(),
        };
    }

    // (c)+(d): inspect steps added by the update that sit upstream of the
    // current step.
    let mut gaps: Vec<String> = Vec::new();
    let mut jump: Option<String> = None;

    if let Some(old) = old {
        let old_ids = old.step_ids();
        let visited_checkpoints: Vec<&str> = session
            .step_history
            .iter()
            .filter(|e| new.step(&e.step_id).map_or(false, |s| s.is_checkpoint))
            .map(|e| e.step_id.as_str())
            .collect();

        for added in new
            .steps
            .iter()
            .filter(|s| !old_ids.contains(s.step_id.as_str()))
        {
            // Upstream = the new step can reach the current step.
            if added.step_id == active.step_id
                || !new.is_reachable(&added.step_id, &active.step_id)
            {
                continue;
            }

            // (d) gap-fill: requirements of new upstream steps.
            for var in &added.required_variables {
                if !session.variables.contains_key(var) && !gaps.contains(var) {
                    gaps.push(var.clone());
                }
            }

            if jump.is_some() {
                continue;
            }

            // Evaluate the fork condition against the turn.
            let score = added
                .transitions
                .iter()
                .map(|t| match (&t.condition_embedding, turn_embedding) {
                    (None, _) => 1.0,
                    (Some(cond), Some(turn)) => cosine_similarity(turn, cond),
                    (Some(_), None) => 0.0,
                })
                .fold(f32::MIN, f32::max);
            if score < transition_threshold {
                continue;
            }

            // Jumping must not cross a committed checkpoint: a checkpoint
            // the session already passed that lies between the fork and the
            // current step would be silently re-run.
            let crosses = visited_checkpoints
                .iter()
                .any(|cp| *cp != active.step_id && new.is_reachable(&added.step_id, cp));
            if crosses {
                tracing::info!(
                    fork = %added.step_id,
                    "upstream fork matched but would re-cross a committed checkpoint, keeping step"
                );
                continue;
            }
            jump = Some(added.step_id.clone());
        }
    }

    let outcome = match jump {
        Some(to_step_id) => Reconciliation::Jump {
            to_step_id,
            new_version: new.version,
        },
        None => Reconciliation::Kept {
            new_version: new.version,
        },
    };
    ReconcileReport { outcome, gaps }
}
