//! Re-localization — recover a session whose step is invalid or out of sync
//! by mapping it to the best-matching reachable step.

use ruche_domain::config::NavigatorConfig;
use ruche_domain::error::Result;
use ruche_domain::scenario::Scenario;
use ruche_domain::session::SessionState;

use crate::embedding::{cosine_similarity, Embedder};

/// Find the best re-localization target, or `None` when no candidate clears
/// the threshold (the caller then exits the scenario).
///
/// Candidate set: steps flagged `reachable_from_anywhere`, plus steps within
/// `max_relocalization_hops` of the last step-history entry that still
/// exists in the scenario (entry step and neighbors when history is empty),
/// capped at `max_relocalization_candidates`. Candidates are scored by
/// cosine similarity between their descriptor embedding and an embedding of
/// the last five turns.
pub async fn relocalize(
    config: &NavigatorConfig,
    scenario: &Scenario,
    session: &SessionState,
    recent_turns: &[String],
    embedder: &dyn Embedder,
) -> Result<Option<(String, f32)>> {
    // Anchor: last surviving step from history, else the entry step.
    let anchor = session
        .step_history
        .iter()
        .rev()
        .find(|e| scenario.step(&e.step_id).is_some())
        .map(|e| e.step_id.clone());

    let mut candidate_ids: Vec<String> = Vec::new();
    let mut push = |id: &str, out: &mut Vec<String>| {
        if !out.iter().any(|c| c == id) {
            out.push(id.to_owned());
        }
    };

    for step in scenario.steps.iter().filter(|s| s.reachable_from_anywhere) {
        push(&step.step_id, &mut candidate_ids);
    }
    match &anchor {
        Some(from) => {
            push(from, &mut candidate_ids);
            for id in scenario.reachable_within(from, config.max_relocalization_hops) {
                push(&id, &mut candidate_ids);
            }
        }
        None => {
            push(&scenario.entry_step_id, &mut candidate_ids);
            for id in scenario.reachable_within(&scenario.entry_step_id, 1) {
                push(&id, &mut candidate_ids);
            }
        }
    }
    candidate_ids.truncate(config.max_relocalization_candidates);

    if candidate_ids.is_empty() {
        return Ok(None);
    }

    // Context embedding from the last five turns.
    let window_start = recent_turns.len().saturating_sub(5);
    let context_text = recent_turns[window_start..].join("\n");
    if context_text.is_empty() {
        tracing::debug!("relocalization without turn context, giving up");
        return Ok(None);
    }
    let context_vec = embedder.embed(&context_text).await?;

    let mut best: Option<(String, f32)> = None;
    for id in &candidate_ids {
        let Some(step) = scenario.step(id) else { continue };
        let descriptor_vec = embedder.embed(&step.descriptor()).await?;
        let score = cosine_similarity(&context_vec, &descriptor_vec);
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((id.clone(), score));
        }
    }

    let Some((step_id, score)) = best else {
        return Ok(None);
    };
    if score < config.relocalization_threshold {
        tracing::info!(
            best_step = %step_id,
            score,
            threshold = config.relocalization_threshold,
            "no re-localization candidate clears the threshold"
        );
        return Ok(None);
    }

    // Reachability re-check against the anchor.
    let from = anchor.as_deref().unwrap_or(&scenario.entry_step_id);
    if !scenario.is_reachable(from, &step_id) {
        tracing::warn!(
            step_id = %step_id,
            from = %from,
            "best re-localization candidate is unreachable, giving up"
        );
        return Ok(None);
    }

    Ok(Some((step_id, score)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::KeywordEmbedder;
    use ruche_domain::scenario::{Step, Transition};
    use uuid::Uuid;

    fn step(id: &str, description: &str, targets: &[&str]) -> Step {
        Step {
            step_id: id.into(),
            name: id.into(),
            description: Some(description.into()),
            is_entry: false,
            is_terminal: targets.is_empty(),
            reachable_from_anywhere: false,
            is_checkpoint: false,
            required_variables: Vec::new(),
            transitions: targets
                .iter()
                .map(|t| Transition {
                    to_step_id: (*t).into(),
                    condition_text: format!("move to {t}"),
                    condition_embedding: None,
                    priority: 0,
                })
                .collect(),
        }
    }

    fn scenario() -> Scenario {
        Scenario {
            scenario_id: "returns".into(),
            version: 2,
            entry_step_id: "greet".into(),
            steps: vec![
                step("greet", "welcome the customer", &["collect"]),
                step(
                    "collect",
                    "collect order number and return reason",
                    &["confirm"],
                ),
                step(
                    "confirm",
                    "confirm the return request and refund amount",
                    &["done"],
                ),
                step("done", "closing", &[]),
            ],
        }
    }

    fn session_with_history(steps: &[&str]) -> SessionState {
        let mut s = SessionState::new(
            "sess:k",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "web",
        );
        for (i, id) in steps.iter().enumerate() {
            s.enter_step("returns", 1, id, "transition", 0.9);
            s.step_history[i].turn_number = i as u64;
        }
        s
    }

    #[tokio::test]
    async fn relocates_to_matching_step() {
        let config = NavigatorConfig {
            relocalization_threshold: 0.3,
            ..Default::default()
        };
        let sc = scenario();
        let session = session_with_history(&["greet", "collect"]);
        let recent = vec!["confirm the refund amount for my return request".to_string()];

        let found = relocalize(&config, &sc, &session, &recent, &KeywordEmbedder)
            .await
            .unwrap();
        let (step_id, score) = found.expect("should find a candidate");
        assert_eq!(step_id, "confirm");
        assert!(score >= 0.3);
    }

    #[tokio::test]
    async fn exits_when_nothing_clears_threshold() {
        let config = NavigatorConfig {
            relocalization_threshold: 0.99,
            ..Default::default()
        };
        let sc = scenario();
        let session = session_with_history(&["greet"]);
        let recent = vec!["completely unrelated quantum chromodynamics".to_string()];

        let found = relocalize(&config, &sc, &session, &recent, &KeywordEmbedder)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn empty_history_anchors_on_entry() {
        let config = NavigatorConfig {
            relocalization_threshold: 0.2,
            max_relocalization_hops: 3,
            ..Default::default()
        };
        let sc = scenario();
        let session = session_with_history(&[]);
        let recent = vec!["collect order number return reason".to_string()];

        let found = relocalize(&config, &sc, &session, &recent, &KeywordEmbedder)
            .await
            .unwrap();
        let (step_id, _) = found.expect("entry neighborhood should match");
        // Entry + one hop: greet or collect.
        assert!(step_id == "greet" || step_id == "collect");
    }

    #[tokio::test]
    async fn no_context_gives_up() {
        let config = NavigatorConfig::default();
        let sc = scenario();
        let session = session_with_history(&["greet"]);
        let found = relocalize(&config, &sc, &session, &[], &KeywordEmbedder)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn candidate_cap_applies() {
        let mut config = NavigatorConfig {
            relocalization_threshold: 0.0,
            max_relocalization_candidates: 1,
            ..Default::default()
        };
        config.max_relocalization_hops = 3;
        let sc = scenario();
        let session = session_with_history(&["greet"]);
        let recent = vec!["confirm the refund".to_string()];

        // With a cap of 1, only the anchor ("greet") survives as candidate.
        let found = relocalize(&config, &sc, &session, &recent, &KeywordEmbedder)
            .await
            .unwrap();
        if let Some((step_id, _)) = found {
            assert_eq!(step_id, "greet");
        }
    }
}
