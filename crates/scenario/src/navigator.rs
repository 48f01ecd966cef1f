//! The scenario navigator — decides, for one turn, whether the session
//! stays on its step, transitions, re-localizes, or exits the scenario.
//!
//! Stages run in order: consistency, transition enumeration, semantic
//! scoring, sanity gate, decision (with optional LLM adjudication and
//! priority tie-break), exit checks. A transition into a step that keeps
//! recurring within the detection window is suppressed.

use async_trait::async_trait;

use ruche_domain::config::NavigatorConfig;
use ruche_domain::error::Result;
use ruche_domain::scenario::{Scenario, Step, Transition};
use ruche_domain::session::SessionState;

use crate::embedding::{cosine_similarity, Embedder};
use crate::relocalize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Explicit navigation signal surfaced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioSignal {
    Exit,
    WrongStep,
}

/// Per-turn navigation context.
pub struct NavContext<'a> {
    /// Embedding of the aggregated turn text.
    pub turn_embedding: Option<&'a [f32]>,
    /// Texts of the most recent turns (newest last); re-localization uses
    /// the last five.
    pub recent_turns: &'a [String],
    pub signal: Option<ScenarioSignal>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adjudication hook
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A candidate transition handed to the adjudicator, ranked by score.
#[derive(Debug, Clone)]
pub struct AdjudicationRequest {
    pub current_step_id: String,
    pub current_step_name: String,
    /// `(to_step_id, condition_text, score)` sorted by descending score.
    pub candidates: Vec<(String, String, f32)>,
    /// Recent step ids, oldest first.
    pub recent_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjudication {
    Choose(String),
    Uncertain,
}

/// LLM tie-break capability for multi-candidate transitions.
#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn adjudicate(&self, request: AdjudicationRequest) -> Result<Adjudication>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum NavDecision {
    /// Stay on the current step.
    Continue { confidence: f32 },
    Transition { to_step_id: String, score: f32 },
    Relocalize {
        step_id: String,
        score: f32,
        reason: String,
    },
    Exit { reason: String },
}

/// Decision plus the raw top score, which feeds the session's
/// low-confidence streak.
#[derive(Debug, Clone, PartialEq)]
pub struct NavOutcome {
    pub decision: NavDecision,
    pub max_score: f32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Navigator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Navigator {
    config: NavigatorConfig,
}

impl Navigator {
    pub fn new(config: NavigatorConfig) -> Self {
        Self { config }
    }

    pub async fn navigate(
        &self,
        ctx: &NavContext<'_>,
        scenario: &Scenario,
        session: &SessionState,
        embedder: &dyn Embedder,
        adjudicator: Option<&dyn Adjudicator>,
    ) -> Result<NavOutcome> {
        let Some(active) = &session.scenario else {
            return Ok(NavOutcome {
                decision: NavDecision::Exit {
                    reason: "no_active_scenario".into(),
                },
                max_score: 0.0,
            });
        };

        // ── Stage 1: consistency ─────────────────────────────────────
        let Some(current) = scenario.step(&active.step_id) else {
            return self
                .relocalize_or_exit(ctx, scenario, session, embedder, "step_deleted")
                .await;
        };
        if active.version != scenario.version {
            tracing::warn!(
                scenario_id = %scenario.scenario_id,
                session_version = active.version,
                scenario_version = scenario.version,
                step_id = %active.step_id,
                "scenario version drift with surviving step, continuing"
            );
        }

        // ── Stage 2: enumerate outgoing transitions ──────────────────
        if current.transitions.is_empty() {
            let decision = if current.is_terminal {
                NavDecision::Exit {
                    reason: "terminal".into(),
                }
            } else {
                NavDecision::Continue { confidence: 1.0 }
            };
            return Ok(NavOutcome {
                decision,
                max_score: 0.0,
            });
        }

        // ── Stage 3: semantic scoring ────────────────────────────────
        let scores: Vec<f32> = current
            .transitions
            .iter()
            .map(|t| transition_score(ctx.turn_embedding, t))
            .collect();
        let max_score = scores.iter().copied().fold(f32::MIN, f32::max);
        let candidates: Vec<usize> = (0..scores.len())
            .filter(|&i| scores[i] >= self.config.transition_threshold)
            .collect();

        // ── Stage 4: sanity gate ─────────────────────────────────────
        let wrong_step = ctx.signal == Some(ScenarioSignal::WrongStep);
        let streak_tripped =
            session.low_confidence_streak + 1 >= self.config.relocalization_trigger_turns;
        if max_score < self.config.sanity_threshold && (wrong_step || streak_tripped) {
            let reason = if wrong_step { "wrong_step" } else { "low_confidence" };
            let outcome = self
                .relocalize_or_exit(ctx, scenario, session, embedder, reason)
                .await?;
            return Ok(NavOutcome {
                max_score,
                ..outcome
            });
        }

        // Explicit exit signal overrides transition selection.
        if ctx.signal == Some(ScenarioSignal::Exit) {
            return Ok(NavOutcome {
                decision: NavDecision::Exit {
                    reason: "signal".into(),
                },
                max_score,
            });
        }

        // ── Stage 5: decide ──────────────────────────────────────────
        let decision = match candidates.len() {
            0 => {
                if current.is_terminal {
                    NavDecision::Exit {
                        reason: "terminal".into(),
                    }
                } else {
                    NavDecision::Continue {
                        confidence: 1.0 - max_score,
                    }
                }
            }
            1 => {
                let idx = candidates[0];
                self.transition_guarded(
                    session,
                    &current.transitions[idx].to_step_id,
                    scores[idx],
                )
            }
            _ => {
                self.decide_multi(
                    ctx,
                    current,
                    session,
                    &candidates,
                    &scores,
                    adjudicator,
                )
                .await?
            }
        };

        Ok(NavOutcome {
            decision,
            max_score,
        })
    }

    /// Multi-candidate resolution: LLM adjudication when enabled, otherwise
    /// the `(-priority, -score, definition_order)` tie-break with margin.
    async fn decide_multi(
        &self,
        ctx: &NavContext<'_>,
        current: &Step,
        session: &SessionState,
        candidates: &[usize],
        scores: &[f32],
        adjudicator: Option<&dyn Adjudicator>,
    ) -> Result<NavDecision> {
        if self.config.llm_adjudication {
            if let Some(adjudicator) = adjudicator {
                let mut ranked: Vec<(String, String, f32)> = candidates
                    .iter()
                    .map(|&i| {
                        let t = &current.transitions[i];
                        (t.to_step_id.clone(), t.condition_text.clone(), scores[i])
                    })
                    .collect();
                ranked.sort_by(|a, b| b.2.total_cmp(&a.2));

                let request = AdjudicationRequest {
                    current_step_id: current.step_id.clone(),
                    current_step_name: current.name.clone(),
                    candidates: ranked,
                    recent_steps: session
                        .step_history
                        .iter()
                        .rev()
                        .take(5)
                        .rev()
                        .map(|e| e.step_id.clone())
                        .collect(),
                };
                match adjudicator.adjudicate(request).await? {
                    Adjudication::Choose(step_id) => {
                        // Accept only a choice among the candidates.
                        if let Some(&idx) = candidates
                            .iter()
                            .find(|&&i| current.transitions[i].to_step_id == step_id)
                        {
                            return Ok(self.transition_guarded(
                                session,
                                &step_id,
                                scores[idx],
                            ));
                        }
                        tracing::warn!(
                            step_id = %step_id,
                            "adjudicator chose a non-candidate step, falling back"
                        );
                    }
                    Adjudication::Uncertain => {}
                }
            }
        }

        // Priority tie-break.
        let mut order: Vec<usize> = candidates.to_vec();
        order.sort_by(|&a, &b| {
            let ta = &current.transitions[a];
            let tb = &current.transitions[b];
            tb.priority
                .cmp(&ta.priority)
                .then(scores[b].total_cmp(&scores[a]))
                .then(a.cmp(&b))
        });
        let top = order[0];
        let runner_up = order[1];
        let margin = scores[top] - scores[runner_up];
        let _ = ctx;
        if margin < self.config.min_margin {
            return Ok(NavDecision::Continue { confidence: margin });
        }
        Ok(self.transition_guarded(
            session,
            &current.transitions[top].to_step_id,
            scores[top],
        ))
    }

    /// Apply loop suppression before committing to a transition.
    fn transition_guarded(
        &self,
        session: &SessionState,
        to_step_id: &str,
        score: f32,
    ) -> NavDecision {
        let window = session
            .step_history
            .iter()
            .rev()
            .take(self.config.loop_detection_window);
        let visits = window.filter(|e| e.step_id == to_step_id).count();
        if visits >= self.config.max_loop_iterations {
            tracing::warn!(
                step_id = %to_step_id,
                visits,
                window = self.config.loop_detection_window,
                "loop detected, suppressing transition"
            );
            return NavDecision::Continue { confidence: score };
        }
        NavDecision::Transition {
            to_step_id: to_step_id.to_owned(),
            score,
        }
    }

    async fn relocalize_or_exit(
        &self,
        ctx: &NavContext<'_>,
        scenario: &Scenario,
        session: &SessionState,
        embedder: &dyn Embedder,
        reason: &str,
    ) -> Result<NavOutcome> {
        let found = relocalize::relocalize(
            &self.config,
            scenario,
            session,
            ctx.recent_turns,
            embedder,
        )
        .await?;
        let decision = match found {
            Some((step_id, score)) => NavDecision::Relocalize {
                step_id,
                score,
                reason: format!("relocalize:{reason}"),
            },
            None => NavDecision::Exit {
                reason: format!("relocalization_failed:{reason}"),
            },
        };
        Ok(NavOutcome {
            decision,
            max_score: 0.0,
        })
    }
}

/// Score one transition against the turn embedding. A transition without a
/// condition embedding always matches (scores 1.0); a turn without an
/// embedding cannot match conditioned transitions.
fn transition_score(turn_embedding: Option<&[f32]>, transition: &Transition) -> f32 {
    match (&transition.condition_embedding, turn_embedding) {
        (None, _) => 1.0,
        (Some(cond), Some(turn)) => cosine_similarity(turn, cond),
        (Some(_), None) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::KeywordEmbedder;
    use chrono::Utc;
    use ruche_domain::session::StepHistoryEntry;
    use uuid::Uuid;

    fn step(id: &str, transitions: Vec<Transition>) -> Step {
        Step {
            step_id: id.into(),
            name: id.into(),
            description: None,
            is_entry: false,
            is_terminal: transitions.is_empty(),
            reachable_from_anywhere: false,
            is_checkpoint: false,
            required_variables: Vec::new(),
            transitions,
        }
    }

    fn transition(to: &str, embedding: Option<Vec<f32>>, priority: i32) -> Transition {
        Transition {
            to_step_id: to.into(),
            condition_text: format!("go to {to}"),
            condition_embedding: embedding,
            priority,
        }
    }

    fn session_on(scenario: &Scenario, step_id: &str) -> SessionState {
        let mut s = SessionState::new(
            "sess:k",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "web",
        );
        s.enter_step(&scenario.scenario_id, scenario.version, step_id, "entry", 1.0);
        s
    }

    fn scenario(steps: Vec<Step>) -> Scenario {
        Scenario {
            scenario_id: "flow".into(),
            version: 1,
            entry_step_id: steps[0].step_id.clone(),
            steps,
        }
    }

    fn ctx<'a>(embedding: Option<&'a [f32]>) -> NavContext<'a> {
        NavContext {
            turn_embedding: embedding,
            recent_turns: &[],
            signal: None,
        }
    }

    fn nav() -> Navigator {
        Navigator::new(NavigatorConfig::default())
    }

    #[tokio::test]
    async fn terminal_without_transitions_exits() {
        let sc = scenario(vec![step("end", vec![])]);
        let session = session_on(&sc, "end");
        let out = nav()
            .navigate(&ctx(None), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        assert_eq!(
            out.decision,
            NavDecision::Exit {
                reason: "terminal".into()
            }
        );
    }

    #[tokio::test]
    async fn non_terminal_without_transitions_continues() {
        let mut dead_end = step("wait", vec![]);
        dead_end.is_terminal = false;
        let sc = scenario(vec![dead_end]);
        let session = session_on(&sc, "wait");
        let out = nav()
            .navigate(&ctx(None), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        assert_eq!(out.decision, NavDecision::Continue { confidence: 1.0 });
    }

    #[tokio::test]
    async fn single_candidate_transitions() {
        let e = vec![1.0, 0.0, 0.0];
        let sc = scenario(vec![
            step("a", vec![transition("b", Some(e.clone()), 0)]),
            step("b", vec![]),
        ]);
        let session = session_on(&sc, "a");
        let out = nav()
            .navigate(&ctx(Some(&e)), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        match out.decision {
            NavDecision::Transition { to_step_id, score } => {
                assert_eq!(to_step_id, "b");
                assert!(score >= 0.99);
            }
            other => panic!("expected transition, got {other:?}"),
        }
        assert!(out.max_score >= 0.99);
    }

    #[tokio::test]
    async fn unconditioned_transition_always_matches() {
        let sc = scenario(vec![
            step("a", vec![transition("b", None, 0)]),
            step("b", vec![]),
        ]);
        let session = session_on(&sc, "a");
        let out = nav()
            .navigate(&ctx(None), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        assert!(matches!(out.decision, NavDecision::Transition { .. }));
    }

    #[tokio::test]
    async fn below_threshold_continues() {
        let cond = vec![1.0, 0.0];
        let turn = vec![0.0, 1.0]; // orthogonal: score 0
        let mut a = step("a", vec![transition("b", Some(cond), 0)]);
        a.is_terminal = false;
        let sc = scenario(vec![a, step("b", vec![])]);
        let session = session_on(&sc, "a");
        let out = nav()
            .navigate(&ctx(Some(&turn)), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        match out.decision {
            NavDecision::Continue { confidence } => {
                assert!((confidence - 1.0).abs() < 1e-6);
            }
            other => panic!("expected continue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ambiguous_candidates_continue_on_margin() {
        // Two transitions with nearly identical scores and equal priority.
        let e1 = vec![1.0, 0.02, 0.0];
        let e2 = vec![1.0, 0.0, 0.02];
        let turn = vec![1.0, 0.01, 0.01];
        let sc = scenario(vec![
            step(
                "a",
                vec![
                    transition("b", Some(e1), 0),
                    transition("c", Some(e2), 0),
                ],
            ),
            step("b", vec![]),
            step("c", vec![]),
        ]);
        let session = session_on(&sc, "a");
        let out = nav()
            .navigate(&ctx(Some(&turn)), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        assert!(
            matches!(out.decision, NavDecision::Continue { .. }),
            "near-tie should be ambiguous: {:?}",
            out.decision
        );
    }

    #[tokio::test]
    async fn priority_breaks_ties() {
        // Same embedding on both transitions; priority must decide, and the
        // margin rule must not fire because scores are compared after the
        // priority sort.
        let e = vec![1.0, 0.0];
        let sc = scenario(vec![
            step(
                "a",
                vec![
                    transition("low", Some(e.clone()), 1),
                    transition("high", Some(e.clone()), 5),
                ],
            ),
            step("low", vec![]),
            step("high", vec![]),
        ]);
        let mut config = NavigatorConfig::default();
        config.min_margin = 0.0;
        config.llm_adjudication = false;
        let session = session_on(&sc, "a");
        let out = Navigator::new(config)
            .navigate(&ctx(Some(&e)), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        match out.decision {
            NavDecision::Transition { to_step_id, .. } => assert_eq!(to_step_id, "high"),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    struct FixedAdjudicator(Adjudication);

    #[async_trait]
    impl Adjudicator for FixedAdjudicator {
        async fn adjudicate(&self, _request: AdjudicationRequest) -> Result<Adjudication> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn adjudicator_choice_wins() {
        let e = vec![1.0, 0.0];
        let sc = scenario(vec![
            step(
                "a",
                vec![
                    transition("b", Some(e.clone()), 0),
                    transition("c", Some(e.clone()), 0),
                ],
            ),
            step("b", vec![]),
            step("c", vec![]),
        ]);
        let session = session_on(&sc, "a");
        let adj = FixedAdjudicator(Adjudication::Choose("c".into()));
        let out = nav()
            .navigate(&ctx(Some(&e)), &sc, &session, &KeywordEmbedder, Some(&adj))
            .await
            .unwrap();
        match out.decision {
            NavDecision::Transition { to_step_id, .. } => assert_eq!(to_step_id, "c"),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uncertain_adjudicator_falls_back_to_tiebreak() {
        let e = vec![1.0, 0.0];
        let sc = scenario(vec![
            step(
                "a",
                vec![
                    transition("b", Some(e.clone()), 9),
                    transition("c", Some(e.clone()), 0),
                ],
            ),
            step("b", vec![]),
            step("c", vec![]),
        ]);
        let mut config = NavigatorConfig::default();
        config.min_margin = 0.0;
        let session = session_on(&sc, "a");
        let adj = FixedAdjudicator(Adjudication::Uncertain);
        let out = Navigator::new(config)
            .navigate(&ctx(Some(&e)), &sc, &session, &KeywordEmbedder, Some(&adj))
            .await
            .unwrap();
        match out.decision {
            NavDecision::Transition { to_step_id, .. } => assert_eq!(to_step_id, "b"),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn loop_guard_suppresses_transition() {
        let e = vec![1.0, 0.0];
        let sc = scenario(vec![
            step("a", vec![transition("b", Some(e.clone()), 0)]),
            step("b", vec![]),
        ]);
        let mut session = session_on(&sc, "a");
        // "b" visited five times in the recent window.
        for i in 0..5 {
            session.push_step(StepHistoryEntry {
                step_id: "b".into(),
                entered_at: Utc::now(),
                turn_number: i,
                reason: "transition".into(),
                confidence: 0.9,
            });
        }
        let out = nav()
            .navigate(&ctx(Some(&e)), &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        assert!(
            matches!(out.decision, NavDecision::Continue { .. }),
            "looping transition must be suppressed: {:?}",
            out.decision
        );
    }

    #[tokio::test]
    async fn exit_signal_overrides() {
        let e = vec![1.0, 0.0];
        let sc = scenario(vec![
            step("a", vec![transition("b", Some(e.clone()), 0)]),
            step("b", vec![]),
        ]);
        let session = session_on(&sc, "a");
        let ctx = NavContext {
            turn_embedding: Some(&e),
            recent_turns: &[],
            signal: Some(ScenarioSignal::Exit),
        };
        let out = nav()
            .navigate(&ctx, &sc, &session, &KeywordEmbedder, None)
            .await
            .unwrap();
        assert_eq!(
            out.decision,
            NavDecision::Exit {
                reason: "signal".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_step_relocalizes() {
        let embedder = KeywordEmbedder;
        let confirm_text = "confirm the return request";
        let mut confirm = step("confirm", vec![]);
        confirm.description = Some(confirm_text.into());
        confirm.reachable_from_anywhere = true;
        let sc = scenario(vec![step("greet", vec![transition("confirm", None, 0)]), confirm]);

        let mut session = session_on(&sc, "greet");
        // Point the session at a step that no longer exists.
        session.enter_step("flow", 1, "ghost", "transition", 0.9);

        let recent = vec![confirm_text.to_string()];
        let ctx = NavContext {
            turn_embedding: None,
            recent_turns: &recent,
            signal: None,
        };
        let out = nav()
            .navigate(&ctx, &sc, &session, &embedder, None)
            .await
            .unwrap();
        match out.decision {
            NavDecision::Relocalize {
                step_id, reason, ..
            } => {
                assert_eq!(step_id, "confirm");
                assert_eq!(reason, "relocalize:step_deleted");
            }
            other => panic!("expected relocalize, got {other:?}"),
        }
    }
}
