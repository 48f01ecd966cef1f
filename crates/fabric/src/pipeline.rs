//! Cognitive-pipeline contract and the per-turn context handed to it.
//!
//! The pipeline is an external collaborator: it receives a frozen
//! [`TurnContext`], may call tools through the toolbox handle, checks
//! `has_pending_messages()` before irreversible work, and hands back a
//! [`TurnResult`]. The [`EchoPipeline`] here is the deterministic reference
//! implementation used by the default wiring and the tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use ruche_domain::envelope::{RawMessage, ResponseSegment};
use ruche_domain::error::Result;
use ruche_domain::event::{AcfEvent, EventCategory};
use ruche_domain::scenario::Scenario;
use ruche_domain::session::SessionState;
use ruche_domain::turn::TurnResult;
use ruche_orchestrator::CancelToken;
use ruche_scenario::{
    Adjudicator, Embedder, NavContext, NavDecision, Navigator, ScenarioSignal,
};

use crate::router::EventRouter;
use crate::toolbox::ToolboxHandle;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event scoping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identity fields stamped onto every event a turn emits.
#[derive(Debug, Clone)]
pub struct EventScope {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub interlocutor_id: Uuid,
    pub session_key: String,
    pub logical_turn_id: Uuid,
}

impl EventScope {
    pub fn apply(&self, event: AcfEvent) -> AcfEvent {
        event
            .with_scope(self.tenant_id, self.agent_id)
            .with_interlocutor(self.interlocutor_id)
            .with_session(self.session_key.clone())
            .with_turn(self.logical_turn_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one pipeline invocation sees. Messages and the session
/// snapshot are frozen; the only upward callback is `emit`.
pub struct TurnContext {
    pub logical_turn_id: Uuid,
    pub session_key: String,
    /// Aggregated messages in arrival order.
    pub messages: Vec<RawMessage>,
    /// Session snapshot at turn entry (version `v0` for the CAS commit).
    pub session: SessionState,
    /// Reconciled scenario graph, when the session has an active scenario.
    pub scenario: Option<Arc<Scenario>>,
    /// Variables newly required by a scenario update but missing from the
    /// session; the pipeline should re-ask or backfill.
    pub gap_hints: Vec<String>,
    /// Embedding of the aggregated turn text, when an embedder is wired.
    pub turn_embedding: Option<Vec<f32>>,
    pub(crate) toolbox: Arc<ToolboxHandle>,
    pub(crate) router: Arc<EventRouter>,
    pub(crate) scope: EventScope,
    pub(crate) has_pending: Arc<dyn Fn() -> bool + Send + Sync>,
    pub(crate) cancel: CancelToken,
}

impl TurnContext {
    /// Whether fresh messages have queued behind this turn. Pipelines call
    /// this before entering an irreversible commit phase.
    pub fn has_pending_messages(&self) -> bool {
        (self.has_pending)()
    }

    /// Whether a supersede-cancel has been requested for this turn.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tool execution scoped to this turn (events, commit point, attempts).
    pub fn toolbox(&self) -> &ToolboxHandle {
        &self.toolbox
    }

    /// Emit a custom event through the router, stamped with this turn's
    /// identity. Failures are logged, never surfaced to the pipeline.
    pub async fn emit(&self, category: EventCategory, name: &str, payload: Value) {
        let mut event = self.scope.apply(AcfEvent::new(category, name));
        if let Value::Object(map) = payload {
            event.payload = map;
        }
        if let Err(e) = self.router.emit(event).await {
            tracing::warn!(error = %e, "pipeline event emission failed");
        }
    }

    /// The turn's text, messages joined in arrival order.
    pub fn aggregated_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn channel(&self) -> &str {
        self.messages
            .first()
            .map(|m| m.channel.as_str())
            .unwrap_or("unknown")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait CognitivePipeline: Send + Sync {
    async fn run(&self, ctx: &TurnContext) -> Result<TurnResult>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Channel-adapter seam: committed turns hand their segments here for
/// outbound delivery.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn deliver(
        &self,
        session_key: &str,
        logical_turn_id: Uuid,
        segments: &[ResponseSegment],
    );
}

/// Default sink: logs the response. Connectors consume `turn.completed`
/// from the live stream or register their own sink.
pub struct TracingResponseSink;

#[async_trait]
impl ResponseSink for TracingResponseSink {
    async fn deliver(
        &self,
        session_key: &str,
        logical_turn_id: Uuid,
        segments: &[ResponseSegment],
    ) {
        tracing::info!(
            session_key,
            %logical_turn_id,
            segments = segments.len(),
            "response ready"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EchoPipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic reference pipeline: navigates the active scenario (when
/// any), then echoes the turn text. With `yield_to_pending` it aborts
/// cooperatively when fresh messages are waiting, exercising the queue-policy
/// supersede path.
pub struct EchoPipeline {
    navigator: Navigator,
    embedder: Option<Arc<dyn Embedder>>,
    adjudicator: Option<Arc<dyn Adjudicator>>,
    yield_to_pending: bool,
    sanity_threshold: f32,
}

impl EchoPipeline {
    pub fn new(navigator: Navigator, sanity_threshold: f32) -> Self {
        Self {
            navigator,
            embedder: None,
            adjudicator: None,
            yield_to_pending: false,
            sanity_threshold,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_adjudicator(mut self, adjudicator: Arc<dyn Adjudicator>) -> Self {
        self.adjudicator = Some(adjudicator);
        self
    }

    /// Abort cooperatively when messages are pending behind the turn.
    pub fn with_yield_to_pending(mut self, yield_to_pending: bool) -> Self {
        self.yield_to_pending = yield_to_pending;
        self
    }

    async fn navigate(&self, ctx: &TurnContext, session: &mut SessionState) -> Result<()> {
        let Some(scenario) = &ctx.scenario else {
            return Ok(());
        };
        if session.scenario.is_none() {
            return Ok(());
        }
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };

        let recent: Vec<String> = ctx
            .messages
            .iter()
            .filter_map(|m| m.text.clone())
            .collect();
        let signal = parse_signal(ctx);
        let nav_ctx = NavContext {
            turn_embedding: ctx.turn_embedding.as_deref(),
            recent_turns: &recent,
            signal,
        };
        let outcome = self
            .navigator
            .navigate(
                &nav_ctx,
                scenario,
                session,
                embedder.as_ref(),
                self.adjudicator.as_deref(),
            )
            .await?;

        // Streak bookkeeping feeds the re-localization trigger.
        if outcome.max_score < self.sanity_threshold {
            session.low_confidence_streak += 1;
        } else {
            session.low_confidence_streak = 0;
        }

        match outcome.decision {
            NavDecision::Continue { .. } => {}
            NavDecision::Transition { to_step_id, score } => {
                session.enter_step(
                    &scenario.scenario_id,
                    scenario.version,
                    &to_step_id,
                    "transition",
                    score,
                );
            }
            NavDecision::Relocalize {
                step_id,
                score,
                reason,
            } => {
                session.relocalization_count += 1;
                session.low_confidence_streak = 0;
                session.enter_step(
                    &scenario.scenario_id,
                    scenario.version,
                    &step_id,
                    &reason,
                    score,
                );
            }
            NavDecision::Exit { reason } => {
                tracing::info!(
                    scenario_id = %scenario.scenario_id,
                    reason = %reason,
                    "scenario exit"
                );
                session.exit_scenario();
            }
        }
        Ok(())
    }
}

/// Surface an explicit navigation signal from message metadata.
fn parse_signal(ctx: &TurnContext) -> Option<ScenarioSignal> {
    ctx.messages.iter().rev().find_map(|m| {
        match m.metadata.get("scenario_signal").and_then(Value::as_str) {
            Some("exit") => Some(ScenarioSignal::Exit),
            Some("wrong_step") => Some(ScenarioSignal::WrongStep),
            _ => None,
        }
    })
}

#[async_trait]
impl CognitivePipeline for EchoPipeline {
    async fn run(&self, ctx: &TurnContext) -> Result<TurnResult> {
        let mut session = ctx.session.clone();

        if self.yield_to_pending && ctx.has_pending_messages() {
            return Ok(TurnResult::abort(session));
        }
        if ctx.is_cancelled() {
            return Ok(TurnResult::abort(session));
        }

        self.navigate(ctx, &mut session).await?;

        let text = ctx.aggregated_text();
        let reply = if text.is_empty() {
            "received".to_owned()
        } else {
            text
        };
        Ok(TurnResult::respond(
            session,
            vec![ResponseSegment::text(reply)],
        ))
    }
}
