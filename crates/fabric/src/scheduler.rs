//! The turn scheduler — the workflow body the orchestrator runs per
//! session key.
//!
//! One invocation: acquire the slot (implicit in the actor), load the
//! session, open a logical turn, aggregate messages until the window
//! closes, run the cognitive pipeline, and commit the session via CAS.
//! Supersede lands here as either a cancel observed mid-pipeline or a
//! cooperative abort returned by the pipeline; both hand the turn's
//! messages to the successor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use ruche_domain::config::Config;
use ruche_domain::error::Error;
use ruche_domain::event::{AcfEvent, EventCategory};
use ruche_domain::session::SessionState;
use ruche_domain::turn::{LogicalTurn, TurnResult, TurnState};
use ruche_orchestrator::{RetryPolicy, SessionMailbox, TurnHandle, TurnWorkflow};
use ruche_scenario::{reconcile_scenario, Embedder, Reconciliation};
use ruche_sessions::identity::IdentityService;
use ruche_sessions::session_key::{parse_session_key, SessionKeyParts};
use ruche_sessions::store::SessionStore;

use crate::config_store::ConfigStore;
use crate::pipeline::{CognitivePipeline, EventScope, ResponseSink, TurnContext};
use crate::router::EventRouter;
use crate::toolbox::{Toolbox, ToolboxHandle};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FabricCore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared collaborators injected at startup. The scheduler and ingress
/// both hang off this.
pub struct FabricCore {
    pub config: Arc<Config>,
    pub sessions: Arc<dyn SessionStore>,
    pub identity: Arc<dyn IdentityService>,
    pub config_store: Arc<dyn ConfigStore>,
    pub router: Arc<EventRouter>,
    pub pipeline: Arc<dyn CognitivePipeline>,
    pub toolbox: Arc<Toolbox>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub response_sink: Arc<dyn ResponseSink>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnScheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnScheduler {
    core: Arc<FabricCore>,
    pipeline_retry: RetryPolicy,
}

impl TurnScheduler {
    pub fn new(core: Arc<FabricCore>) -> Self {
        Self {
            core,
            pipeline_retry: RetryPolicy::new(
                Duration::from_millis(500),
                2.0,
                Duration::from_secs(5),
                5,
            ),
        }
    }

    async fn emit(&self, event: AcfEvent) {
        if let Err(e) = self.core.router.emit(event).await {
            tracing::error!(error = %e, "event emission failed");
        }
    }
}

#[async_trait]
impl TurnWorkflow for TurnScheduler {
    async fn run_turn(&self, mailbox: Arc<SessionMailbox>) {
        let session_key = mailbox.session_key().to_owned();
        let Some(parts) = parse_session_key(&session_key) else {
            tracing::error!(session_key, "malformed session key, draining queue");
            while mailbox.pop().is_some() {}
            return;
        };

        let started = Instant::now();
        let handle = mailbox.begin_turn();
        let scope = EventScope {
            tenant_id: parts.tenant_id,
            agent_id: parts.agent_id,
            interlocutor_id: parts.interlocutor_id,
            session_key: session_key.clone(),
            logical_turn_id: handle.logical_turn_id,
        };

        self.emit(scope.apply(AcfEvent::new(EventCategory::Mutex, "acquired")))
            .await;

        let outcome = self
            .run_turn_inner(&mailbox, &parts, &handle, &scope)
            .await;
        if let Err(e) = outcome {
            tracing::error!(session_key, error = %e, "turn scheduling failed");
            self.emit(scope.apply(
                AcfEvent::new(EventCategory::Turn, "failed")
                    .with_field("error_code", e.code())
                    .with_field("message", e.to_string()),
            ))
            .await;
        }

        self.emit(scope.apply(AcfEvent::new(EventCategory::Mutex, "released")))
            .await;
        self.core
            .router
            .metrics()
            .record_duration_ms("turn.duration", started.elapsed().as_millis() as u64);
        mailbox.finish_turn();
    }
}

impl TurnScheduler {
    async fn run_turn_inner(
        &self,
        mailbox: &Arc<SessionMailbox>,
        parts: &SessionKeyParts,
        handle: &TurnHandle,
        scope: &EventScope,
    ) -> ruche_domain::Result<()> {
        let core = &self.core;
        let session_key = mailbox.session_key();

        // ── 1. Load session state (snapshot v0) ──────────────────────
        let (mut session, is_new) = match core.sessions.get(session_key).await? {
            Some(s) => (s, false),
            None => (
                SessionState::new(
                    session_key,
                    parts.tenant_id,
                    parts.agent_id,
                    parts.interlocutor_id,
                    parts.channel.clone(),
                ),
                true,
            ),
        };
        let v0 = session.version;
        if is_new {
            self.emit(scope.apply(
                AcfEvent::new(EventCategory::Session, "created")
                    .with_field("channel", parts.channel.clone()),
            ))
            .await;
        }

        // ── 2. Open the logical turn and absorb the first message ────
        let mut turn = LogicalTurn::open(handle.logical_turn_id, session_key);
        let Some(first) = mailbox.pop() else {
            // Nothing queued (drained by a prior turn); not an error.
            return Ok(());
        };
        let channel = first.channel.clone();
        self.emit(scope.apply(
            AcfEvent::new(EventCategory::Turn, "started")
                .with_field("channel", channel.clone())
                .with_field("provider_message_id", first.provider_message_id.clone()),
        ))
        .await;
        turn.messages.push(first);
        self.emit(scope.apply(
            AcfEvent::new(EventCategory::Turn, "message_absorbed").with_field("count", 1),
        ))
        .await;

        // ── 3. Aggregate until the window closes ─────────────────────
        let aggregation = &core.config.aggregation;
        let window = Duration::from_millis(aggregation.window_ms(&channel));
        let max_messages = aggregation.max_messages(&channel) as usize;
        let max_bytes = aggregation.max_payload_bytes;

        'aggregate: loop {
            while let Some(message) = mailbox.pop() {
                let explicit_supersede = message
                    .metadata
                    .get("supersede")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                turn.messages.push(message);
                self.emit(scope.apply(
                    AcfEvent::new(EventCategory::Turn, "message_absorbed")
                        .with_field("count", turn.messages.len()),
                ))
                .await;
                if explicit_supersede
                    || turn.messages.len() >= max_messages
                    || turn.payload_bytes() > max_bytes
                {
                    break 'aggregate;
                }
            }
            if turn.messages.len() >= max_messages || turn.payload_bytes() > max_bytes {
                break;
            }
            if !mailbox.wait_message(window).await {
                break;
            }
        }

        // ── 4. Transition to running ─────────────────────────────────
        mailbox.mark_running();
        turn.state = TurnState::Running;

        let turn_text = turn
            .messages
            .iter()
            .filter_map(|m| m.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        let turn_embedding = match &core.embedder {
            Some(embedder) if !turn_text.is_empty() => {
                match embedder.embed(&turn_text).await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(error = %e, "turn embedding failed");
                        None
                    }
                }
            }
            _ => None,
        };

        // ── 5. Scenario reconciliation at the turn boundary ──────────
        let (scenario, gap_hints) = self
            .reconcile(&mut session, parts, turn_embedding.as_deref())
            .await;

        // ── 6. Build the frozen context ──────────────────────────────
        let toolbox = Arc::new(ToolboxHandle::new(
            core.toolbox.clone(),
            core.router.clone(),
            handle.clone(),
            scope.clone(),
        ));
        let has_pending: Arc<dyn Fn() -> bool + Send + Sync> = {
            let mailbox = mailbox.clone();
            Arc::new(move || mailbox.has_pending())
        };
        let ctx = TurnContext {
            logical_turn_id: handle.logical_turn_id,
            session_key: session_key.to_owned(),
            messages: turn.messages.clone(),
            session: session.clone(),
            scenario,
            gap_hints,
            turn_embedding,
            toolbox: toolbox.clone(),
            router: core.router.clone(),
            scope: scope.clone(),
            has_pending,
            cancel: handle.cancel_token(),
        };

        // ── 7. Invoke the pipeline (bounded retries) ─────────────────
        let pipeline_outcome = self.invoke_pipeline(&ctx, handle).await;

        // ── 8. Resolve the turn ──────────────────────────────────────
        turn.attempted_tools = toolbox.attempts();
        let cancelled = handle.is_cancelled() && !handle.commit_reached();
        match pipeline_outcome {
            Ok(result) if result.abort || cancelled => {
                self.supersede(mailbox, scope, turn).await;
            }
            Err(_) if cancelled => {
                self.supersede(mailbox, scope, turn).await;
            }
            Ok(result) => {
                self.commit(scope, handle, turn, result, v0).await;
            }
            Err(err) => {
                turn.state = TurnState::Failed;
                if matches!(err, Error::Enforcement(_)) {
                    self.emit(scope.apply(
                        AcfEvent::new(EventCategory::Enforcement, "violation")
                            .with_field("message", err.to_string()),
                    ))
                    .await;
                }
                self.emit(scope.apply(
                    AcfEvent::new(EventCategory::Turn, "failed")
                        .with_field("error_code", err.code())
                        .with_field("message", err.to_string()),
                ))
                .await;
                self.core.router.metrics().incr("turns.failed");
            }
        }
        Ok(())
    }

    /// Pipeline invocation with the brain/total timeout envelopes and
    /// retries for retryable errors while no irreversible tool has fired.
    async fn invoke_pipeline(
        &self,
        ctx: &TurnContext,
        handle: &TurnHandle,
    ) -> ruche_domain::Result<TurnResult> {
        let timeouts = &self.core.config.timeouts;
        let brain = Duration::from_millis(timeouts.brain_ms);
        let deadline = Instant::now() + Duration::from_millis(timeouts.total_ms);

        let mut attempt = 1u32;
        loop {
            let err = match tokio::time::timeout(brain, self.core.pipeline.run(ctx)).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => e,
                Err(_) => Error::Timeout("cognitive pipeline".into()),
            };

            if handle.is_cancelled() {
                return Err(err);
            }
            if !err.is_retryable() || handle.commit_reached() {
                return Err(err);
            }
            let Some(backoff) = self.pipeline_retry.delay(attempt) else {
                return Err(err);
            };
            if Instant::now() + backoff + brain > deadline {
                return Err(Error::Timeout(format!(
                    "turn budget exhausted after {attempt} attempt(s): {err}"
                )));
            }
            tracing::warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "pipeline attempt failed, retrying"
            );
            self.core.router.metrics().incr("turns.retried");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Mark the turn superseded and hand its messages to the successor.
    async fn supersede(
        &self,
        mailbox: &Arc<SessionMailbox>,
        scope: &EventScope,
        mut turn: LogicalTurn,
    ) {
        turn.state = TurnState::Superseded;
        let successor = mailbox.next_turn_id();
        self.emit(scope.apply(
            AcfEvent::new(EventCategory::Supersede, "executed")
                .with_field("successor_logical_turn_id", successor.to_string()),
        ))
        .await;
        self.emit(scope.apply(
            AcfEvent::new(EventCategory::Turn, "superseded")
                .with_field("successor_logical_turn_id", successor.to_string())
                .with_field("messages_carried", turn.messages.len()),
        ))
        .await;
        self.core.router.metrics().incr("turns.superseded");
        mailbox.requeue_front(std::mem::take(&mut turn.messages));
    }

    /// CAS-commit the pipeline's session state and deliver the response.
    async fn commit(
        &self,
        scope: &EventScope,
        handle: &TurnHandle,
        mut turn: LogicalTurn,
        result: TurnResult,
        v0: u64,
    ) {
        let mut new_state = result.session;
        new_state.record_turn(Utc::now());

        match self.core.sessions.put_cas(v0, new_state).await {
            Ok(stored) => {
                turn.state = TurnState::Committed;
                turn.commit_reached = handle.commit_reached();
                self.emit(scope.apply(
                    AcfEvent::new(EventCategory::Turn, "completed")
                        .with_field("segments", result.segments.len())
                        .with_field("session_version", stored.version)
                        .with_field("commit_reached", turn.commit_reached)
                        .with_field("messages", turn.messages.len()),
                ))
                .await;
                self.core
                    .response_sink
                    .deliver(&scope.session_key, scope.logical_turn_id, &result.segments)
                    .await;
                self.core.router.metrics().incr("turns.completed");
            }
            Err(e) => {
                // The orchestrator serializes writers per key, so a CAS miss
                // here is an internal conflict, fatal for the turn.
                turn.state = TurnState::Failed;
                tracing::error!(
                    session_key = %scope.session_key,
                    error = %e,
                    "session CAS failed"
                );
                self.emit(scope.apply(
                    AcfEvent::new(EventCategory::Turn, "failed")
                        .with_field("error_code", "INTERNAL_CONFLICT")
                        .with_field("message", e.to_string()),
                ))
                .await;
                self.core.router.metrics().incr("turns.failed");
            }
        }
    }

    /// Apply scenario-version reconciliation and the gap-fill pass.
    /// Returns the scenario graph to hand to the pipeline.
    async fn reconcile(
        &self,
        session: &mut SessionState,
        parts: &SessionKeyParts,
        turn_embedding: Option<&[f32]>,
    ) -> (Option<Arc<ruche_domain::scenario::Scenario>>, Vec<String>) {
        let Some(active) = session.scenario.clone() else {
            return (None, Vec::new());
        };
        let core = &self.core;

        let latest = match core
            .config_store
            .latest_scenario(parts.tenant_id, parts.agent_id, &active.scenario_id)
            .await
        {
            Ok(Some(s)) => s,
            Ok(None) => {
                // The scenario disappeared entirely: exit rather than fail.
                tracing::warn!(
                    scenario_id = %active.scenario_id,
                    "active scenario no longer published, exiting"
                );
                session.exit_scenario();
                return (None, Vec::new());
            }
            Err(e) => {
                tracing::warn!(error = %e, "config store unavailable, continuing without reconciliation");
                return (None, Vec::new());
            }
        };

        if latest.version == active.version {
            return (Some(latest), Vec::new());
        }

        let old = core
            .config_store
            .scenario_version(
                parts.tenant_id,
                parts.agent_id,
                &active.scenario_id,
                active.version,
            )
            .await
            .ok()
            .flatten();
        let report = reconcile_scenario(
            old.as_deref(),
            &latest,
            session,
            turn_embedding,
            core.config.scenario_navigator.transition_threshold,
        );

        match report.outcome {
            Reconciliation::UpToDate => {}
            Reconciliation::Kept { new_version } => {
                if let Some(active) = session.scenario.as_mut() {
                    active.version = new_version;
                }
            }
            Reconciliation::StepDeleted => {
                // Leave the stale step in place; the navigator's consistency
                // stage re-localizes on it this turn.
                tracing::info!(
                    scenario_id = %active.scenario_id,
                    step_id = %active.step_id,
                    "active step deleted by scenario update"
                );
            }
            Reconciliation::Jump {
                to_step_id,
                new_version,
            } => {
                session.enter_step(
                    &active.scenario_id,
                    new_version,
                    &to_step_id,
                    "scenario_update:fork",
                    1.0,
                );
            }
        }

        // Gap-fill: backfill what the identity profile knows, hint the rest.
        let mut hints = Vec::new();
        for gap in report.gaps {
            let filled = match gap.as_str() {
                "phone" | "email" => {
                    match core
                        .identity
                        .get(parts.tenant_id, parts.agent_id, parts.interlocutor_id)
                        .await
                    {
                        Ok(Some(interlocutor)) => {
                            let value = if gap == "phone" {
                                interlocutor.phone
                            } else {
                                interlocutor.email
                            };
                            match value {
                                Some(v) => {
                                    session.variables.insert(gap.clone(), Value::String(v));
                                    true
                                }
                                None => false,
                            }
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            if !filled {
                hints.push(gap);
            }
        }
        (Some(latest), hints)
    }
}
