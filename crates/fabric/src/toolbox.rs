//! Toolbox — tool execution with declared side-effect policies.
//!
//! Every execution emits `tool.authorized` then `tool.executed` or
//! `tool.failed`. A successful `irreversible` tool flips the turn's commit
//! flag and emits `commit.reached`. Retries exist only for `none` and
//! `reversible` tools; an irreversible attempt is never repeated under the
//! same idempotency key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde_json::Value;

use ruche_domain::error::{Error, Result};
use ruche_domain::event::{AcfEvent, EventCategory};
use ruche_domain::turn::{AttemptedTool, SideEffectPolicy, ToolAttemptStatus};
use ruche_orchestrator::TurnHandle;

use crate::pipeline::EventScope;
use crate::router::EventRouter;

/// Extra attempts allowed for `none`/`reversible` tools.
const REVERSIBLE_RETRIES: u32 = 2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contracts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: &Value) -> Result<Value>;
}

pub struct ToolRegistration {
    pub tool_id: String,
    pub side_effect_policy: SideEffectPolicy,
    pub executor: Arc<dyn ToolExecutor>,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_id: String,
    pub output: Value,
    /// Whether this result was replayed from the idempotency cache.
    pub replayed: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Toolbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Toolbox {
    tools: RwLock<HashMap<String, Arc<ToolRegistration>>>,
    /// Completed irreversible executions: `(tool_id, idempotency_key)` →
    /// output. Replay returns the cached output without re-executing.
    completed: Mutex<HashMap<(String, String), Value>>,
    tool_timeout: Duration,
}

impl Toolbox {
    pub fn new(tool_timeout_ms: u64) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            tool_timeout: Duration::from_millis(tool_timeout_ms),
        }
    }

    pub fn register(&self, registration: ToolRegistration) {
        self.tools
            .write()
            .insert(registration.tool_id.clone(), Arc::new(registration));
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<ToolRegistration>> {
        self.tools.read().get(tool_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    fn cached(&self, tool_id: &str, idempotency_key: &str) -> Option<Value> {
        self.completed
            .lock()
            .get(&(tool_id.to_owned(), idempotency_key.to_owned()))
            .cloned()
    }

    fn remember(&self, tool_id: &str, idempotency_key: &str, output: Value) {
        self.completed
            .lock()
            .insert((tool_id.to_owned(), idempotency_key.to_owned()), output);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-turn handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool execution bound to one logical turn: stamps events with the turn's
/// identity, flips the commit flag, and records attempts.
pub struct ToolboxHandle {
    toolbox: Arc<Toolbox>,
    router: Arc<EventRouter>,
    turn: TurnHandle,
    scope: EventScope,
    attempts: Mutex<Vec<AttemptedTool>>,
}

impl ToolboxHandle {
    pub fn new(
        toolbox: Arc<Toolbox>,
        router: Arc<EventRouter>,
        turn: TurnHandle,
        scope: EventScope,
    ) -> Self {
        Self {
            toolbox,
            router,
            turn,
            scope,
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Attempts recorded so far, for the LogicalTurn record.
    pub fn attempts(&self) -> Vec<AttemptedTool> {
        self.attempts.lock().clone()
    }

    pub async fn execute(
        &self,
        tool_id: &str,
        args: Value,
        idempotency_key: &str,
    ) -> Result<ToolResult> {
        let registration = self
            .toolbox
            .get(tool_id)
            .ok_or_else(|| Error::NotFound(format!("tool {tool_id}")))?;
        let policy = registration.side_effect_policy;

        self.emit(
            EventCategory::Tool,
            "authorized",
            serde_json::json!({
                "tool_id": tool_id,
                "side_effect_policy": policy,
                "idempotency_key": idempotency_key,
            }),
        )
        .await?;
        self.record(tool_id, policy, idempotency_key, ToolAttemptStatus::Authorized);

        // Idempotent replay: the side effect already happened under this key.
        if policy == SideEffectPolicy::Irreversible {
            if let Some(output) = self.toolbox.cached(tool_id, idempotency_key) {
                self.record(tool_id, policy, idempotency_key, ToolAttemptStatus::Executed);
                self.turn.mark_commit_reached();
                self.emit(
                    EventCategory::Tool,
                    "executed",
                    serde_json::json!({
                        "tool_id": tool_id,
                        "replayed": true,
                    }),
                )
                .await?;
                self.emit(
                    EventCategory::Commit,
                    "reached",
                    serde_json::json!({
                        "tool_id": tool_id,
                        "idempotency_key": idempotency_key,
                        "replayed": true,
                    }),
                )
                .await?;
                return Ok(ToolResult {
                    tool_id: tool_id.to_owned(),
                    output,
                    replayed: true,
                });
            }
        }

        let max_attempts = match policy {
            SideEffectPolicy::Irreversible => 1,
            SideEffectPolicy::None | SideEffectPolicy::Reversible => 1 + REVERSIBLE_RETRIES,
        };

        let mut last_err: Option<Error> = None;
        for attempt in 1..=max_attempts {
            let run = tokio::time::timeout(
                self.toolbox.tool_timeout,
                registration.executor.execute(&args),
            )
            .await;
            match run {
                Ok(Ok(output)) => {
                    self.record(tool_id, policy, idempotency_key, ToolAttemptStatus::Executed);
                    self.emit(
                        EventCategory::Tool,
                        "executed",
                        serde_json::json!({
                            "tool_id": tool_id,
                            "attempt": attempt,
                        }),
                    )
                    .await?;
                    if policy == SideEffectPolicy::Irreversible {
                        self.toolbox.remember(tool_id, idempotency_key, output.clone());
                        self.turn.mark_commit_reached();
                        self.emit(
                            EventCategory::Commit,
                            "reached",
                            serde_json::json!({
                                "tool_id": tool_id,
                                "idempotency_key": idempotency_key,
                            }),
                        )
                        .await?;
                    }
                    return Ok(ToolResult {
                        tool_id: tool_id.to_owned(),
                        output,
                        replayed: false,
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(tool_id, attempt, error = %e, "tool execution failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    tracing::warn!(tool_id, attempt, "tool execution timed out");
                    last_err = Some(Error::Timeout(format!("tool {tool_id}")));
                }
            }
        }

        let err = last_err.unwrap_or_else(|| Error::Other("tool failed".into()));
        self.record(tool_id, policy, idempotency_key, ToolAttemptStatus::Failed);
        self.emit(
            EventCategory::Tool,
            "failed",
            serde_json::json!({
                "tool_id": tool_id,
                "error": err.to_string(),
                "error_code": err.code(),
            }),
        )
        .await?;
        Err(err)
    }

    fn record(
        &self,
        tool_id: &str,
        policy: SideEffectPolicy,
        idempotency_key: &str,
        status: ToolAttemptStatus,
    ) {
        let mut attempts = self.attempts.lock();
        // Upgrade the authorized record in place rather than duplicating.
        if status != ToolAttemptStatus::Authorized {
            if let Some(existing) = attempts.iter_mut().rev().find(|a| {
                a.tool_id == tool_id
                    && a.idempotency_key == idempotency_key
                    && a.status == ToolAttemptStatus::Authorized
            }) {
                existing.status = status;
                return;
            }
        }
        attempts.push(AttemptedTool {
            tool_id: tool_id.to_owned(),
            side_effect_policy: policy,
            idempotency_key: idempotency_key.to_owned(),
            status,
        });
    }

    async fn emit(&self, category: EventCategory, name: &str, payload: Value) -> Result<()> {
        let mut event = self.scope.apply(AcfEvent::new(category, name));
        if let Value::Object(map) = payload {
            event.payload = map;
        }
        self.router.emit(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditStore, LocalAuditStore};
    use crate::metrics::MetricsSink;
    use ruche_orchestrator::SessionMailbox;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct FlakyTool {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ToolExecutor for FlakyTool {
        async fn execute(&self, _args: &Value) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(Error::Provider {
                    provider: "stub".into(),
                    message: "transient".into(),
                })
            } else {
                Ok(serde_json::json!({ "call": call }))
            }
        }
    }

    fn handle_with(
        fail_first: u32,
        policy: SideEffectPolicy,
    ) -> (ToolboxHandle, TurnHandle, Arc<LocalAuditStore>, Arc<Toolbox>) {
        let audit = Arc::new(LocalAuditStore::in_memory());
        let router = Arc::new(EventRouter::new(
            audit.clone(),
            Arc::new(MetricsSink::new()),
            None,
            Default::default(),
        ));
        let toolbox = Arc::new(Toolbox::new(1_000));
        toolbox.register(ToolRegistration {
            tool_id: "t".into(),
            side_effect_policy: policy,
            executor: Arc::new(FlakyTool {
                calls: AtomicU32::new(0),
                fail_first,
            }),
        });
        let mailbox = SessionMailbox::new("sess:k");
        let turn = mailbox.begin_turn();
        let scope = EventScope {
            tenant_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            interlocutor_id: Uuid::new_v4(),
            session_key: "sess:k".into(),
            logical_turn_id: turn.logical_turn_id,
        };
        (
            ToolboxHandle::new(toolbox.clone(), router, turn.clone(), scope),
            turn,
            audit,
            toolbox,
        )
    }

    #[tokio::test]
    async fn reversible_tool_retries_transient_failures() {
        let (handle, turn, _, _) = handle_with(1, SideEffectPolicy::Reversible);
        let result = handle.execute("t", Value::Null, "k1").await.unwrap();
        assert_eq!(result.output["call"], 2);
        assert!(!turn.commit_reached());
    }

    #[tokio::test]
    async fn irreversible_success_reaches_commit() {
        let (handle, turn, audit, _) = handle_with(0, SideEffectPolicy::Irreversible);
        handle.execute("t", Value::Null, "k1").await.unwrap();
        assert!(turn.commit_reached());

        let events = audit
            .events_for_turn(turn.logical_turn_id)
            .await
            .unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["tool.authorized", "tool.executed", "commit.reached"]
        );
    }

    #[tokio::test]
    async fn irreversible_tool_never_retries() {
        let (handle, turn, audit, _) = handle_with(1, SideEffectPolicy::Irreversible);
        let err = handle.execute("t", Value::Null, "k1").await.unwrap_err();
        assert!(err.is_retryable()); // the error class is retryable...
        assert!(!turn.commit_reached()); // ...but no commit happened

        let events = audit
            .events_for_turn(turn.logical_turn_id)
            .await
            .unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        // Exactly one execution attempt: authorized then failed.
        assert_eq!(types, vec!["tool.authorized", "tool.failed"]);
    }

    #[tokio::test]
    async fn idempotent_replay_returns_cached_output() {
        let (handle, _, _, toolbox) = handle_with(0, SideEffectPolicy::Irreversible);
        let first = handle.execute("t", Value::Null, "key-a").await.unwrap();
        assert!(!first.replayed);

        // Second turn, same idempotency key: replay without execution.
        let audit = Arc::new(LocalAuditStore::in_memory());
        let router = Arc::new(EventRouter::new(
            audit,
            Arc::new(MetricsSink::new()),
            None,
            Default::default(),
        ));
        let mailbox = SessionMailbox::new("sess:k2");
        let turn = mailbox.begin_turn();
        let scope = EventScope {
            tenant_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            interlocutor_id: Uuid::new_v4(),
            session_key: "sess:k2".into(),
            logical_turn_id: turn.logical_turn_id,
        };
        let handle2 = ToolboxHandle::new(toolbox, router, turn.clone(), scope);
        let second = handle2.execute("t", Value::Null, "key-a").await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.output, first.output);
        assert!(turn.commit_reached());
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let (handle, _, _, _) = handle_with(0, SideEffectPolicy::None);
        let err = handle.execute("ghost", Value::Null, "k").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn attempts_recorded_for_turn() {
        let (handle, _, _, _) = handle_with(0, SideEffectPolicy::Reversible);
        handle.execute("t", Value::Null, "k1").await.unwrap();
        let attempts = handle.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, ToolAttemptStatus::Executed);
        assert_eq!(attempts[0].idempotency_key, "k1");
    }
}
