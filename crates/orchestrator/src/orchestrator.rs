//! The session orchestrator — signal dispatch, actor lifecycle, and
//! supersede arbitration.
//!
//! `signal()` enqueues a message for a session key and guarantees an actor
//! task is draining that key. At most one actor exists per key, and the
//! actor runs exactly one turn at a time, so the session-singleness
//! invariant holds without any lock around the turn body itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use ruche_domain::config::ConcurrencyStrategy;
use ruche_domain::envelope::RawMessage;

use crate::mailbox::{SessionMailbox, TurnPhase};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The turn-workflow body registered with the orchestrator. One invocation
/// consumes one logical turn's worth of messages from the mailbox.
#[async_trait]
pub trait TurnWorkflow: Send + Sync + 'static {
    async fn run_turn(&self, mailbox: Arc<SessionMailbox>);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signal outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersedeDecision {
    /// Queue policy: the running turn completes, the message waits.
    Queued,
    /// Cancel-in-progress granted (commit point not reached).
    Allow,
    /// Cancel refused: the running turn already committed side effects.
    Deny,
}

impl SupersedeDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// What happened to a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// No turn in flight; the message will open (or join) the next turn.
    Queued { logical_turn_id: Uuid },
    /// Absorbed into the currently accumulating turn.
    Absorbed { logical_turn_id: Uuid },
    /// Arrived while a turn was running: a supersede request.
    Supersede {
        running_turn_id: Uuid,
        next_turn_id: Uuid,
        decision: SupersedeDecision,
    },
}

impl SignalOutcome {
    /// The logical turn the message is expected to land in.
    pub fn logical_turn_id(&self) -> Uuid {
        match self {
            Self::Queued { logical_turn_id } | Self::Absorbed { logical_turn_id } => {
                *logical_turn_id
            }
            Self::Supersede { next_turn_id, .. } => *next_turn_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionOrchestrator {
    workflow: Arc<dyn TurnWorkflow>,
    mailboxes: Mutex<HashMap<String, Arc<SessionMailbox>>>,
}

impl SessionOrchestrator {
    pub fn new(workflow: Arc<dyn TurnWorkflow>) -> Arc<Self> {
        Arc::new(Self {
            workflow,
            mailboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a message for its session and arbitrate supersede against
    /// any in-flight turn. Always accepts; the mailbox absorbs bursts.
    pub fn signal(
        self: &Arc<Self>,
        session_key: &str,
        message: RawMessage,
        strategy: ConcurrencyStrategy,
    ) -> SignalOutcome {
        let mailbox = {
            let mut mailboxes = self.mailboxes.lock();
            mailboxes
                .entry(session_key.to_owned())
                .or_insert_with(|| Arc::new(SessionMailbox::new(session_key)))
                .clone()
        };

        let (outcome, spawn_actor) = mailbox.with_inner(|inner| {
            inner.enqueue(message);

            let outcome = match inner.active() {
                None => SignalOutcome::Queued {
                    logical_turn_id: inner.pending_turn_id(),
                },
                Some((turn_id, TurnPhase::Accumulating, _)) => SignalOutcome::Absorbed {
                    logical_turn_id: turn_id,
                },
                Some((turn_id, TurnPhase::Running, handle)) => {
                    let decision = match strategy {
                        ConcurrencyStrategy::GroupRoundRobin => SupersedeDecision::Queued,
                        ConcurrencyStrategy::CancelInProgress => {
                            if handle.commit_reached() {
                                SupersedeDecision::Deny
                            } else {
                                handle.cancel_token().cancel();
                                SupersedeDecision::Allow
                            }
                        }
                    };
                    SignalOutcome::Supersede {
                        running_turn_id: turn_id,
                        next_turn_id: inner.pending_turn_id(),
                        decision,
                    }
                }
            };

            let spawn = !inner.actor_running();
            if spawn {
                inner.set_actor_running(true);
            }
            (outcome, spawn)
        });

        mailbox.notify_message();

        if spawn_actor {
            let workflow = self.workflow.clone();
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                actor_loop(workflow, mailbox).await;
            });
        }

        outcome
    }

    /// Mailbox lookup for introspection (pending counts, queue age).
    pub fn mailbox(&self, session_key: &str) -> Option<Arc<SessionMailbox>> {
        self.mailboxes.lock().get(session_key).cloned()
    }

    /// Number of session keys the orchestrator has seen.
    pub fn session_count(&self) -> usize {
        self.mailboxes.lock().len()
    }

    /// Drop mailboxes that are fully idle (no actor, nothing queued).
    pub fn prune_idle(&self) {
        let mut mailboxes = self.mailboxes.lock();
        mailboxes.retain(|_, mb| {
            mb.with_inner(|inner| inner.actor_running() || !inner.queue_is_empty())
        });
    }
}

/// Actor body: run turns while messages remain, then retire.
async fn actor_loop(workflow: Arc<dyn TurnWorkflow>, mailbox: Arc<SessionMailbox>) {
    tracing::debug!(session_key = %mailbox.session_key(), "session actor started");
    loop {
        workflow.run_turn(mailbox.clone()).await;

        // Retire when the queue is drained; re-check under the lock so a
        // concurrent signal either sees actor_running=true or we loop again.
        let retire = mailbox.with_inner(|inner| {
            if inner.queue_is_empty() {
                inner.set_actor_running(false);
                true
            } else {
                false
            }
        });
        if retire {
            break;
        }
    }
    tracing::debug!(session_key = %mailbox.session_key(), "session actor retired");
}
