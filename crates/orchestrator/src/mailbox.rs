//! Per-session mailbox — the queued-signal side of the workflow group.
//!
//! Signals (normalized messages) enqueue here in arrival order. The actor
//! pops them while aggregating; messages arriving after the turn goes
//! `running` stay queued for the successor turn. The mailbox pre-allocates
//! the successor's logical turn id so the ingress can answer with the id a
//! message will land in before the turn exists.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use ruche_domain::envelope::RawMessage;

use crate::cancel::CancelToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Accumulating,
    Running,
}

/// Shared view of the in-flight turn, held by both the workflow body and
/// the mailbox (so supersede decisions can read the commit flag).
#[derive(Clone)]
pub struct TurnHandle {
    pub logical_turn_id: Uuid,
    cancel: CancelToken,
    commit_reached: Arc<AtomicBool>,
}

impl TurnHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Record the commit point. From here on supersede-cancel is refused.
    pub fn mark_commit_reached(&self) {
        self.commit_reached.store(true, Ordering::Release);
    }

    pub fn commit_reached(&self) -> bool {
        self.commit_reached.load(Ordering::Acquire)
    }
}

struct ActiveTurn {
    handle: TurnHandle,
    phase: TurnPhase,
}

struct QueuedMessage {
    message: RawMessage,
    enqueued_at: Instant,
}

struct Inner {
    queue: VecDeque<QueuedMessage>,
    /// Turn id the next opened turn will take.
    pending_turn_id: Uuid,
    active: Option<ActiveTurn>,
    actor_running: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mailbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionMailbox {
    session_key: String,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl SessionMailbox {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                pending_turn_id: Uuid::new_v4(),
                active: None,
                actor_running: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    // ── Signal side (called by the orchestrator) ─────────────────────

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut InnerView<'_>) -> R) -> R {
        let mut inner = self.inner.lock();
        let mut view = InnerView { inner: &mut inner };
        let out = f(&mut view);
        drop(inner);
        out
    }

    pub(crate) fn notify_message(&self) {
        self.notify.notify_one();
    }

    // ── Workflow side ────────────────────────────────────────────────

    /// Open a turn: consume the pre-allocated id, mint the successor's, and
    /// install the active-turn record.
    pub fn begin_turn(&self) -> TurnHandle {
        let mut inner = self.inner.lock();
        let handle = TurnHandle {
            logical_turn_id: inner.pending_turn_id,
            cancel: CancelToken::new(),
            commit_reached: Arc::new(AtomicBool::new(false)),
        };
        inner.pending_turn_id = Uuid::new_v4();
        inner.active = Some(ActiveTurn {
            handle: handle.clone(),
            phase: TurnPhase::Accumulating,
        });
        handle
    }

    /// Freeze aggregation: messages from now on belong to the successor.
    pub fn mark_running(&self) {
        if let Some(active) = self.inner.lock().active.as_mut() {
            active.phase = TurnPhase::Running;
        }
    }

    pub fn finish_turn(&self) {
        self.inner.lock().active = None;
    }

    /// Pop the oldest queued message, if any.
    pub fn pop(&self) -> Option<RawMessage> {
        self.inner.lock().queue.pop_front().map(|q| q.message)
    }

    /// Put a turn's messages back at the head of the queue, preserving
    /// their order (superseded turns hand their messages to the successor).
    pub fn requeue_front(&self, messages: Vec<RawMessage>) {
        let mut inner = self.inner.lock();
        for message in messages.into_iter().rev() {
            inner.queue.push_front(QueuedMessage {
                message,
                enqueued_at: Instant::now(),
            });
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Age of the oldest queued message (ingress backpressure signal).
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.inner
            .lock()
            .queue
            .front()
            .map(|q| q.enqueued_at.elapsed())
    }

    /// Wait until a message is queued or `timeout` elapses.
    /// Returns whether a message is available.
    pub async fn wait_message(&self, timeout: Duration) -> bool {
        if self.has_pending() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.has_pending();
            }
            let notified = self.notify.notified();
            if self.has_pending() {
                return true;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.has_pending();
            }
            if self.has_pending() {
                return true;
            }
        }
    }

    /// The turn id the next message would land in (the active accumulating
    /// turn's, or the pre-allocated successor's).
    pub fn next_turn_id(&self) -> Uuid {
        let inner = self.inner.lock();
        match &inner.active {
            Some(active) if active.phase == TurnPhase::Accumulating => {
                active.handle.logical_turn_id
            }
            _ => inner.pending_turn_id,
        }
    }
}

/// Restricted mutable view handed to the orchestrator's signal path.
pub(crate) struct InnerView<'a> {
    inner: &'a mut Inner,
}

impl InnerView<'_> {
    pub fn enqueue(&mut self, message: RawMessage) {
        self.inner.queue.push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
        });
    }

    pub fn pending_turn_id(&self) -> Uuid {
        self.inner.pending_turn_id
    }

    pub fn active(&self) -> Option<(Uuid, TurnPhase, TurnHandle)> {
        self.inner
            .active
            .as_ref()
            .map(|a| (a.handle.logical_turn_id, a.phase, a.handle.clone()))
    }

    pub fn actor_running(&self) -> bool {
        self.inner.actor_running
    }

    pub fn set_actor_running(&mut self, running: bool) {
        self.inner.actor_running = running;
    }

    pub fn queue_is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ruche_domain::envelope::ContentType;

    fn msg(text: &str) -> RawMessage {
        RawMessage {
            tenant_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            channel: "web".into(),
            channel_user_id: "u".into(),
            content_type: ContentType::Text,
            text: Some(text.into()),
            media: Vec::new(),
            location: None,
            structured: None,
            provider_message_id: text.into(),
            idempotency_key: None,
            received_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mb = SessionMailbox::new("sess:k");
        mb.with_inner(|i| {
            i.enqueue(msg("a"));
            i.enqueue(msg("b"));
        });
        assert_eq!(mb.pop().unwrap().text.as_deref(), Some("a"));
        assert_eq!(mb.pop().unwrap().text.as_deref(), Some("b"));
        assert!(mb.pop().is_none());
    }

    #[test]
    fn begin_turn_rotates_pending_id() {
        let mb = SessionMailbox::new("sess:k");
        let before = mb.next_turn_id();
        let handle = mb.begin_turn();
        assert_eq!(handle.logical_turn_id, before);
        // While accumulating, new messages join the active turn.
        assert_eq!(mb.next_turn_id(), handle.logical_turn_id);
        // Once running, they belong to the successor.
        mb.mark_running();
        assert_ne!(mb.next_turn_id(), handle.logical_turn_id);
        mb.finish_turn();
    }

    #[test]
    fn requeue_front_precedes_queued() {
        let mb = SessionMailbox::new("sess:k");
        mb.with_inner(|i| i.enqueue(msg("new")));
        mb.requeue_front(vec![msg("old1"), msg("old2")]);
        assert_eq!(mb.pop().unwrap().text.as_deref(), Some("old1"));
        assert_eq!(mb.pop().unwrap().text.as_deref(), Some("old2"));
        assert_eq!(mb.pop().unwrap().text.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn wait_message_times_out() {
        let mb = SessionMailbox::new("sess:k");
        assert!(!mb.wait_message(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn wait_message_wakes_on_enqueue() {
        let mb = Arc::new(SessionMailbox::new("sess:k"));
        let mb2 = mb.clone();
        let waiter = tokio::spawn(async move {
            mb2.wait_message(Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        mb.with_inner(|i| i.enqueue(msg("x")));
        mb.notify_message();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn zero_window_returns_immediately() {
        let mb = SessionMailbox::new("sess:k");
        let start = Instant::now();
        assert!(!mb.wait_message(Duration::ZERO).await);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn commit_flag_shared_between_handles() {
        let mb = SessionMailbox::new("sess:k");
        let handle = mb.begin_turn();
        mb.mark_running();
        let view = mb.with_inner(|i| i.active().unwrap());
        handle.mark_commit_reached();
        assert!(view.2.commit_reached());
        mb.finish_turn();
    }
}
