//! Ingress — the trusted entry point that turns a normalized envelope into
//! an orchestrator signal.
//!
//! Validates the envelope, resolves the interlocutor, derives the session
//! key, and signals the session's workflow. Accepts regardless of whether a
//! turn is currently running; the mailbox queues the signal. Duplicate
//! submissions collapse through the `(tenant, idempotency_key)` cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use ruche_domain::config::effective_strategy;
use ruche_domain::envelope::RawMessage;
use ruche_domain::error::{Error, Result};
use ruche_domain::event::{AcfEvent, EventCategory};
use ruche_orchestrator::{SessionOrchestrator, SignalOutcome};
use ruche_sessions::identity::ContactHint;
use ruche_sessions::session_key::derive_session_key;

use crate::scheduler::FabricCore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Receipt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitReceipt {
    pub accepted: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deduplicated: bool,
    pub logical_turn_id: Uuid,
    pub session_key: String,
}

struct CachedSubmit {
    logical_turn_id: Uuid,
    session_key: String,
    at: Instant,
    window: Duration,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingress
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Ingress {
    core: Arc<FabricCore>,
    orchestrator: Arc<SessionOrchestrator>,
    /// `(tenant, idempotency_key)` → prior receipt, TTL per entry.
    idempotency: Mutex<HashMap<(Uuid, String), CachedSubmit>>,
}

impl Ingress {
    pub fn new(core: Arc<FabricCore>, orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self {
            core,
            orchestrator,
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    /// Submit one envelope. Returns the logical turn the message will land
    /// in (or landed in previously, for deduplicated submissions).
    pub async fn submit(&self, envelope: RawMessage) -> Result<SubmitReceipt> {
        envelope.validate()?;
        let config = &self.core.config;

        let size = envelope.approx_size();
        let cap = config.ingress.max_envelope_bytes;
        if size > cap {
            return Err(Error::PayloadTooLarge { size, cap });
        }

        // ── Idempotency ──────────────────────────────────────────────
        if let Some(key) = &envelope.idempotency_key {
            if let Some(receipt) = self.cached(envelope.tenant_id, key) {
                self.core.router.metrics().incr("ingress.deduplicated");
                return Ok(receipt);
            }
        }

        // ── Identity resolution ──────────────────────────────────────
        let hint = contact_hint(&envelope);
        let (interlocutor_id, _is_new) = self
            .core
            .identity
            .resolve_or_create(
                envelope.tenant_id,
                envelope.agent_id,
                &envelope.channel,
                &envelope.channel_user_id,
                hint.as_ref(),
            )
            .await
            .map_err(|e| match e {
                conflict @ Error::IdentityConflict(_) => conflict,
                other => Error::IdentityUnavailable(other.to_string()),
            })?;

        let session_key = derive_session_key(
            envelope.tenant_id,
            envelope.agent_id,
            interlocutor_id,
            &envelope.channel,
        );

        // ── Slot-wait backpressure ───────────────────────────────────
        if let Some(mutex_ms) = config.timeouts.mutex_ms {
            if let Some(mailbox) = self.orchestrator.mailbox(&session_key) {
                if let Some(age) = mailbox.oldest_pending_age() {
                    if age > Duration::from_millis(mutex_ms) {
                        self.core.router.metrics().incr("ingress.mutex_timeout");
                        return Err(Error::MutexTimeout(mutex_ms));
                    }
                }
            }
        }

        // ── Signal the session workflow ──────────────────────────────
        let strategy = effective_strategy(
            &config.concurrency,
            &config.aggregation,
            &envelope.channel,
        );
        let tenant_id = envelope.tenant_id;
        let agent_id = envelope.agent_id;
        let idempotency_key = envelope.idempotency_key.clone();
        let is_mutation = envelope.structured.is_some();
        let outcome = self
            .orchestrator
            .signal(&session_key, envelope, strategy);

        if let SignalOutcome::Supersede {
            running_turn_id,
            next_turn_id,
            decision,
        } = &outcome
        {
            let base = |name: &str| {
                AcfEvent::new(EventCategory::Supersede, name)
                    .with_scope(tenant_id, agent_id)
                    .with_interlocutor(interlocutor_id)
                    .with_session(session_key.clone())
                    .with_turn(*running_turn_id)
            };
            let requested =
                base("requested").with_field("next_turn_id", next_turn_id.to_string());
            let decided = base("decision").with_field("decision", decision.as_str());
            if let Err(e) = self.core.router.emit(requested).await {
                tracing::warn!(error = %e, "supersede.requested emission failed");
            }
            if let Err(e) = self.core.router.emit(decided).await {
                tracing::warn!(error = %e, "supersede.decision emission failed");
            }
        }

        let logical_turn_id = outcome.logical_turn_id();
        self.core.router.metrics().incr("ingress.accepted");

        // ── Remember the receipt for the idempotency window ──────────
        if let Some(key) = idempotency_key {
            let window = if is_mutation {
                Duration::from_secs(config.ingress.mutation_idempotency_window_secs)
            } else {
                Duration::from_secs(config.ingress.chat_idempotency_window_secs)
            };
            self.remember(tenant_id, key, logical_turn_id, session_key.clone(), window);
        }

        Ok(SubmitReceipt {
            accepted: true,
            deduplicated: false,
            logical_turn_id,
            session_key,
        })
    }

    fn cached(&self, tenant_id: Uuid, key: &str) -> Option<SubmitReceipt> {
        let cache = self.idempotency.lock();
        let entry = cache.get(&(tenant_id, key.to_owned()))?;
        if entry.at.elapsed() > entry.window {
            return None;
        }
        Some(SubmitReceipt {
            accepted: true,
            deduplicated: true,
            logical_turn_id: entry.logical_turn_id,
            session_key: entry.session_key.clone(),
        })
    }

    fn remember(
        &self,
        tenant_id: Uuid,
        key: String,
        logical_turn_id: Uuid,
        session_key: String,
        window: Duration,
    ) {
        let mut cache = self.idempotency.lock();
        // Lazy cleanup once the map grows large.
        if cache.len() > 10_000 {
            cache.retain(|_, e| e.at.elapsed() <= e.window);
        }
        cache.insert(
            (tenant_id, key),
            CachedSubmit {
                logical_turn_id,
                session_key,
                at: Instant::now(),
                window,
            },
        );
    }
}

/// Extract contact attributes for cross-channel auto-linking: phone-shaped
/// channel user ids (WhatsApp/SMS) and explicit metadata fields.
fn contact_hint(envelope: &RawMessage) -> Option<ContactHint> {
    let mut hint = ContactHint::default();
    if matches!(envelope.channel.as_str(), "whatsapp" | "sms")
        && envelope.channel_user_id.starts_with('+')
    {
        hint.phone = Some(envelope.channel_user_id.clone());
    }
    if let Some(phone) = envelope
        .metadata
        .get("phone")
        .and_then(serde_json::Value::as_str)
    {
        hint.phone = Some(phone.to_owned());
    }
    if let Some(email) = envelope
        .metadata
        .get("email")
        .and_then(serde_json::Value::as_str)
    {
        hint.email = Some(email.to_owned());
    }
    (hint.phone.is_some() || hint.email.is_some()).then_some(hint)
}
