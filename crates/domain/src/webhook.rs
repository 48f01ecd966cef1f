//! Webhook records — tenant subscriptions and the durable delivery attempts
//! the dispatcher enqueues for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{pattern_is_valid, pattern_matches, AcfEvent};

/// Minimum signing-secret length.
pub const MIN_SECRET_BYTES: usize = 32;

/// Receivers must reject signatures whose timestamp is further than this
/// from their clock.
pub const REPLAY_TOLERANCE_SECS: i64 = 300;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Awaiting challenge-response verification.
    Pending,
    Active,
    Paused,
    /// Auto-disabled after the consecutive-failure threshold.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub url: String,
    pub secret: String,
    pub event_patterns: Vec<String>,
    /// `None` matches events from every agent of the tenant.
    #[serde(default)]
    pub agent_ids: Option<Vec<Uuid>>,
    pub status: SubscriptionStatus,
    pub timeout_ms: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Structural validation at registration time.
    pub fn validate(&self, require_https: bool) -> Result<()> {
        if self.secret.len() < MIN_SECRET_BYTES {
            return Err(Error::InvalidRequest(format!(
                "webhook secret must be at least {MIN_SECRET_BYTES} bytes"
            )));
        }
        if require_https && !self.url.starts_with("https://") {
            return Err(Error::InvalidRequest(
                "webhook url must use https".into(),
            ));
        }
        if !require_https
            && !(self.url.starts_with("https://") || self.url.starts_with("http://"))
        {
            return Err(Error::InvalidRequest("webhook url must be http(s)".into()));
        }
        if self.event_patterns.is_empty() {
            return Err(Error::InvalidRequest(
                "at least one event pattern is required".into(),
            ));
        }
        for p in &self.event_patterns {
            if !pattern_is_valid(p) {
                return Err(Error::InvalidRequest(format!(
                    "invalid event pattern '{p}'"
                )));
            }
        }
        Ok(())
    }

    /// Whether this subscription matches an event: tenant scoping is the
    /// caller's index; this checks agent filter and patterns.
    pub fn matches(&self, event: &AcfEvent) -> bool {
        if let (Some(allowed), Some(agent_id)) = (&self.agent_ids, event.agent_id) {
            if !allowed.contains(&agent_id) {
                return false;
            }
        }
        self.event_patterns
            .iter()
            .any(|p| pattern_matches(p, &event.event_type))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const WEBHOOK_SCHEMA_VERSION: &str = "1.0";

/// The JSON body POSTed to the subscriber. `webhook_id` is the receiver-side
/// deduplication token; deliveries are at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub webhook_id: Uuid,
    /// Unix seconds; also sent as `X-Ruche-Timestamp` and covered by the
    /// signature.
    pub timestamp: i64,
    pub event_type: String,
    pub event_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_turn_id: Option<Uuid>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub schema_version: String,
}

impl WebhookPayload {
    pub fn from_event(event: &AcfEvent) -> Self {
        Self {
            webhook_id: Uuid::new_v4(),
            timestamp: event.timestamp.timestamp(),
            event_type: event.event_type.clone(),
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            agent_id: event.agent_id,
            session_key: event.session_key.clone(),
            logical_turn_id: event.logical_turn_id,
            payload: event.payload.clone(),
            schema_version: WEBHOOK_SCHEMA_VERSION.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    /// Non-retryable outcome (4xx).
    Failed,
    /// Retries exhausted.
    Exhausted,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Exhausted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: WebhookPayload,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_status_code: Option<u16>,
    #[serde(default)]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn enqueue(subscription: &WebhookSubscription, payload: WebhookPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            event_id: payload.event_id,
            event_type: payload.event_type.clone(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            response_status_code: None,
            response_time_ms: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;

    pub(crate) fn subscription(tenant_id: Uuid, patterns: &[&str]) -> WebhookSubscription {
        WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id,
            url: "https://hooks.example/acf".into(),
            secret: "0123456789abcdef0123456789abcdef".into(),
            event_patterns: patterns.iter().map(|s| (*s).to_string()).collect(),
            agent_ids: None,
            status: SubscriptionStatus::Active,
            timeout_ms: 5_000,
            max_retries: 5,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn secret_length_enforced() {
        let tenant = Uuid::new_v4();
        let mut sub = subscription(tenant, &["tool.*"]);
        assert!(sub.validate(true).is_ok());
        sub.secret = "short".into();
        assert!(sub.validate(true).is_err());
    }

    #[test]
    fn https_required_when_configured() {
        let mut sub = subscription(Uuid::new_v4(), &["*"]);
        sub.url = "http://hooks.example/acf".into();
        assert!(sub.validate(true).is_err());
        assert!(sub.validate(false).is_ok());
    }

    #[test]
    fn invalid_pattern_rejected() {
        let sub = subscription(Uuid::new_v4(), &["bogus.*"]);
        assert!(sub.validate(true).is_err());
    }

    #[test]
    fn agent_filter_applies() {
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut sub = subscription(tenant, &["tool.*"]);
        sub.agent_ids = Some(vec![agent]);

        let ev = AcfEvent::new(EventCategory::Tool, "executed").with_scope(tenant, agent);
        assert!(sub.matches(&ev));

        let ev = AcfEvent::new(EventCategory::Tool, "executed").with_scope(tenant, other);
        assert!(!sub.matches(&ev));
    }

    #[test]
    fn payload_built_from_event() {
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let ev = AcfEvent::new(EventCategory::Commit, "reached")
            .with_scope(tenant, agent)
            .with_field("tool_id", "payments.charge");
        let p = WebhookPayload::from_event(&ev);
        assert_eq!(p.event_id, ev.event_id);
        assert_eq!(p.event_type, "commit.reached");
        assert_eq!(p.schema_version, WEBHOOK_SCHEMA_VERSION);
        assert_eq!(p.timestamp, ev.timestamp.timestamp());
        // Two payloads for the same event get distinct dedup tokens.
        let p2 = WebhookPayload::from_event(&ev);
        assert_ne!(p.webhook_id, p2.webhook_id);
    }

    #[test]
    fn delivery_statuses() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::Exhausted.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::InFlight.is_terminal());
    }
}
