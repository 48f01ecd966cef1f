//! Webhook dispatcher — matches events to tenant subscriptions and
//! enqueues durable deliveries.
//!
//! `dispatch` is fire-and-forget: matching is a linear scan over the
//! tenant's active subscriptions and enqueueing never blocks on the
//! network. The delivery runner (`delivery.rs`) executes the queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use ruche_domain::error::{Error, Result};
use ruche_domain::event::AcfEvent;
use ruche_domain::webhook::{
    SubscriptionStatus, WebhookDelivery, WebhookPayload, WebhookSubscription,
};

use crate::delivery::DeliveryStore;
use crate::metrics::MetricsSink;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tenant-indexed subscription registry.
#[derive(Default)]
pub struct SubscriptionStore {
    by_id: RwLock<HashMap<Uuid, WebhookSubscription>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription after validation. New subscriptions start
    /// `pending` until challenge-response verification activates them.
    pub fn register(
        &self,
        mut subscription: WebhookSubscription,
        require_https: bool,
    ) -> Result<Uuid> {
        subscription.validate(require_https)?;
        subscription.status = SubscriptionStatus::Pending;
        let id = subscription.id;
        self.by_id.write().insert(id, subscription);
        Ok(id)
    }

    /// Insert a subscription verbatim (snapshot restore, tests).
    pub fn insert(&self, subscription: WebhookSubscription) {
        self.by_id.write().insert(subscription.id, subscription);
    }

    pub fn get(&self, id: Uuid) -> Option<WebhookSubscription> {
        self.by_id.read().get(&id).cloned()
    }

    pub fn active_for_tenant(&self, tenant_id: Uuid) -> Vec<WebhookSubscription> {
        self.by_id
            .read()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.status == SubscriptionStatus::Active)
            .cloned()
            .collect()
    }

    pub fn pending(&self) -> Vec<WebhookSubscription> {
        self.by_id
            .read()
            .values()
            .filter(|s| s.status == SubscriptionStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn set_status(&self, id: Uuid, status: SubscriptionStatus) -> Result<()> {
        let mut by_id = self.by_id.write();
        let sub = by_id
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("subscription {id}")))?;
        sub.status = status;
        Ok(())
    }

    pub fn record_success(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(sub) = self.by_id.write().get_mut(&id) {
            sub.consecutive_failures = 0;
            sub.last_success_at = Some(at);
        }
    }

    pub fn record_failure(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(sub) = self.by_id.write().get_mut(&id) {
            sub.last_failure_at = Some(at);
        }
    }

    /// Count an exhausted delivery against the subscription. Returns the
    /// new consecutive-failure count.
    pub fn record_exhausted(&self, id: Uuid, at: DateTime<Utc>) -> u32 {
        let mut by_id = self.by_id.write();
        let Some(sub) = by_id.get_mut(&id) else {
            return 0;
        };
        sub.consecutive_failures += 1;
        sub.last_failure_at = Some(at);
        sub.consecutive_failures
    }

    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.read().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WebhookDispatcher {
    subscriptions: Arc<SubscriptionStore>,
    deliveries: Arc<DeliveryStore>,
    metrics: Arc<MetricsSink>,
}

impl WebhookDispatcher {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        deliveries: Arc<DeliveryStore>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            subscriptions,
            deliveries,
            metrics,
        }
    }

    /// Match `event` against the tenant's active subscriptions and enqueue
    /// one delivery per match. Returns the number enqueued.
    pub fn dispatch(&self, event: &AcfEvent) -> usize {
        let Some(tenant_id) = event.tenant_id else {
            return 0;
        };
        let mut enqueued = 0;
        for subscription in self.subscriptions.active_for_tenant(tenant_id) {
            if !subscription.matches(event) {
                continue;
            }
            let payload = WebhookPayload::from_event(event);
            let delivery = WebhookDelivery::enqueue(&subscription, payload);
            tracing::debug!(
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                event_type = %event.event_type,
                "webhook delivery enqueued"
            );
            self.deliveries.push(delivery);
            enqueued += 1;
        }
        if enqueued > 0 {
            self.metrics.incr_by("webhooks.enqueued", enqueued as u64);
        }
        enqueued
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }

    pub fn deliveries(&self) -> &Arc<DeliveryStore> {
        &self.deliveries
    }
}
