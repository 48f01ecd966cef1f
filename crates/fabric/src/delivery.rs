//! Webhook delivery — the durable outbound side.
//!
//! The store queues deliveries with their retry schedule; the runner ticks,
//! takes due work, POSTs the signed payload, and applies the retry /
//! exhaustion / auto-disable policy. At-least-once: a delivery may repeat
//! across ambiguous failures, deduplicated by the payload's `webhook_id`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use ruche_domain::config::WebhooksConfig;
use ruche_domain::error::{Error, Result};
use ruche_domain::event::{AcfEvent, EventCategory};
use ruche_domain::webhook::{
    DeliveryStatus, SubscriptionStatus, WebhookDelivery, WebhookSubscription,
};

use crate::dispatcher::SubscriptionStore;
use crate::metrics::MetricsSink;
use crate::router::EventRouter;
use crate::signature;

const MAX_HISTORY: usize = 1_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Queue of open deliveries plus a bounded ring of terminal ones.
pub struct DeliveryStore {
    open: Mutex<Vec<WebhookDelivery>>,
    history: Mutex<VecDeque<WebhookDelivery>>,
}

impl DeliveryStore {
    pub fn in_memory() -> Self {
        Self {
            open: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, delivery: WebhookDelivery) {
        self.open.lock().push(delivery);
    }

    /// Take every delivery whose retry time has come, marking it in-flight.
    pub fn take_due(&self, now: chrono::DateTime<Utc>) -> Vec<WebhookDelivery> {
        let mut open = self.open.lock();
        let mut due = Vec::new();
        let mut keep = Vec::new();
        for mut delivery in open.drain(..) {
            let ready = delivery.status == DeliveryStatus::Pending
                && delivery.next_retry_at.map_or(true, |at| at <= now);
            if ready {
                delivery.status = DeliveryStatus::InFlight;
                due.push(delivery);
            } else {
                keep.push(delivery);
            }
        }
        *open = keep;
        due
    }

    /// Re-queue a delivery for a future retry.
    pub fn reschedule(&self, mut delivery: WebhookDelivery) {
        delivery.status = DeliveryStatus::Pending;
        self.open.lock().push(delivery);
    }

    /// Record a terminal delivery.
    pub fn finish(&self, delivery: WebhookDelivery) {
        debug_assert!(delivery.status.is_terminal());
        let mut history = self.history.lock();
        history.push_back(delivery);
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.open.lock().len()
    }

    pub fn history(&self, limit: usize) -> Vec<WebhookDelivery> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DeliveryRunner {
    http: reqwest::Client,
    subscriptions: Arc<SubscriptionStore>,
    deliveries: Arc<DeliveryStore>,
    metrics: Arc<MetricsSink>,
    /// For the internal event emitted when a subscription is auto-disabled.
    router: Mutex<Option<Arc<EventRouter>>>,
    config: WebhooksConfig,
}

impl DeliveryRunner {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        deliveries: Arc<DeliveryStore>,
        metrics: Arc<MetricsSink>,
        config: WebhooksConfig,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            subscriptions,
            deliveries,
            metrics,
            router: Mutex::new(None),
            config,
        }
    }

    /// Wire the router after construction (the router itself is built on
    /// top of the dispatcher, so this closes the loop).
    pub fn set_router(&self, router: Arc<EventRouter>) {
        *self.router.lock() = Some(router);
    }

    /// Execute every due delivery concurrently.
    pub async fn tick(&self) {
        let due = self.deliveries.take_due(Utc::now());
        if due.is_empty() {
            return;
        }
        tracing::debug!(count = due.len(), "delivery tick");
        let attempts = due.into_iter().map(|d| self.attempt(d));
        futures_util::future::join_all(attempts).await;
    }

    /// One delivery attempt, with all its bookkeeping.
    async fn attempt(&self, mut delivery: WebhookDelivery) {
        let Some(subscription) = self.subscriptions.get(delivery.subscription_id) else {
            delivery.status = DeliveryStatus::Failed;
            delivery.last_error = Some("subscription removed".into());
            self.deliveries.finish(delivery);
            return;
        };
        if subscription.status != SubscriptionStatus::Active {
            delivery.status = DeliveryStatus::Failed;
            delivery.last_error = Some(format!(
                "subscription is {:?}",
                subscription.status
            ));
            self.deliveries.finish(delivery);
            return;
        }

        delivery.attempt_count += 1;
        let body = match serde_json::to_string(&delivery.payload) {
            Ok(b) => b,
            Err(e) => {
                delivery.status = DeliveryStatus::Failed;
                delivery.last_error = Some(format!("payload serialization: {e}"));
                self.deliveries.finish(delivery);
                return;
            }
        };
        let timestamp = delivery.payload.timestamp;
        let sig = signature::signature_header(&subscription.secret, timestamp, &body);

        let started = Instant::now();
        let response = self
            .http
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("X-Ruche-Signature", sig)
            .header("X-Ruche-Timestamp", timestamp.to_string())
            .header("X-Ruche-Delivery-Id", delivery.id.to_string())
            .header("X-Ruche-Event-Type", delivery.event_type.clone())
            .timeout(Duration::from_millis(subscription.timeout_ms))
            .body(body)
            .send()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        delivery.response_time_ms = Some(elapsed_ms);

        match response {
            Ok(resp) if resp.status().is_success() => {
                delivery.status = DeliveryStatus::Delivered;
                delivery.response_status_code = Some(resp.status().as_u16());
                self.subscriptions
                    .record_success(subscription.id, Utc::now());
                self.metrics.incr("webhooks.delivered");
                self.metrics.record_duration_ms("webhooks.latency", elapsed_ms);
                tracing::info!(
                    delivery_id = %delivery.id,
                    status = resp.status().as_u16(),
                    attempt = delivery.attempt_count,
                    "webhook delivered"
                );
                self.deliveries.finish(delivery);
            }
            Ok(resp) if resp.status().is_client_error() => {
                // 4xx is the receiver rejecting the payload: no retry.
                delivery.status = DeliveryStatus::Failed;
                delivery.response_status_code = Some(resp.status().as_u16());
                delivery.last_error = Some(format!("client error {}", resp.status()));
                self.subscriptions
                    .record_failure(subscription.id, Utc::now());
                self.metrics.incr("webhooks.failed");
                tracing::warn!(
                    delivery_id = %delivery.id,
                    status = resp.status().as_u16(),
                    "webhook rejected by receiver"
                );
                self.deliveries.finish(delivery);
            }
            outcome => {
                let reason = match outcome {
                    Ok(resp) => {
                        delivery.response_status_code = Some(resp.status().as_u16());
                        format!("server error {}", resp.status())
                    }
                    Err(e) if e.is_timeout() => "timeout".to_owned(),
                    Err(e) => format!("network: {e}"),
                };
                delivery.last_error = Some(reason.clone());
                self.retry_or_exhaust(delivery, &subscription, reason).await;
            }
        }
    }

    async fn retry_or_exhaust(
        &self,
        mut delivery: WebhookDelivery,
        subscription: &WebhookSubscription,
        reason: String,
    ) {
        if delivery.attempt_count > subscription.max_retries {
            delivery.status = DeliveryStatus::Exhausted;
            self.metrics.incr("webhooks.exhausted");
            let consecutive = self
                .subscriptions
                .record_exhausted(subscription.id, Utc::now());
            tracing::warn!(
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                consecutive,
                reason = %reason,
                "webhook delivery exhausted"
            );
            self.deliveries.finish(delivery);

            if consecutive >= self.config.failure_threshold {
                let _ = self
                    .subscriptions
                    .set_status(subscription.id, SubscriptionStatus::Disabled);
                self.metrics.incr("webhooks.disabled");
                tracing::error!(
                    subscription_id = %subscription.id,
                    consecutive,
                    "subscription auto-disabled after repeated delivery failures"
                );
                let router = self.router.lock().clone();
                if let Some(router) = router {
                    let event = AcfEvent::new(EventCategory::Enforcement, "webhook_disabled")
                        .with_field("subscription_id", subscription.id.to_string())
                        .with_field("consecutive_failures", consecutive);
                    let event = AcfEvent {
                        tenant_id: Some(subscription.tenant_id),
                        ..event
                    };
                    if let Err(e) = router.emit(event).await {
                        tracing::warn!(error = %e, "failed to emit webhook_disabled event");
                    }
                }
            }
            return;
        }

        let backoff = self.config.backoff_secs(delivery.attempt_count);
        delivery.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(backoff as i64));
        self.metrics.incr("webhooks.retried");
        tracing::info!(
            delivery_id = %delivery.id,
            attempt = delivery.attempt_count,
            backoff_secs = backoff,
            reason = %reason,
            "webhook delivery rescheduled"
        );
        self.deliveries.reschedule(delivery);
    }

    // ── Challenge-response activation ────────────────────────────────

    /// Verify one pending subscription: POST a signed challenge and expect
    /// the challenge echoed back. Activates the subscription on success.
    pub async fn verify_subscription(&self, id: Uuid) -> Result<bool> {
        let subscription = self
            .subscriptions
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("subscription {id}")))?;
        let challenge = Uuid::new_v4().to_string();
        let body = serde_json::json!({
            "type": "subscription.challenge",
            "challenge": challenge,
        })
        .to_string();
        let timestamp = Utc::now().timestamp();
        let sig = signature::signature_header(&subscription.secret, timestamp, &body);

        let response = self
            .http
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("X-Ruche-Signature", sig)
            .header("X-Ruche-Timestamp", timestamp.to_string())
            .header("X-Ruche-Event-Type", "subscription.challenge")
            .timeout(Duration::from_millis(subscription.timeout_ms))
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Ok(false);
        }
        let echoed = response
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let ok = echoed.contains(&challenge);
        if ok {
            self.subscriptions
                .set_status(id, SubscriptionStatus::Active)?;
            tracing::info!(subscription_id = %id, "subscription verified and activated");
        } else {
            tracing::warn!(subscription_id = %id, "challenge response mismatch");
        }
        Ok(ok)
    }

    /// Run challenge verification for every pending subscription.
    pub async fn verify_pending(&self) {
        for subscription in self.subscriptions.pending() {
            match self.verify_subscription(subscription.id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(subscription_id = %subscription.id, "subscription verification failed");
                }
                Err(e) => {
                    tracing::warn!(subscription_id = %subscription.id, error = %e, "subscription verification error");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use ruche_domain::webhook::WebhookPayload;

    fn subscription(url: &str, max_retries: u32) -> WebhookSubscription {
        WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            url: url.into(),
            secret: "0123456789abcdef0123456789abcdef".into(),
            event_patterns: vec!["*".into()],
            agent_ids: None,
            status: SubscriptionStatus::Active,
            timeout_ms: 2_000,
            max_retries,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            created_at: Utc::now(),
        }
    }

    fn delivery_for(sub: &WebhookSubscription) -> WebhookDelivery {
        let event = AcfEvent::new(EventCategory::Tool, "executed")
            .with_scope(sub.tenant_id, Uuid::new_v4());
        WebhookDelivery::enqueue(sub, WebhookPayload::from_event(&event))
    }

    #[test]
    fn take_due_respects_schedule() {
        let store = DeliveryStore::in_memory();
        let sub = subscription("https://x.example", 5);

        let now_due = delivery_for(&sub);
        let mut later = delivery_for(&sub);
        later.next_retry_at = Some(Utc::now() + ChronoDuration::seconds(60));
        store.push(now_due);
        store.push(later);

        let due = store.take_due(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, DeliveryStatus::InFlight);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let store = DeliveryStore::in_memory();
        let sub = subscription("https://x.example", 5);
        for _ in 0..(MAX_HISTORY + 10) {
            let mut d = delivery_for(&sub);
            d.status = DeliveryStatus::Delivered;
            store.finish(d);
        }
        assert_eq!(store.history(usize::MAX).len(), MAX_HISTORY);
    }

    /// Spin up a local receiver returning the listed statuses in order.
    async fn receiver(
        statuses: Vec<u16>,
    ) -> (String, Arc<Mutex<Vec<std::collections::HashMap<String, String>>>>) {
        use axum::extract::State;
        use axum::http::HeaderMap;
        use axum::routing::post;

        type Seen = Arc<Mutex<Vec<std::collections::HashMap<String, String>>>>;
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let remaining = Arc::new(Mutex::new(statuses));

        let seen2 = seen.clone();
        let app = axum::Router::new()
            .route(
                "/hook",
                post(
                    move |State(remaining): State<Arc<Mutex<Vec<u16>>>>,
                          headers: HeaderMap,
                          body: String| {
                        let seen = seen2.clone();
                        async move {
                            let mut captured = std::collections::HashMap::new();
                            for (k, v) in headers.iter() {
                                captured.insert(
                                    k.as_str().to_owned(),
                                    v.to_str().unwrap_or("").to_owned(),
                                );
                            }
                            captured.insert("body".into(), body);
                            seen.lock().push(captured);
                            let status = {
                                let mut r = remaining.lock();
                                if r.len() > 1 {
                                    r.remove(0)
                                } else {
                                    r[0]
                                }
                            };
                            axum::http::StatusCode::from_u16(status).unwrap()
                        }
                    },
                ),
            )
            .with_state(remaining);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), seen)
    }

    fn runner(
        subs: Arc<SubscriptionStore>,
        deliveries: Arc<DeliveryStore>,
        config: WebhooksConfig,
    ) -> DeliveryRunner {
        DeliveryRunner::new(subs, deliveries, Arc::new(MetricsSink::new()), config)
    }

    #[tokio::test]
    async fn successful_delivery_carries_signed_headers() {
        let (url, seen) = receiver(vec![200]).await;
        let subs = Arc::new(SubscriptionStore::new());
        let deliveries = Arc::new(DeliveryStore::in_memory());
        let sub = subscription(&url, 5);
        let secret = sub.secret.clone();
        let sub_id = sub.id;
        subs.insert(sub.clone());
        deliveries.push(delivery_for(&sub));

        let runner = runner(subs.clone(), deliveries.clone(), WebhooksConfig::default());
        runner.tick().await;

        let history = deliveries.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeliveryStatus::Delivered);
        assert_eq!(history[0].response_status_code, Some(200));
        assert!(subs.get(sub_id).unwrap().last_success_at.is_some());

        // Receiver-side signature verification (testable property 6).
        let captured = seen.lock();
        let req = &captured[0];
        let ts: i64 = req["x-ruche-timestamp"].parse().unwrap();
        let sig = &req["x-ruche-signature"];
        assert!(signature::verify(&secret, ts, &req["body"], sig, Utc::now().timestamp()));
        assert_eq!(req["x-ruche-event-type"], "tool.executed");
        assert!(req.contains_key("x-ruche-delivery-id"));
    }

    #[tokio::test]
    async fn server_error_schedules_retry_then_succeeds() {
        let (url, seen) = receiver(vec![503, 200]).await;
        let subs = Arc::new(SubscriptionStore::new());
        let deliveries = Arc::new(DeliveryStore::in_memory());
        let sub = subscription(&url, 5);
        subs.insert(sub.clone());
        deliveries.push(delivery_for(&sub));

        let runner = runner(subs.clone(), deliveries.clone(), WebhooksConfig::default());
        runner.tick().await;

        // First attempt got 503: rescheduled with backoff.
        assert_eq!(deliveries.pending_count(), 1);
        assert!(deliveries.history(10).is_empty());

        // Force the retry due now and tick again.
        let mut due = {
            let mut open = deliveries.open.lock();
            open.drain(..).collect::<Vec<_>>()
        };
        for d in &mut due {
            d.next_retry_at = None;
        }
        for d in due {
            deliveries.reschedule(d);
        }
        runner.tick().await;

        let history = deliveries.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeliveryStatus::Delivered);
        assert_eq!(history[0].attempt_count, 2);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn client_error_is_terminal() {
        let (url, _) = receiver(vec![410]).await;
        let subs = Arc::new(SubscriptionStore::new());
        let deliveries = Arc::new(DeliveryStore::in_memory());
        let sub = subscription(&url, 5);
        subs.insert(sub.clone());
        deliveries.push(delivery_for(&sub));

        let runner = runner(subs.clone(), deliveries.clone(), WebhooksConfig::default());
        runner.tick().await;

        let history = deliveries.history(10);
        assert_eq!(history[0].status, DeliveryStatus::Failed);
        assert_eq!(history[0].response_status_code, Some(410));
        assert_eq!(deliveries.pending_count(), 0);
    }

    #[tokio::test]
    async fn exhaustion_disables_after_threshold() {
        let (url, _) = receiver(vec![500]).await;
        let subs = Arc::new(SubscriptionStore::new());
        let deliveries = Arc::new(DeliveryStore::in_memory());
        // No retries: first failure exhausts. Threshold 2 disables on the
        // second exhausted delivery.
        let sub = subscription(&url, 0);
        let sub_id = sub.id;
        subs.insert(sub.clone());

        let config = WebhooksConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let runner = runner(subs.clone(), deliveries.clone(), config);

        deliveries.push(delivery_for(&sub));
        runner.tick().await;
        assert_eq!(subs.get(sub_id).unwrap().status, SubscriptionStatus::Active);
        assert_eq!(subs.get(sub_id).unwrap().consecutive_failures, 1);

        deliveries.push(delivery_for(&sub));
        runner.tick().await;
        assert_eq!(
            subs.get(sub_id).unwrap().status,
            SubscriptionStatus::Disabled
        );

        // Disabled subscription: further deliveries fail immediately.
        deliveries.push(delivery_for(&sub));
        runner.tick().await;
        let history = deliveries.history(10);
        assert_eq!(history.last().unwrap().status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn challenge_activates_pending_subscription() {
        use axum::routing::post;

        // Receiver echoes the challenge back.
        let app = axum::Router::new().route(
            "/hook",
            post(|body: String| async move {
                let v: serde_json::Value = serde_json::from_str(&body).unwrap();
                axum::Json(serde_json::json!({ "challenge": v["challenge"] }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let subs = Arc::new(SubscriptionStore::new());
        let deliveries = Arc::new(DeliveryStore::in_memory());
        let mut sub = subscription(&format!("http://{addr}/hook"), 5);
        sub.status = SubscriptionStatus::Pending;
        let sub_id = sub.id;
        subs.insert(sub);

        let runner = runner(subs.clone(), deliveries, WebhooksConfig::default());
        runner.verify_pending().await;
        assert_eq!(subs.get(sub_id).unwrap().status, SubscriptionStatus::Active);
    }
}
