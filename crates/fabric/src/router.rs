//! Event router — the single fan-out point for fabric events.
//!
//! Delivery targets, in order: the audit store (awaited for the durable
//! categories, queued otherwise), the metrics sink (synchronous), the live
//! broadcast channel (best effort), and the webhook dispatcher
//! (fire-and-forget). Oversized payloads are truncated and flagged;
//! per-tenant emission is capped with a `router.drop` counter.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use ruche_domain::config::RouterConfig;
use ruche_domain::error::Result;
use ruche_domain::event::AcfEvent;

use crate::audit::AuditStore;
use crate::dispatcher::WebhookDispatcher;
use crate::metrics::MetricsSink;

pub struct EventRouter {
    audit: Arc<dyn AuditStore>,
    metrics: Arc<MetricsSink>,
    live_tx: broadcast::Sender<AcfEvent>,
    dispatcher: Option<Arc<WebhookDispatcher>>,
    config: RouterConfig,
    /// tenant → (minute bucket, emissions within it).
    tenant_windows: Mutex<HashMap<Uuid, (i64, u32)>>,
}

impl EventRouter {
    pub fn new(
        audit: Arc<dyn AuditStore>,
        metrics: Arc<MetricsSink>,
        dispatcher: Option<Arc<WebhookDispatcher>>,
        config: RouterConfig,
    ) -> Self {
        let (live_tx, _) = broadcast::channel(config.live_stream_buffer.max(1));
        Self {
            audit,
            metrics,
            live_tx,
            dispatcher,
            config,
            tenant_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Route one event.
    ///
    /// Returns an error only when a durable-category audit append fails —
    /// the scheduler treats that as fatal for the turn. All other targets
    /// are best effort and never block the caller on a slow consumer.
    pub async fn emit(&self, mut event: AcfEvent) -> Result<()> {
        let durable = event.category().map_or(false, |c| c.is_durable());

        // Per-tenant rate cap; durable events are never dropped.
        if !durable && self.over_tenant_cap(&event) {
            self.metrics.incr("router.drop");
            tracing::warn!(
                event_type = %event.event_type,
                tenant_id = ?event.tenant_id,
                "per-tenant event cap exceeded, dropping"
            );
            return Ok(());
        }

        self.truncate_if_oversized(&mut event);

        // Audit: awaited for durable categories, queued otherwise.
        if durable {
            self.audit.append(&event).await?;
        } else {
            let audit = self.audit.clone();
            let clone = event.clone();
            tokio::spawn(async move {
                if let Err(e) = audit.append(&clone).await {
                    tracing::warn!(error = %e, event_type = %clone.event_type, "async audit append failed");
                }
            });
        }

        // Metrics (synchronous).
        self.metrics.incr("acf.events");
        if let Some(category) = event.category() {
            self.metrics.incr(&format!("acf.events.{}", category.as_str()));
        }

        // Live streams (best effort; no subscribers is fine).
        let _ = self.live_tx.send(event.clone());

        // Webhooks (fire-and-forget enqueue).
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(&event);
        }

        Ok(())
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<AcfEvent> {
        self.live_tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    fn over_tenant_cap(&self, event: &AcfEvent) -> bool {
        let Some(tenant_id) = event.tenant_id else {
            return false;
        };
        let bucket = event.timestamp.timestamp() / 60;
        let mut windows = self.tenant_windows.lock();
        let entry = windows.entry(tenant_id).or_insert((bucket, 0));
        if entry.0 != bucket {
            *entry = (bucket, 0);
        }
        entry.1 += 1;
        entry.1 > self.config.tenant_events_per_minute
    }

    fn truncate_if_oversized(&self, event: &mut AcfEvent) {
        let size = serde_json::to_string(&event.payload)
            .map(|s| s.len())
            .unwrap_or(0);
        if size <= self.config.max_payload_size_bytes {
            return;
        }
        let preview: String = serde_json::to_string(&event.payload)
            .unwrap_or_default()
            .chars()
            .take(1024)
            .collect();
        event.payload = serde_json::Map::from_iter([
            ("preview".to_owned(), serde_json::Value::String(preview)),
            (
                "original_size_bytes".to_owned(),
                serde_json::Value::from(size),
            ),
        ]);
        event.payload_truncated = true;
        self.metrics.incr("router.truncated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LocalAuditStore;
    use ruche_domain::event::EventCategory;

    fn router(config: RouterConfig) -> (EventRouter, Arc<LocalAuditStore>) {
        let audit = Arc::new(LocalAuditStore::in_memory());
        let metrics = Arc::new(MetricsSink::new());
        (
            EventRouter::new(audit.clone(), metrics, None, config),
            audit,
        )
    }

    #[tokio::test]
    async fn durable_events_audited_before_return() {
        let (router, audit) = router(RouterConfig::default());
        let turn = Uuid::new_v4();
        router
            .emit(AcfEvent::new(EventCategory::Turn, "started").with_turn(turn))
            .await
            .unwrap();
        assert_eq!(audit.events_for_turn(turn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn live_subscribers_receive_events() {
        let (router, _) = router(RouterConfig::default());
        let mut rx = router.subscribe_live();
        router
            .emit(AcfEvent::new(EventCategory::Session, "created"))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "session.created");
    }

    #[tokio::test]
    async fn oversized_payload_truncated_and_flagged() {
        let (router, _) = router(RouterConfig {
            max_payload_size_bytes: 2048,
            ..Default::default()
        });
        let mut rx = router.subscribe_live();
        let big = "x".repeat(10_000);
        router
            .emit(AcfEvent::new(EventCategory::Turn, "completed").with_field("blob", big))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert!(received.payload_truncated);
        assert!(received.payload.contains_key("preview"));
        assert!(
            serde_json::to_string(&received.payload).unwrap().len() <= 4096,
            "truncated payload must be small"
        );
    }

    #[tokio::test]
    async fn tenant_cap_drops_non_durable() {
        let (router, _) = router(RouterConfig {
            tenant_events_per_minute: 2,
            ..Default::default()
        });
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        for _ in 0..5 {
            router
                .emit(AcfEvent::new(EventCategory::Mutex, "acquired").with_scope(tenant, agent))
                .await
                .unwrap();
        }
        assert_eq!(router.metrics().counter("router.drop"), 3);
    }

    #[tokio::test]
    async fn tenant_cap_never_drops_durable() {
        let (router, audit) = router(RouterConfig {
            tenant_events_per_minute: 1,
            ..Default::default()
        });
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let turn = Uuid::new_v4();
        for _ in 0..5 {
            router
                .emit(
                    AcfEvent::new(EventCategory::Tool, "executed")
                        .with_scope(tenant, agent)
                        .with_turn(turn),
                )
                .await
                .unwrap();
        }
        assert_eq!(audit.events_for_turn(turn).await.unwrap().len(), 5);
        assert_eq!(router.metrics().counter("router.drop"), 0);
    }
}
