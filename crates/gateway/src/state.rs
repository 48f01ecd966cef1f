use std::sync::Arc;

use ruche_domain::config::Config;
use ruche_fabric::{
    DeliveryRunner, DeliveryStore, FabricCore, Ingress, LocalAuditStore, MemoryConfigStore,
    SubscriptionStore,
};
use ruche_orchestrator::SessionOrchestrator;
use ruche_sessions::{LifecycleManager, LocalSessionStore};

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core** — config, the fabric core, ingress, orchestrator
/// - **Stores** — sessions, audit, scenario config
/// - **Webhooks** — subscriptions, deliveries, runner
/// - **Lifecycle** — idle/close evaluation
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub core: Arc<FabricCore>,
    pub ingress: Arc<Ingress>,
    pub orchestrator: Arc<SessionOrchestrator>,

    // ── Stores ────────────────────────────────────────────────────────
    pub sessions: Arc<LocalSessionStore>,
    pub audit: Arc<LocalAuditStore>,
    pub config_store: Arc<MemoryConfigStore>,

    // ── Webhooks ──────────────────────────────────────────────────────
    pub subscriptions: Arc<SubscriptionStore>,
    pub deliveries: Arc<DeliveryStore>,
    pub delivery_runner: Arc<DeliveryRunner>,

    // ── Lifecycle ─────────────────────────────────────────────────────
    pub lifecycle: Arc<LifecycleManager>,
}
