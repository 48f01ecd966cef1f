//! Process wiring: build the fabric from configuration, load seeded
//! state, and spawn the periodic background tasks.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;

use ruche_domain::config::Config;
use ruche_domain::event::{AcfEvent, EventCategory};
use ruche_domain::scenario::Scenario;
use ruche_domain::session::SessionStatus;
use ruche_domain::webhook::WebhookSubscription;
use ruche_fabric::{
    DeliveryRunner, DeliveryStore, EchoPipeline, EventRouter, FabricCore, Ingress,
    LocalAuditStore, MemoryConfigStore, MetricsSink, SubscriptionStore, Toolbox,
    TracingResponseSink, TurnScheduler, WebhookDispatcher,
};
use ruche_orchestrator::SessionOrchestrator;
use ruche_scenario::{KeywordEmbedder, Navigator};
use ruche_sessions::store::SessionStore;
use ruche_sessions::{LifecycleManager, LocalSessionStore, MemoryIdentityStore};

use crate::state::AppState;

/// Build the full application state from configuration.
pub fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let state_path = config.storage.state_path.clone();

    // ── Stores ───────────────────────────────────────────────────────
    let sessions = Arc::new(
        LocalSessionStore::open(&state_path).context("initializing session store")?,
    );
    let audit =
        Arc::new(LocalAuditStore::open(&state_path).context("initializing audit store")?);
    tracing::info!(sessions = sessions.len(), "stores ready");

    // ── Webhooks ─────────────────────────────────────────────────────
    let metrics = Arc::new(MetricsSink::new());
    let subscriptions = Arc::new(SubscriptionStore::new());
    load_subscriptions(&state_path, &subscriptions)?;
    let deliveries = Arc::new(DeliveryStore::in_memory());
    let dispatcher = Arc::new(WebhookDispatcher::new(
        subscriptions.clone(),
        deliveries.clone(),
        metrics.clone(),
    ));
    let delivery_runner = Arc::new(DeliveryRunner::new(
        subscriptions.clone(),
        deliveries.clone(),
        metrics.clone(),
        config.webhooks.clone(),
    ));
    tracing::info!(subscriptions = subscriptions.len(), "webhook dispatcher ready");

    // ── Event router ─────────────────────────────────────────────────
    let router = Arc::new(EventRouter::new(
        audit.clone(),
        metrics,
        Some(dispatcher),
        config.router.clone(),
    ));
    delivery_runner.set_router(router.clone());

    // ── Scenario config store ────────────────────────────────────────
    let config_store = Arc::new(MemoryConfigStore::new());
    load_scenarios(&state_path, &config_store)?;

    // ── Identity ─────────────────────────────────────────────────────
    let identity = Arc::new(MemoryIdentityStore::new(
        config.sessions.cross_channel_auto_link,
    ));

    // ── Toolbox ──────────────────────────────────────────────────────
    let toolbox = Arc::new(Toolbox::new(config.timeouts.tool_ms));

    // ── Pipeline (reference wiring; production injects its own) ──────
    let embedder = Arc::new(KeywordEmbedder);
    let pipeline = Arc::new(
        EchoPipeline::new(
            Navigator::new(config.scenario_navigator.clone()),
            config.scenario_navigator.sanity_threshold,
        )
        .with_embedder(embedder.clone()),
    );

    // ── Fabric core + orchestrator + ingress ─────────────────────────
    let core = Arc::new(FabricCore {
        config: config.clone(),
        sessions: sessions.clone(),
        identity,
        config_store: config_store.clone(),
        router,
        pipeline,
        toolbox,
        embedder: Some(embedder),
        response_sink: Arc::new(TracingResponseSink),
    });
    let scheduler = Arc::new(TurnScheduler::new(core.clone()));
    let orchestrator = SessionOrchestrator::new(scheduler);
    let ingress = Arc::new(Ingress::new(core.clone(), orchestrator.clone()));
    tracing::info!("fabric core ready");

    let lifecycle = Arc::new(LifecycleManager::new(config.sessions.clone()));

    Ok(AppState {
        config,
        core,
        ingress,
        orchestrator,
        sessions,
        audit,
        config_store,
        subscriptions,
        deliveries,
        delivery_runner,
        lifecycle,
    })
}

/// Spawn the periodic sweeps: session flush, lifecycle, delivery ticks,
/// mailbox pruning, and one-shot pending-subscription verification.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Periodic session flush ───────────────────────────────────────
    {
        let sessions = state.sessions.clone();
        let every = state.config.sessions.flush_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(every.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = sessions.flush().await {
                    tracing::warn!(error = %e, "session store flush failed");
                }
            }
        });
    }

    // ── Idle/close lifecycle sweep ───────────────────────────────────
    {
        let state = state.clone();
        let every = state.config.sessions.sweep_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(every.max(1)));
            loop {
                interval.tick().await;
                sweep_lifecycle(&state).await;
            }
        });
    }

    // ── Webhook delivery ticks ───────────────────────────────────────
    {
        let runner = state.delivery_runner.clone();
        let every = state.config.webhooks.tick_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(every.max(1)));
            loop {
                interval.tick().await;
                runner.tick().await;
            }
        });
    }

    // ── Idle mailbox pruning ─────────────────────────────────────────
    {
        let orchestrator = state.orchestrator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                orchestrator.prune_idle();
            }
        });
    }

    // ── One-shot: verify pending subscriptions ───────────────────────
    {
        let runner = state.delivery_runner.clone();
        tokio::spawn(async move {
            runner.verify_pending().await;
        });
    }
}

/// Move sessions through `active → idle → closed` based on inactivity.
async fn sweep_lifecycle(state: &AppState) {
    let now = Utc::now();
    let sessions = match state.sessions.list().await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "lifecycle sweep: list failed");
            return;
        }
    };
    for session in sessions {
        let Some(transition) = state.lifecycle.evaluate(&session, now) else {
            continue;
        };
        let v0 = session.version;
        let mut next = session.clone();
        let (status, name) = match transition {
            ruche_sessions::LifecycleTransition::MarkIdle => (SessionStatus::Idle, "idle"),
            ruche_sessions::LifecycleTransition::Close => (SessionStatus::Closed, "closed"),
        };
        next.status = status;
        match state.sessions.put_cas(v0, next).await {
            Ok(_) => {
                tracing::info!(
                    session_key = %session.session_key,
                    transition = %transition,
                    "session lifecycle transition"
                );
                let event = AcfEvent::new(EventCategory::Session, name)
                    .with_scope(session.tenant_id, session.agent_id)
                    .with_interlocutor(session.interlocutor_id)
                    .with_session(session.session_key.clone());
                if let Err(e) = state.core.router.emit(event).await {
                    tracing::warn!(error = %e, "lifecycle event emission failed");
                }
            }
            // A concurrent turn won the CAS; it reset the idle clock anyway.
            Err(_) => continue,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Seed loaders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Load `{state_path}/webhook_subscriptions.json` (a JSON array) if present.
fn load_subscriptions(state_path: &Path, store: &SubscriptionStore) -> anyhow::Result<()> {
    let path = state_path.join("webhook_subscriptions.json");
    if !path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let subscriptions: Vec<WebhookSubscription> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let count = subscriptions.len();
    for subscription in subscriptions {
        store.insert(subscription);
    }
    tracing::info!(count, path = %path.display(), "webhook subscriptions loaded");
    Ok(())
}

#[derive(Deserialize)]
struct ScenarioSeed {
    tenant_id: uuid::Uuid,
    agent_id: uuid::Uuid,
    scenario: Scenario,
}

/// Load every `{state_path}/scenarios/*.json` seed file.
fn load_scenarios(state_path: &Path, store: &MemoryConfigStore) -> anyhow::Result<()> {
    let dir = state_path.join("scenarios");
    if !dir.is_dir() {
        return Ok(());
    }
    let mut count = 0usize;
    let mut entries: Vec<_> = std::fs::read_dir(&dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    entries.sort();
    for path in entries {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let seed: ScenarioSeed = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        store
            .publish(seed.tenant_id, seed.agent_id, seed.scenario)
            .with_context(|| format!("publishing {}", path.display()))?;
        count += 1;
    }
    if count > 0 {
        tracing::info!(count, dir = %dir.display(), "scenario versions loaded");
    }
    Ok(())
}
