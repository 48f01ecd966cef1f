//! Config store contract — per-(tenant, agent) immutable-versioned scenario
//! graphs.
//!
//! A turn loads a snapshot at entry; publishing a new scenario version only
//! affects subsequent turns (hot reload at the turn boundary).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use ruche_domain::error::{Error, Result};
use ruche_domain::scenario::Scenario;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Latest published version of a scenario.
    async fn latest_scenario(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        scenario_id: &str,
    ) -> Result<Option<Arc<Scenario>>>;

    /// A specific retained version, if still available.
    async fn scenario_version(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        scenario_id: &str,
        version: u32,
    ) -> Result<Option<Arc<Scenario>>>;
}

type ScopeKey = (Uuid, Uuid);

/// In-memory implementation retaining every published version.
#[derive(Default)]
pub struct MemoryConfigStore {
    scenarios: RwLock<HashMap<ScopeKey, HashMap<String, Vec<Arc<Scenario>>>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a scenario version. Versions must be monotonically
    /// increasing per scenario id.
    pub fn publish(&self, tenant_id: Uuid, agent_id: Uuid, scenario: Scenario) -> Result<()> {
        scenario.validate()?;
        let mut scopes = self.scenarios.write();
        let versions = scopes
            .entry((tenant_id, agent_id))
            .or_default()
            .entry(scenario.scenario_id.clone())
            .or_default();
        if let Some(last) = versions.last() {
            if scenario.version <= last.version {
                return Err(Error::Config(format!(
                    "scenario {} version {} already published (latest {})",
                    scenario.scenario_id, scenario.version, last.version
                )));
            }
        }
        tracing::info!(
            scenario_id = %scenario.scenario_id,
            version = scenario.version,
            steps = scenario.steps.len(),
            "scenario published"
        );
        versions.push(Arc::new(scenario));
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn latest_scenario(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        scenario_id: &str,
    ) -> Result<Option<Arc<Scenario>>> {
        Ok(self
            .scenarios
            .read()
            .get(&(tenant_id, agent_id))
            .and_then(|s| s.get(scenario_id))
            .and_then(|v| v.last().cloned()))
    }

    async fn scenario_version(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        scenario_id: &str,
        version: u32,
    ) -> Result<Option<Arc<Scenario>>> {
        Ok(self
            .scenarios
            .read()
            .get(&(tenant_id, agent_id))
            .and_then(|s| s.get(scenario_id))
            .and_then(|v| v.iter().find(|s| s.version == version).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruche_domain::scenario::Step;

    fn scenario(version: u32) -> Scenario {
        Scenario {
            scenario_id: "flow".into(),
            version,
            entry_step_id: "start".into(),
            steps: vec![Step {
                step_id: "start".into(),
                name: "start".into(),
                description: None,
                is_entry: true,
                is_terminal: true,
                reachable_from_anywhere: false,
                is_checkpoint: false,
                required_variables: Vec::new(),
                transitions: Vec::new(),
            }],
        }
    }

    #[tokio::test]
    async fn publish_and_fetch_versions() {
        let store = MemoryConfigStore::new();
        let (t, a) = (Uuid::new_v4(), Uuid::new_v4());
        store.publish(t, a, scenario(1)).unwrap();
        store.publish(t, a, scenario(2)).unwrap();

        let latest = store.latest_scenario(t, a, "flow").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        let v1 = store
            .scenario_version(t, a, "flow", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1.version, 1);
        assert!(store
            .scenario_version(t, a, "flow", 3)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rejects_non_monotonic_versions() {
        let store = MemoryConfigStore::new();
        let (t, a) = (Uuid::new_v4(), Uuid::new_v4());
        store.publish(t, a, scenario(2)).unwrap();
        assert!(store.publish(t, a, scenario(2)).is_err());
        assert!(store.publish(t, a, scenario(1)).is_err());
    }

    #[tokio::test]
    async fn scoped_per_tenant() {
        let store = MemoryConfigStore::new();
        let (t1, a1) = (Uuid::new_v4(), Uuid::new_v4());
        store.publish(t1, a1, scenario(1)).unwrap();
        let other = store
            .latest_scenario(Uuid::new_v4(), a1, "flow")
            .await
            .unwrap();
        assert!(other.is_none());
    }
}
