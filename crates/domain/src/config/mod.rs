mod fabric;
mod ingress;
mod navigator;
mod router;
mod server;
mod sessions;
mod storage;
mod webhooks;

pub use fabric::*;
pub use ingress::*;
pub use navigator::*;
pub use router::*;
pub use server::*;
pub use sessions::*;
pub use storage::*;
pub use webhooks::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub scenario_navigator: NavigatorConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

impl Config {
    /// Validate the whole tree. Errors abort startup; warnings are logged.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        self.server.validate(&mut issues);
        self.concurrency.validate(&mut issues);
        self.aggregation.validate(&mut issues);
        self.timeouts.validate(&mut issues);
        self.scenario_navigator.validate(&mut issues);
        self.webhooks.validate(&mut issues);
        self.router.validate(&mut issues);
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "default config has errors: {errors:?}");
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.aggregation.window_ms_default, 3_000);
        assert_eq!(config.timeouts.brain_ms, 30_000);
        assert_eq!(config.webhooks.max_retries, 5);
    }

    #[test]
    fn partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [timeouts]
            brain_ms = 10000

            [aggregation.per_channel.web]
            window_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.brain_ms, 10_000);
        assert_eq!(config.timeouts.total_ms, 60_000);
        assert_eq!(
            config.aggregation.per_channel.get("web").unwrap().window_ms,
            Some(0)
        );
    }
}
