use serde::{Deserialize, Serialize};

use super::ConfigIssue;

/// Webhook delivery policy. Backoff is exponential:
/// `initial * factor^(attempt-1)`, capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "d_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "d_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "d_max_backoff")]
    pub max_backoff_secs: u64,
    /// Default retry budget for subscriptions that don't set their own.
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    /// Consecutive exhausted deliveries before a subscription is disabled.
    #[serde(default = "d_failure_threshold")]
    pub failure_threshold: u32,
    /// Default per-request timeout for subscriptions that don't set one.
    #[serde(default = "d_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Require `https://` URLs (disable only in development).
    #[serde(default = "d_true")]
    pub require_https: bool,
    /// How often the delivery runner scans for due work.
    #[serde(default = "d_tick_secs")]
    pub tick_secs: u64,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: d_initial_backoff(),
            backoff_factor: d_backoff_factor(),
            max_backoff_secs: d_max_backoff(),
            max_retries: d_max_retries(),
            failure_threshold: d_failure_threshold(),
            default_timeout_ms: d_timeout_ms(),
            require_https: d_true(),
            tick_secs: d_tick_secs(),
        }
    }
}

impl WebhooksConfig {
    pub(super) fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        if self.backoff_factor < 1.0 {
            issues.push(ConfigIssue::error(
                "webhooks.backoff_factor",
                "must be at least 1.0",
            ));
        }
        if self.initial_backoff_secs == 0 {
            issues.push(ConfigIssue::error(
                "webhooks.initial_backoff_secs",
                "must be non-zero",
            ));
        }
        if self.max_backoff_secs < self.initial_backoff_secs {
            issues.push(ConfigIssue::error(
                "webhooks.max_backoff_secs",
                "must be at least initial_backoff_secs",
            ));
        }
        if !self.require_https {
            issues.push(ConfigIssue::warning(
                "webhooks.require_https",
                "plain http webhooks enabled — development only",
            ));
        }
    }

    /// Backoff before retry number `attempt` (1-based), in seconds.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self.initial_backoff_secs as f64 * self.backoff_factor.powi(exp as i32);
        (raw as u64).min(self.max_backoff_secs)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_initial_backoff() -> u64 {
    10
}
fn d_backoff_factor() -> f64 {
    2.0
}
fn d_max_backoff() -> u64 {
    3_600
}
fn d_max_retries() -> u32 {
    5
}
fn d_failure_threshold() -> u32 {
    10
}
fn d_timeout_ms() -> u64 {
    10_000
}
fn d_true() -> bool {
    true
}
fn d_tick_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let c = WebhooksConfig::default();
        assert_eq!(c.backoff_secs(1), 10);
        assert_eq!(c.backoff_secs(2), 20);
        assert_eq!(c.backoff_secs(3), 40);
        assert_eq!(c.backoff_secs(4), 80);
        assert_eq!(c.backoff_secs(5), 160);
        // Cap applies for deep retries.
        assert_eq!(c.backoff_secs(20), 3_600);
    }

    #[test]
    fn sub_unity_factor_rejected() {
        let mut issues = Vec::new();
        WebhooksConfig {
            backoff_factor: 0.5,
            ..Default::default()
        }
        .validate(&mut issues);
        assert!(!issues.is_empty());
    }
}
