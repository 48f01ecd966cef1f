use serde::{Deserialize, Serialize};

use super::ConfigIssue;

/// Event-router limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Payloads above this are truncated and flagged `payload_truncated`.
    #[serde(default = "d_max_payload")]
    pub max_payload_size_bytes: usize,
    /// Per-tenant emission cap per minute; excess non-critical events are
    /// dropped and counted under `router.drop`.
    #[serde(default = "d_tenant_rate")]
    pub tenant_events_per_minute: u32,
    /// Buffer depth of the live-stream broadcast channel.
    #[serde(default = "d_live_buffer")]
    pub live_stream_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_payload_size_bytes: d_max_payload(),
            tenant_events_per_minute: d_tenant_rate(),
            live_stream_buffer: d_live_buffer(),
        }
    }
}

impl RouterConfig {
    pub(super) fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        if self.max_payload_size_bytes < 1024 {
            issues.push(ConfigIssue::error(
                "router.max_payload_size_bytes",
                "must be at least 1 KiB",
            ));
        }
        if self.live_stream_buffer == 0 {
            issues.push(ConfigIssue::error(
                "router.live_stream_buffer",
                "must be non-zero",
            ));
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_payload() -> usize {
    64 * 1024
}
fn d_tenant_rate() -> u32 {
    600
}
fn d_live_buffer() -> usize {
    256
}
