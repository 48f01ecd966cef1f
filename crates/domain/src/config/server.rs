use serde::{Deserialize, Serialize};

use super::ConfigIssue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Allowed CORS origins; `["*"]` is fully permissive (development only).
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    /// Concurrency limit applied to the HTTP surface.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            cors_allowed_origins: Vec::new(),
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

impl ServerConfig {
    pub(super) fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        if self.port == 0 {
            issues.push(ConfigIssue::error("server.port", "must be non-zero"));
        }
        if self.cors_allowed_origins.iter().any(|o| o == "*") {
            issues.push(ConfigIssue::warning(
                "server.cors_allowed_origins",
                "wildcard CORS origin enabled — all origins allowed",
            ));
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8420
}
fn d_max_concurrent() -> usize {
    256
}
