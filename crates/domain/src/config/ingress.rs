use serde::{Deserialize, Serialize};

/// Ingress envelope limits and idempotency windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Maximum serialized envelope size.
    #[serde(default = "d_max_envelope_bytes")]
    pub max_envelope_bytes: usize,
    /// Dedup window for conversational submissions.
    #[serde(default = "d_chat_window_secs")]
    pub chat_idempotency_window_secs: u64,
    /// Dedup window for mutation-style submissions.
    #[serde(default = "d_mutation_window_secs")]
    pub mutation_idempotency_window_secs: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_envelope_bytes: d_max_envelope_bytes(),
            chat_idempotency_window_secs: d_chat_window_secs(),
            mutation_idempotency_window_secs: d_mutation_window_secs(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_envelope_bytes() -> usize {
    256 * 1024
}
fn d_chat_window_secs() -> u64 {
    300
}
fn d_mutation_window_secs() -> u64 {
    60
}
