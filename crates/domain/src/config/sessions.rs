use serde::{Deserialize, Serialize};

/// Session lifecycle rules — idle marking and closing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Minutes of inactivity before a session is marked `idle`.
    #[serde(default = "d_idle_minutes")]
    pub idle_after_minutes: u32,
    /// Minutes of inactivity before an idle session is `closed`.
    /// `None` disables automatic closing.
    #[serde(default = "d_close_minutes")]
    pub close_after_minutes: Option<u32>,
    /// How often the store snapshot is flushed to disk.
    #[serde(default = "d_flush_secs")]
    pub flush_interval_secs: u64,
    /// How often the idle sweeper runs.
    #[serde(default = "d_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// Tenant policy: auto-link channel identities sharing a phone/email.
    #[serde(default = "d_true")]
    pub cross_channel_auto_link: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_after_minutes: d_idle_minutes(),
            close_after_minutes: d_close_minutes(),
            flush_interval_secs: d_flush_secs(),
            sweep_interval_secs: d_sweep_secs(),
            cross_channel_auto_link: d_true(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_idle_minutes() -> u32 {
    30
}
fn d_close_minutes() -> Option<u32> {
    Some(24 * 60)
}
fn d_flush_secs() -> u64 {
    30
}
fn d_sweep_secs() -> u64 {
    60
}
fn d_true() -> bool {
    true
}
