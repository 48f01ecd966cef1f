use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durable state locations. Sessions persist as a JSON snapshot, the audit
/// log as append-only JSONL, both under `state_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
