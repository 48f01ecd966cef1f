//! Audit store — append-only event persistence.
//!
//! Events of the durable categories (`turn`, `tool`, `commit`) are appended
//! synchronously before their turn reaches a terminal state; everything
//! else is written off the critical path. The local implementation keeps a
//! bounded in-memory ring plus an append-only JSONL file.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use ruche_domain::error::{Error, Result};
use ruche_domain::event::AcfEvent;

const MAX_EVENTS_IN_MEMORY: usize = 10_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Durably append one event. Returns only after the event is persisted
    /// to this store's durability level.
    async fn append(&self, event: &AcfEvent) -> Result<()>;

    /// Events of one logical turn, in append (= emission) order.
    async fn events_for_turn(&self, logical_turn_id: Uuid) -> Result<Vec<AcfEvent>>;

    /// Most recent events, newest last.
    async fn recent(&self, limit: usize) -> Result<Vec<AcfEvent>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded ring plus JSONL append log at `{state_path}/audit.jsonl`.
pub struct LocalAuditStore {
    ring: RwLock<VecDeque<AcfEvent>>,
    log_path: Option<PathBuf>,
    file: Option<parking_lot::Mutex<std::fs::File>>,
}

impl LocalAuditStore {
    pub fn in_memory() -> Self {
        Self {
            ring: RwLock::new(VecDeque::new()),
            log_path: None,
            file: None,
        }
    }

    pub fn open(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let log_path = state_path.join("audit.jsonl");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(Error::Io)?;
        tracing::info!(path = %log_path.display(), "audit log opened");
        Ok(Self {
            ring: RwLock::new(VecDeque::new()),
            log_path: Some(log_path),
            file: Some(parking_lot::Mutex::new(file)),
        })
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }
}

#[async_trait]
impl AuditStore for LocalAuditStore {
    async fn append(&self, event: &AcfEvent) -> Result<()> {
        if let Some(file) = &self.file {
            let line = serde_json::to_string(event)?;
            let mut file = file.lock();
            writeln!(file, "{line}").map_err(Error::Io)?;
        }
        let mut ring = self.ring.write();
        ring.push_back(event.clone());
        while ring.len() > MAX_EVENTS_IN_MEMORY {
            ring.pop_front();
        }
        Ok(())
    }

    async fn events_for_turn(&self, logical_turn_id: Uuid) -> Result<Vec<AcfEvent>> {
        Ok(self
            .ring
            .read()
            .iter()
            .filter(|e| e.logical_turn_id == Some(logical_turn_id))
            .cloned()
            .collect())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AcfEvent>> {
        let ring = self.ring.read();
        let skip = ring.len().saturating_sub(limit);
        Ok(ring.iter().skip(skip).cloned().collect())
    }
}
