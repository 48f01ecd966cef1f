//! Session store — durable key→state with compare-and-swap writes.
//!
//! The fabric holds no application-level session lock; serialization comes
//! from the orchestrator, and the store's CAS is the last line of defense
//! against lost updates. Every successful write increments `version`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use ruche_domain::error::{Error, Result};
use ruche_domain::session::SessionState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable session state with CAS semantics.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_key: &str) -> Result<Option<SessionState>>;

    /// Persist `state` iff the stored version equals `expected_version`
    /// (0 for a new session). On success the stored version becomes
    /// `expected_version + 1` and the stored state is returned.
    /// On mismatch returns [`Error::Conflict`].
    async fn put_cas(
        &self,
        expected_version: u64,
        state: SessionState,
    ) -> Result<SessionState>;

    async fn list(&self) -> Result<Vec<SessionState>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory store with an optional JSON snapshot on disk
/// (`{state_path}/sessions.json`), loaded at startup and flushed
/// periodically by the gateway.
pub struct LocalSessionStore {
    path: Option<PathBuf>,
    sessions: RwLock<HashMap<String, SessionState>>,
    dirty: AtomicBool,
}

impl LocalSessionStore {
    /// Pure in-memory store (tests, embedded use).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sessions: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load or create the snapshot at `state_path/sessions.json`.
    pub fn open(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("sessions.json");
        let sessions: HashMap<String, SessionState> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %path.display(),
            "session store loaded"
        );

        Ok(Self {
            path: Some(path),
            sessions: RwLock::new(sessions),
            dirty: AtomicBool::new(false),
        })
    }

    /// Write the snapshot if anything changed since the last flush.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = {
            let sessions = self.sessions.read();
            serde_json::to_string_pretty(&*sessions)?
        };
        tokio::fs::write(path, snapshot).await.map_err(Error::Io)?;
        tracing::debug!(path = %path.display(), "session snapshot flushed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn get(&self, session_key: &str) -> Result<Option<SessionState>> {
        Ok(self.sessions.read().get(session_key).cloned())
    }

    async fn put_cas(
        &self,
        expected_version: u64,
        mut state: SessionState,
    ) -> Result<SessionState> {
        let mut sessions = self.sessions.write();
        let current = sessions.get(&state.session_key).map(|s| s.version);
        match current {
            None if expected_version != 0 => {
                return Err(Error::Conflict(format!(
                    "session {} does not exist (expected version {expected_version})",
                    state.session_key
                )));
            }
            Some(v) if v != expected_version => {
                return Err(Error::Conflict(format!(
                    "session {} version {v} != expected {expected_version}",
                    state.session_key
                )));
            }
            _ => {}
        }
        state.version = expected_version + 1;
        state.updated_at = Utc::now();
        sessions.insert(state.session_key.clone(), state.clone());
        drop(sessions);
        self.dirty.store(true, Ordering::Release);
        Ok(state)
    }

    async fn list(&self) -> Result<Vec<SessionState>> {
        Ok(self.sessions.read().values().cloned().collect())
    }
}
