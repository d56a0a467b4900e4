//! Shuttle state store — durable, consistent per-shuttle records
//!
//! Records are keyed `shuttle_state:<id>` and serialized as JSON blobs.
//! Updates go through an optimistic compare-and-set: read, apply a mutator,
//! write back conditionally on an unchanged record, retry on conflict.
//! `last_seen` is refreshed (monotonically) inside every update, so callers
//! never touch it directly.
//!
//! Two backends implement the same trait:
//! - [`SledStateStore`]: sled-backed, CAS via `compare_and_swap`
//! - [`MemoryStateStore`]: `RwLock<HashMap>` for tests and storeless runs

use crate::types::{now_unix_secs, ShuttleState};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Key namespace for shuttle state records.
const STATE_KEY_PREFIX: &str = "shuttle_state:";

/// Bounded CAS retries before a write is declared lost.
const MAX_WRITE_RETRIES: usize = 64;

/// State store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("no state record for shuttle {0}")]
    NotFound(String),
    #[error("write conflict persisted after {MAX_WRITE_RETRIES} retries for {0}")]
    Conflict(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Mutator applied inside [`StateStore::update`]. May run more than once
/// when the compare-and-set loop retries, so it must be idempotent and must
/// not retain transient connection objects.
pub type StateMutator<'a> = &'a mut dyn FnMut(&mut ShuttleState);

/// Per-shuttle state storage with compare-and-set updates.
///
/// Implementations must be thread-safe; all components share one instance
/// behind `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    /// Fetch a shuttle's record, `None` if never initialised.
    fn get(&self, shuttle_id: &str) -> Result<Option<ShuttleState>, StoreError>;

    /// Apply `mutator` to the current record under CAS and return the new
    /// record. Fails with [`StoreError::NotFound`] for unknown shuttles.
    fn update(&self, shuttle_id: &str, mutator: StateMutator<'_>)
        -> Result<ShuttleState, StoreError>;

    /// All stored records, in arbitrary order.
    fn all_states(&self) -> Result<Vec<ShuttleState>, StoreError>;

    /// Create a fresh record unless one already exists.
    fn init_if_absent(&self, shuttle_id: &str) -> Result<(), StoreError>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

fn state_key(shuttle_id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{shuttle_id}")
}

// ============================================================================
// Sled backend
// ============================================================================

/// Sled-backed state store.
pub struct SledStateStore {
    db: sled::Db,
}

impl SledStateStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl StateStore for SledStateStore {
    fn get(&self, shuttle_id: &str) -> Result<Option<ShuttleState>, StoreError> {
        match self.db.get(state_key(shuttle_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update(
        &self,
        shuttle_id: &str,
        mutator: StateMutator<'_>,
    ) -> Result<ShuttleState, StoreError> {
        let key = state_key(shuttle_id);

        for _ in 0..MAX_WRITE_RETRIES {
            let Some(old_bytes) = self.db.get(&key)? else {
                warn!(shuttle_id, "Update requested for uninitialised shuttle");
                return Err(StoreError::NotFound(shuttle_id.to_string()));
            };

            let mut state: ShuttleState = serde_json::from_slice(&old_bytes)?;
            mutator(&mut state);
            state.last_seen = state.last_seen.max(now_unix_secs());

            let new_bytes = serde_json::to_vec(&state)?;
            match self
                .db
                .compare_and_swap(&key, Some(&old_bytes), Some(new_bytes))?
            {
                Ok(()) => return Ok(state),
                Err(_) => {
                    debug!(shuttle_id, "State write conflict, retrying");
                    continue;
                }
            }
        }

        Err(StoreError::Conflict(shuttle_id.to_string()))
    }

    fn all_states(&self) -> Result<Vec<ShuttleState>, StoreError> {
        let mut states = Vec::new();
        for item in self.db.scan_prefix(STATE_KEY_PREFIX) {
            let (_key, bytes) = item?;
            match serde_json::from_slice::<ShuttleState>(&bytes) {
                Ok(state) => states.push(state),
                Err(e) => warn!(error = %e, "Skipping undecodable state record"),
            }
        }
        Ok(states)
    }

    fn init_if_absent(&self, shuttle_id: &str) -> Result<(), StoreError> {
        let key = state_key(shuttle_id);
        if self.db.contains_key(&key)? {
            return Ok(());
        }
        let initial = ShuttleState::new(shuttle_id);
        let bytes = serde_json::to_vec(&initial)?;
        // Only create when still absent; a concurrent init wins harmlessly.
        let _ = self
            .db
            .compare_and_swap(&key, None::<&[u8]>, Some(bytes))?;
        info!(shuttle_id, "Initialised shuttle state record");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory state store. Not durable — records are lost on restart.
pub struct MemoryStateStore {
    records: RwLock<HashMap<String, ShuttleState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, shuttle_id: &str) -> Result<Option<ShuttleState>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(records.get(shuttle_id).cloned())
    }

    fn update(
        &self,
        shuttle_id: &str,
        mutator: StateMutator<'_>,
    ) -> Result<ShuttleState, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let state = records
            .get_mut(shuttle_id)
            .ok_or_else(|| StoreError::NotFound(shuttle_id.to_string()))?;
        mutator(state);
        state.last_seen = state.last_seen.max(now_unix_secs());
        Ok(state.clone())
    }

    fn all_states(&self) -> Result<Vec<ShuttleState>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(records.values().cloned().collect())
    }

    fn init_if_absent(&self, shuttle_id: &str) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        records
            .entry(shuttle_id.to_string())
            .or_insert_with(|| ShuttleState::new(shuttle_id));
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
