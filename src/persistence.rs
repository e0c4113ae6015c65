//! Persisted session state
//!
//! What is needed to resume a session after a restart: the connection target, the remote
//! version the local store corresponds to, the bound modules and the serialized identity map.
//! Stored as one bincode value in a sled database.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const STATE_KEY: &[u8] = b"state";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub client_url: String,
    pub repository_id: String,
    pub branch_name: String,
    pub local_version_hash: String,
    pub module_ids: Vec<String>,
    pub serialized_identity_map: String,
}

impl PersistedState {
    /// Every connection field is non-blank and at least one module is bound.
    pub fn is_restorable(&self) -> bool {
        let filled = |field: &str| !field.trim().is_empty();
        filled(&self.client_url)
            && filled(&self.repository_id)
            && filled(&self.branch_name)
            && filled(&self.local_version_hash)
            && !self.module_ids.is_empty()
    }
}

/// Sled-backed store for [`PersistedState`].
pub struct StateStore {
    db: sled::Db,
}

impl StateStore {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            SyncError::Persistence(format!(
                "Failed to open state database at {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self { db })
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), SyncError> {
        let value = bincode::serialize(state)
            .map_err(|e| SyncError::Persistence(format!("Failed to serialize state: {}", e)))?;
        self.db.insert(STATE_KEY, value)?;
        self.db.flush()?;
        debug!(modules = state.module_ids.len(), "Saved session state");
        Ok(())
    }

    pub fn load(&self) -> Result<Option<PersistedState>, SyncError> {
        match self.db.get(STATE_KEY)? {
            Some(value) => {
                let state = bincode::deserialize(&value).map_err(|e| {
                    SyncError::Persistence(format!("Failed to deserialize state: {}", e))
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        self.db.remove(STATE_KEY)?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> PersistedState {
        PersistedState {
            client_url: "memory://server".to_string(),
            repository_id: "repo".to_string(),
            branch_name: "main".to_string(),
            local_version_hash: "abc".to_string(),
            module_ids: vec!["m".to_string()],
            serialized_identity_map: "v1:".to_string(),
        }
    }

    #[test]
    fn restorable_requires_every_connection_field() {
        assert!(sample().is_restorable());
        assert!(!PersistedState::default().is_restorable());
        let blank_branch = PersistedState {
            branch_name: "  ".to_string(),
            ..sample()
        };
        assert!(!blank_branch.is_restorable());
        let no_modules = PersistedState {
            module_ids: Vec::new(),
            ..sample()
        };
        assert!(!no_modules.is_restorable());
    }

    #[test]
    fn state_survives_reopening_the_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state");
        {
            let store = StateStore::open(&path).unwrap();
            assert_eq!(store.load().unwrap(), None);
            store.save(&sample()).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
