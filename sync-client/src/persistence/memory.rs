//! In-memory persistence for testing and ephemeral pools.
//!
//! Allows seeding disk files and forcing failures for verification.

use super::{Persistence, PersistenceError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::replica::merge_updates;
use sync_types::{DiskState, Guid, PersistedState};

/// In-memory persistence.
///
/// Clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    inner: Arc<Mutex<MemoryPersistenceInner>>,
}

#[derive(Debug, Default)]
struct MemoryPersistenceInner {
    vault_id: String,
    states: HashMap<Guid, PersistedState>,
    updates: HashMap<String, Vec<Vec<u8>>>,
    disk: HashMap<String, DiskState>,
    save_count: usize,
    fail_next_load: Option<String>,
    fail_next_save: Option<String>,
}

impl MemoryPersistence {
    /// Create empty storage for `vault_id`.
    pub fn new(vault_id: &str) -> Self {
        let persistence = Self::default();
        persistence.lock().vault_id = vault_id.to_string();
        persistence
    }

    fn lock(&self) -> MutexGuard<'_, MemoryPersistenceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a file on the simulated disk.
    pub fn set_disk(&self, path: &str, contents: &str, mtime: i64) {
        self.lock()
            .disk
            .insert(path.to_string(), DiskState::new(contents, mtime));
    }

    /// Insert a record directly, bypassing `save_state`.
    pub fn insert_state(&self, state: PersistedState) {
        self.lock().states.insert(state.guid.clone(), state);
    }

    /// The saved record for `guid`.
    pub fn state(&self, guid: &Guid) -> Option<PersistedState> {
        self.lock().states.get(guid).cloned()
    }

    /// Number of entries in the update log `db_name`.
    pub fn update_count(&self, db_name: &str) -> usize {
        self.lock().updates.get(db_name).map_or(0, Vec::len)
    }

    /// Number of successful `save_state` calls.
    pub fn save_count(&self) -> usize {
        self.lock().save_count
    }

    /// Cause the next load (state or updates) to fail with the given error.
    pub fn fail_next_load(&self, error: &str) {
        self.lock().fail_next_load = Some(error.to_string());
    }

    /// Cause the next write to fail with the given error.
    pub fn fail_next_save(&self, error: &str) {
        self.lock().fail_next_save = Some(error.to_string());
    }

    fn check_load(&self) -> Result<(), PersistenceError> {
        match self.lock().fail_next_load.take() {
            Some(error) => Err(PersistenceError::Unavailable(error)),
            None => Ok(()),
        }
    }

    fn check_save(&self) -> Result<(), PersistenceError> {
        match self.lock().fail_next_save.take() {
            Some(error) => Err(PersistenceError::Unavailable(error)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_state(&self, guid: &Guid) -> Result<Option<PersistedState>, PersistenceError> {
        self.check_load()?;
        Ok(self.lock().states.get(guid).cloned())
    }

    async fn load_all_states(&self) -> Result<Vec<PersistedState>, PersistenceError> {
        self.check_load()?;
        let mut states: Vec<_> = self.lock().states.values().cloned().collect();
        states.sort_by(|a, b| a.guid.cmp(&b.guid));
        Ok(states)
    }

    async fn save_state(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        self.check_save()?;
        let mut inner = self.lock();
        inner.states.insert(state.guid.clone(), state.clone());
        inner.save_count += 1;
        Ok(())
    }

    async fn load_updates(&self, db_name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.check_load()?;
        let Some(log) = self.lock().updates.get(db_name).cloned() else {
            return Ok(None);
        };
        let mut merged: Option<Vec<u8>> = None;
        for update in log {
            merged = Some(match merged {
                None => update,
                Some(acc) => merge_updates(&acc, &update)
                    .map_err(|e| PersistenceError::corrupt(db_name, e))?,
            });
        }
        Ok(merged)
    }

    async fn append_update(&self, db_name: &str, update: &[u8]) -> Result<(), PersistenceError> {
        self.check_save()?;
        self.lock()
            .updates
            .entry(db_name.to_string())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    async fn replace_updates(&self, db_name: &str, state: &[u8]) -> Result<(), PersistenceError> {
        self.check_save()?;
        self.lock()
            .updates
            .insert(db_name.to_string(), vec![state.to_vec()]);
        Ok(())
    }

    async fn get_disk_state(&self, path: &str) -> Result<Option<DiskState>, PersistenceError> {
        Ok(self.lock().disk.get(path).cloned())
    }

    async fn get_vault_id(&self, _guid: &Guid) -> Result<String, PersistenceError> {
        Ok(self.lock().vault_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::Replica;

    // ===========================================
    // MemoryPersistence Tests
    // ===========================================

    #[tokio::test]
    async fn saves_and_loads_state() {
        let persistence = MemoryPersistence::new("vault");
        let guid = Guid::new("doc");
        assert!(persistence.load_state(&guid).await.unwrap().is_none());

        persistence
            .save_state(&PersistedState::new(guid.clone(), "a.md"))
            .await
            .unwrap();

        let loaded = persistence.load_state(&guid).await.unwrap().unwrap();
        assert_eq!(loaded.path, "a.md");
        assert_eq!(persistence.save_count(), 1);
    }

    #[tokio::test]
    async fn update_log_merges_on_load() {
        let persistence = MemoryPersistence::new("vault");
        let mut replica = Replica::with_text("hello");
        persistence
            .append_update("log", &replica.encode_state())
            .await
            .unwrap();
        let (_, update) = replica.set_text("hello world").unwrap();
        persistence.append_update("log", &update).await.unwrap();

        let merged = persistence.load_updates("log").await.unwrap().unwrap();
        assert_eq!(Replica::from_update(&merged).unwrap().text(), "hello world");
        assert_eq!(persistence.update_count("log"), 2);
    }

    #[tokio::test]
    async fn replace_updates_truncates_log() {
        let persistence = MemoryPersistence::new("vault");
        persistence.append_update("log", &[1]).await.unwrap();
        persistence.append_update("log", &[2]).await.unwrap();

        let state = Replica::with_text("fresh").encode_state();
        persistence.replace_updates("log", &state).await.unwrap();

        assert_eq!(persistence.update_count("log"), 1);
        let loaded = persistence.load_updates("log").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn forced_failures_fire_once() {
        let persistence = MemoryPersistence::new("vault");
        persistence.fail_next_load("disk on fire");

        let err = persistence.load_all_states().await.unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
        assert!(persistence.load_all_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_and_vault_are_reported() {
        let persistence = MemoryPersistence::new("vault");
        persistence.set_disk("a.md", "hello", 1000);

        let disk = persistence.get_disk_state("a.md").await.unwrap().unwrap();
        assert!(disk.hash.matches("hello"));
        assert!(persistence.get_disk_state("b.md").await.unwrap().is_none());
        assert_eq!(
            persistence.get_vault_id(&Guid::new("x")).await.unwrap(),
            "vault"
        );
    }
}
