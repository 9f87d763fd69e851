//! JSON-file persistence over a state directory.
//!
//! Layout:
//!
//! ```text
//! <state_dir>/states/<hex guid>.json     PersistedState as JSON
//! <state_dir>/updates/<hex db name>.bin  update log, compacted to one update
//! ```
//!
//! Files are written to a temporary sibling and renamed into place.

use super::{Persistence, PersistenceError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use sync_core::replica::merge_updates;
use sync_types::{DiskState, Guid, PersistedState};
use tokio::fs;

/// Persistence backed by files under a state directory.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    state_dir: PathBuf,
    vault_root: Option<PathBuf>,
    vault_id: String,
}

impl FilePersistence {
    /// Store records under `state_dir` for vault `vault_id`.
    pub fn new(state_dir: impl Into<PathBuf>, vault_id: &str) -> Self {
        Self {
            state_dir: state_dir.into(),
            vault_root: None,
            vault_id: vault_id.to_string(),
        }
    }

    /// Resolve document paths against `root` for `get_disk_state`.
    pub fn with_vault_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.vault_root = Some(root.into());
        self
    }

    /// The state directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn states_dir(&self) -> PathBuf {
        self.state_dir.join("states")
    }

    fn state_path(&self, guid: &Guid) -> PathBuf {
        self.states_dir()
            .join(format!("{}.json", hex::encode(guid.as_str())))
    }

    fn update_path(&self, db_name: &str) -> PathBuf {
        self.state_dir
            .join("updates")
            .join(format!("{}.bin", hex::encode(db_name)))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PersistenceError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistenceError::io(parent, e))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistenceError::io(path, e))
}

fn decode_state(name: &str, bytes: &[u8]) -> Result<PersistedState, PersistenceError> {
    serde_json::from_slice(bytes).map_err(|e| PersistenceError::corrupt(name, e))
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn load_state(&self, guid: &Guid) -> Result<Option<PersistedState>, PersistenceError> {
        match read_optional(&self.state_path(guid)).await? {
            Some(bytes) => decode_state(guid.as_str(), &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn load_all_states(&self) -> Result<Vec<PersistedState>, PersistenceError> {
        let dir = self.states_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&dir, e)),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::io(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .map_err(|e| PersistenceError::io(&path, e))?;
            let name = path.display().to_string();
            match decode_state(&name, &bytes) {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!("skipping unreadable state file: {}", e),
            }
        }
        states.sort_by(|a, b| a.guid.cmp(&b.guid));
        Ok(states)
    }

    async fn save_state(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| PersistenceError::corrupt(state.guid.as_str(), e))?;
        write_atomic(&self.state_path(&state.guid), &json).await
    }

    async fn load_updates(&self, db_name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        read_optional(&self.update_path(db_name)).await
    }

    async fn append_update(&self, db_name: &str, update: &[u8]) -> Result<(), PersistenceError> {
        let path = self.update_path(db_name);
        let merged = match read_optional(&path).await? {
            Some(existing) => {
                merge_updates(&existing, update).map_err(|e| PersistenceError::corrupt(db_name, e))?
            }
            None => update.to_vec(),
        };
        write_atomic(&path, &merged).await
    }

    async fn replace_updates(&self, db_name: &str, state: &[u8]) -> Result<(), PersistenceError> {
        write_atomic(&self.update_path(db_name), state).await
    }

    async fn get_disk_state(&self, path: &str) -> Result<Option<DiskState>, PersistenceError> {
        let Some(root) = &self.vault_root else {
            return Ok(None);
        };
        let full = root.join(path);
        let contents = match fs::read_to_string(&full).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&full, e)),
        };
        let metadata = fs::metadata(&full)
            .await
            .map_err(|e| PersistenceError::io(&full, e))?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |elapsed| elapsed.as_millis() as i64);
        Ok(Some(DiskState::new(contents, mtime)))
    }

    async fn get_vault_id(&self, _guid: &Guid) -> Result<String, PersistenceError> {
        Ok(self.vault_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::Replica;
    use tempfile::TempDir;

    fn persistence(dir: &TempDir) -> FilePersistence {
        FilePersistence::new(dir.path().join("state"), "vault")
    }

    // ===========================================
    // State Records
    // ===========================================

    #[tokio::test]
    async fn state_survives_a_new_instance() {
        let dir = TempDir::new().unwrap();
        let guid = Guid::new("notes/a");
        let mut state = PersistedState::new(guid.clone(), "notes/a.md");
        state.local_state_vector = Some(vec![1, 2, 3]);

        persistence(&dir).save_state(&state).await.unwrap();

        let loaded = persistence(&dir).load_state(&guid).await.unwrap();
        assert_eq!(loaded, Some(state));
    }

    #[tokio::test]
    async fn load_all_reads_every_record() {
        let dir = TempDir::new().unwrap();
        let store = persistence(&dir);
        for name in ["b", "a", "c"] {
            store
                .save_state(&PersistedState::new(Guid::new(name), format!("{}.md", name)))
                .await
                .unwrap();
        }

        let guids: Vec<_> = store
            .load_all_states()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.guid.to_string())
            .collect();
        assert_eq!(guids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = persistence(&dir);
        assert!(store.load_all_states().await.unwrap().is_empty());
        assert!(store.load_state(&Guid::new("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = persistence(&dir);
        let guid = Guid::new("x");
        write_atomic(&store.state_path(&guid), b"not json")
            .await
            .unwrap();

        let err = store.load_state(&guid).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
        // load_all skips it
        assert!(store.load_all_states().await.unwrap().is_empty());
    }

    // ===========================================
    // Update Log
    // ===========================================

    #[tokio::test]
    async fn appended_updates_are_compacted() {
        let dir = TempDir::new().unwrap();
        let store = persistence(&dir);
        let mut replica = Replica::with_text("one");
        store
            .append_update("log", &replica.encode_state())
            .await
            .unwrap();
        let (_, update) = replica.set_text("one two").unwrap();
        store.append_update("log", &update).await.unwrap();

        let loaded = store.load_updates("log").await.unwrap().unwrap();
        assert_eq!(Replica::from_update(&loaded).unwrap().text(), "one two");
    }

    #[tokio::test]
    async fn replace_overwrites_log() {
        let dir = TempDir::new().unwrap();
        let store = persistence(&dir);
        store
            .append_update("log", &Replica::with_text("old").encode_state())
            .await
            .unwrap();
        let fresh = Replica::with_text("new").encode_state();
        store.replace_updates("log", &fresh).await.unwrap();

        assert_eq!(store.load_updates("log").await.unwrap(), Some(fresh));
    }

    // ===========================================
    // Disk
    // ===========================================

    #[tokio::test]
    async fn disk_state_reads_vault_files() {
        let dir = TempDir::new().unwrap();
        let vault = dir.path().join("vault");
        std::fs::create_dir_all(&vault).unwrap();
        std::fs::write(vault.join("a.md"), "hello").unwrap();
        let store = persistence(&dir).with_vault_root(&vault);

        let disk = store.get_disk_state("a.md").await.unwrap().unwrap();
        assert_eq!(disk.contents, "hello");
        assert!(disk.mtime > 0);
        assert!(store.get_disk_state("missing.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_vault_root_means_no_disk() {
        let dir = TempDir::new().unwrap();
        let store = persistence(&dir);
        assert!(store.get_disk_state("a.md").await.unwrap().is_none());
    }
}
