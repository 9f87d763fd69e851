//! Persistence abstraction for trisync.
//!
//! The document machine never touches storage. It emits effects
//! (`PERSIST_STATE`, `PERSIST_UPDATES`, `REPLACE_UPDATES`) that the document
//! actor applies through this trait, and it is fed persisted state back
//! through `PERSISTENCE_LOADED`.
//!
//! # Design
//!
//! The trait is async and keyed by document:
//! - `load_state()` / `save_state()` - per-document reconciliation record
//! - `load_all_states()` - every record, for status without instantiation
//! - `load_updates()` / `append_update()` / `replace_updates()` - local CRDT update log
//! - `get_disk_state()` - current file contents for a path
//! - `get_vault_id()` - vault namespace used to name update logs
//!
//! # Example
//!
//! ```ignore
//! let persistence = MemoryPersistence::new("vault");
//! persistence.save_state(&PersistedState::new(guid.clone(), "a.md")).await?;
//! let state = persistence.load_state(&guid).await?;
//! ```

mod file;
mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

use std::path::PathBuf;

use async_trait::async_trait;
use sync_types::{DiskState, Guid, PersistedState};
use thiserror::Error;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded.
    #[error("corrupt record {name}: {reason}")]
    Corrupt {
        /// Record name (guid or log name).
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// The backend refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Storage collaborator for document machines and the pool manager.
///
/// Implementations must be safe to share between document actors.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Load the reconciliation record for `guid`, if one was saved.
    async fn load_state(&self, guid: &Guid) -> Result<Option<PersistedState>, PersistenceError>;

    /// Load every saved record.
    async fn load_all_states(&self) -> Result<Vec<PersistedState>, PersistenceError>;

    /// Save (replace) the record for `state.guid`.
    async fn save_state(&self, state: &PersistedState) -> Result<(), PersistenceError>;

    /// Load the local update log as a single merged update.
    ///
    /// Returns `None` when nothing was ever appended.
    async fn load_updates(&self, db_name: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Append one update to the log.
    async fn append_update(&self, db_name: &str, update: &[u8]) -> Result<(), PersistenceError>;

    /// Replace the whole log with one encoded state.
    async fn replace_updates(&self, db_name: &str, state: &[u8]) -> Result<(), PersistenceError>;

    /// Read the file at `path`, if it exists.
    async fn get_disk_state(&self, path: &str) -> Result<Option<DiskState>, PersistenceError>;

    /// Vault namespace for `guid`.
    async fn get_vault_id(&self, guid: &Guid) -> Result<String, PersistenceError>;
}

/// Name of the local update log for `guid` within `vault_id`.
pub fn update_log_name(vault_id: &str, guid: &Guid) -> String {
    format!("{}-doc-{}", vault_id, guid)
}
