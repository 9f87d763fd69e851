//! Reconciliation bookkeeping shared by the state machine, the pool manager
//! and persistence collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ContentHash, Guid};

/// Fingerprint of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Hash of the file contents.
    pub hash: ContentHash,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
}

impl Metadata {
    /// Create metadata for `contents` modified at `mtime`.
    pub fn for_contents(contents: &str, mtime: i64) -> Self {
        Self {
            hash: ContentHash::of(contents),
            mtime,
        }
    }
}

/// Last common ancestor: the last point at which disk, local and remote were
/// known to be identical.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LcaState {
    /// Document text at that point.
    pub contents: String,
    /// Disk fingerprint at that point.
    pub meta: Metadata,
    /// Encoded local state vector at that point.
    #[serde(with = "crate::serde_bytes")]
    pub state_vector: Vec<u8>,
}

impl fmt::Debug for LcaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LcaState")
            .field("contents", &format!("[{} bytes]", self.contents.len()))
            .field("meta", &self.meta)
            .field("state_vector", &format!("[{} bytes]", self.state_vector.len()))
            .finish()
    }
}

/// Deferred-reconciliation marker.
///
/// Created when a disk edit is ingested into the local replica before the
/// network replica is confirmed fresh. `base` is the local text immediately
/// before the ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkState {
    /// Local text snapshot taken before the disk edit was applied.
    pub base: String,
}

/// A conflict the user chose to defer. The same hash pair is not re-prompted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeferredConflict {
    /// Hash of the disk side of the conflict.
    pub disk_hash: ContentHash,
    /// Hash of the local side of the conflict.
    pub local_hash: ContentHash,
}

/// Contents and fingerprint of a file as reported by the disk collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskState {
    /// File contents.
    pub contents: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
    /// Hash of `contents`.
    pub hash: ContentHash,
}

impl DiskState {
    /// Build a disk state, hashing the contents.
    pub fn new(contents: impl Into<String>, mtime: i64) -> Self {
        let contents = contents.into();
        let hash = ContentHash::of(&contents);
        Self {
            contents,
            mtime,
            hash,
        }
    }

    /// The metadata half of this disk state.
    pub fn meta(&self) -> Metadata {
        Metadata {
            hash: self.hash.clone(),
            mtime: self.mtime,
        }
    }
}

/// Per-document record written by `PERSIST_STATE` and read back by
/// `loadState` / `loadAllStates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Document identifier.
    pub guid: Guid,
    /// Vault-relative path of the file.
    pub path: String,
    /// Last common ancestor, if the replicas were ever reconciled.
    #[serde(default)]
    pub lca: Option<LcaState>,
    /// Last known disk fingerprint.
    #[serde(default)]
    pub disk: Option<Metadata>,
    /// Encoded local state vector.
    #[serde(default, with = "crate::serde_bytes::option")]
    pub local_state_vector: Option<Vec<u8>>,
    /// Encoded remote state vector.
    #[serde(default, with = "crate::serde_bytes::option")]
    pub remote_state_vector: Option<Vec<u8>>,
    /// Pending fork, if a disk edit awaits reconciliation.
    #[serde(default)]
    pub fork: Option<ForkState>,
    /// Conflict the user deferred.
    #[serde(default)]
    pub deferred_conflict: Option<DeferredConflict>,
}

impl PersistedState {
    /// An empty record for a document that was never reconciled.
    pub fn new(guid: Guid, path: impl Into<String>) -> Self {
        Self {
            guid,
            path: path.into(),
            lca: None,
            disk: None,
            local_state_vector: None,
            remote_state_vector: None,
            fork: None,
            deferred_conflict: None,
        }
    }

    /// Derive a sync status from hashes and state vectors alone.
    ///
    /// Used to report status for documents that have no live machine.
    pub fn status(&self) -> SyncStatus {
        if self.deferred_conflict.is_some() {
            return SyncStatus::Conflict;
        }
        if self.fork.is_some() {
            return SyncStatus::Pending;
        }
        let Some(lca) = &self.lca else {
            return if self.disk.is_none() {
                SyncStatus::Synced
            } else {
                SyncStatus::Pending
            };
        };
        let disk_matches = self
            .disk
            .as_ref()
            .map_or(true, |disk| disk.hash == lca.meta.hash);
        let local_matches = self
            .local_state_vector
            .as_ref()
            .map_or(true, |sv| *sv == lca.state_vector);
        let remote_matches = self
            .remote_state_vector
            .as_ref()
            .map_or(true, |sv| *sv == lca.state_vector);
        if disk_matches && local_matches && remote_matches {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        }
    }
}

/// Read-only projection of a document's reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// All replicas agree.
    Synced,
    /// A replica moved and reconciliation has not finished.
    Pending,
    /// Replicas disagree in a way the user must resolve.
    Conflict,
    /// A collaborator reported an error.
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lca(contents: &str, sv: &[u8]) -> LcaState {
        LcaState {
            contents: contents.to_string(),
            meta: Metadata::for_contents(contents, 1000),
            state_vector: sv.to_vec(),
        }
    }

    #[test]
    fn fresh_document_is_synced() {
        let state = PersistedState::new(Guid::from("a"), "a.md");
        assert_eq!(state.status(), SyncStatus::Synced);
    }

    #[test]
    fn untracked_disk_file_is_pending() {
        let mut state = PersistedState::new(Guid::from("a"), "a.md");
        state.disk = Some(Metadata::for_contents("hello", 1));
        assert_eq!(state.status(), SyncStatus::Pending);
    }

    #[test]
    fn matching_lca_is_synced() {
        let mut state = PersistedState::new(Guid::from("a"), "a.md");
        state.lca = Some(lca("hello", &[1, 2]));
        state.disk = Some(Metadata::for_contents("hello", 2000));
        state.local_state_vector = Some(vec![1, 2]);
        state.remote_state_vector = Some(vec![1, 2]);
        assert_eq!(state.status(), SyncStatus::Synced);
    }

    #[test]
    fn moved_disk_is_pending() {
        let mut state = PersistedState::new(Guid::from("a"), "a.md");
        state.lca = Some(lca("hello", &[1]));
        state.disk = Some(Metadata::for_contents("hello!", 2000));
        assert_eq!(state.status(), SyncStatus::Pending);
    }

    #[test]
    fn deferred_conflict_wins() {
        let mut state = PersistedState::new(Guid::from("a"), "a.md");
        state.fork = Some(ForkState {
            base: "x".to_string(),
        });
        state.deferred_conflict = Some(DeferredConflict {
            disk_hash: ContentHash::of("d"),
            local_hash: ContentHash::of("l"),
        });
        assert_eq!(state.status(), SyncStatus::Conflict);
    }

    #[test]
    fn persisted_state_json_roundtrip() {
        let mut state = PersistedState::new(Guid::from("doc-1"), "notes/doc.md");
        state.lca = Some(lca("hello", &[7, 8, 9]));
        state.local_state_vector = Some(vec![7, 8, 9]);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"state_vector\":\"BwgJ\""));
        let back: PersistedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn persisted_state_missing_fields_default() {
        let json = r#"{"guid":"g","path":"g.md"}"#;
        let state: PersistedState = serde_json::from_str(json).unwrap();
        assert!(state.lca.is_none());
        assert!(state.local_state_vector.is_none());
    }

    #[test]
    fn lca_debug_redacts_contents() {
        let debug = format!("{:?}", lca("secret text", &[1]));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[11 bytes]"));
    }
}
