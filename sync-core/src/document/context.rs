//! Per-document reconciliation state.

use std::collections::VecDeque;

use sync_types::{
    ContentHash, DeferredConflict, DiskState, ForkState, Guid, LcaState, Metadata,
    PersistedState, PositionedChange,
};

use super::events::{ConflictState, MergeEffect, MergeEvent};
use crate::merge::diff_changes;
use crate::replica::{state_vector_has_news, Replica};

/// Everything a document machine knows about its document.
///
/// Owned exclusively by one machine. Live replicas exist only while an
/// editor holds the lock; idle documents keep encoded bytes instead.
#[derive(Debug, Default)]
pub struct MergeState {
    /// Document identifier.
    pub guid: Guid,
    /// Vault-relative path.
    pub path: String,
    /// Name of the local update log.
    pub db_name: String,
    /// Last common ancestor.
    pub lca: Option<LcaState>,
    /// Last known disk fingerprint.
    pub disk: Option<Metadata>,
    /// Encoded local state vector.
    pub local_state_vector: Option<Vec<u8>>,
    /// Encoded remote state vector.
    pub remote_state_vector: Option<Vec<u8>>,
    /// Current leaf state, as of the last processed event.
    pub state_path: String,
    /// Last collaborator error.
    pub error: Option<String>,
    /// Conflict the user chose not to resolve yet.
    pub deferred_conflict: Option<DeferredConflict>,
    /// Pending fork.
    pub fork: Option<ForkState>,
    /// Network transport connected.
    pub is_online: bool,
    /// Text the editor last reported (or was sent).
    pub last_known_editor_text: Option<String>,
    /// Editor text supplied with the lock, awaiting reconciliation.
    pub pending_editor_content: Option<String>,

    /// Network replica confirmed fresh since the last connect.
    pub provider_synced: bool,
    /// Persistence reported in.
    pub persistence_loaded: bool,
    /// Hash of the local text, when known without decoding.
    pub local_hash: Option<ContentHash>,
    /// Encoded local replica while idle.
    pub local_doc: Option<Vec<u8>>,
    /// Encoded remote replica while idle.
    pub remote_doc: Option<Vec<u8>>,
    /// Live local replica while active.
    pub local: Option<Replica>,
    /// Live remote replica while active.
    pub remote: Option<Replica>,
    /// Disk contents not yet absorbed into the local replica.
    pub pending_disk: Option<DiskState>,
    /// Hash of the last contents this machine asked to write.
    pub last_written_hash: Option<ContentHash>,
    /// Unresolved conflict.
    pub conflict: Option<ConflictState>,
    /// The last idle reconciliation ended in a conflict.
    pub idle_conflict: bool,
    /// `UNLOAD` was requested; cleanup ends in `unloaded`.
    pub unload_requested: bool,
    /// Effects not yet collected.
    pub effects: Vec<MergeEffect>,
    /// Events received while waiting, in arrival order.
    pub buffered: VecDeque<MergeEvent>,
}

impl MergeState {
    /// The record persisted for this document.
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            guid: self.guid.clone(),
            path: self.path.clone(),
            lca: self.lca.clone(),
            disk: self.disk.clone(),
            local_state_vector: self.local_state_vector.clone(),
            remote_state_vector: self.remote_state_vector.clone(),
            fork: self.fork.clone(),
            deferred_conflict: self.deferred_conflict.clone(),
        }
    }

    /// Local and remote histories must not be unioned.
    pub fn histories_diverged(&self) -> bool {
        self.fork.is_some() || self.conflict.as_ref().is_some_and(|c| c.divergent)
    }

    /// Ancestor for the next reconciliation.
    pub fn merge_base(&self) -> String {
        if let Some(fork) = &self.fork {
            return fork.base.clone();
        }
        if let Some(conflict) = self.conflict.as_ref().filter(|c| c.divergent) {
            return conflict.base.clone();
        }
        self.lca
            .as_ref()
            .map(|lca| lca.contents.clone())
            .unwrap_or_default()
    }

    /// Current local text: live replica if any, else decoded bytes.
    pub fn local_text(&self) -> Option<String> {
        match &self.local {
            Some(replica) => Some(replica.text()),
            None => self
                .local_doc
                .as_deref()
                .and_then(|bytes| crate::replica::text_of(bytes).ok()),
        }
    }

    pub(crate) fn emit(&mut self, effect: MergeEffect) {
        self.effects.push(effect);
    }

    pub(crate) fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!("{}: {}", self.guid, error);
        self.error = Some(error);
    }

    pub(crate) fn persist_state(&mut self) {
        let state = self.persisted();
        self.emit(MergeEffect::PersistState {
            guid: self.guid.clone(),
            state,
        });
    }

    pub(crate) fn persist_update(&mut self, update: Vec<u8>) {
        if update.is_empty() {
            return;
        }
        self.emit(MergeEffect::PersistUpdates {
            db_name: self.db_name.clone(),
            update,
        });
    }

    pub(crate) fn replace_updates(&mut self, state: Vec<u8>) {
        self.emit(MergeEffect::ReplaceUpdates {
            db_name: self.db_name.clone(),
            state,
        });
    }

    pub(crate) fn sync_to_remote(&mut self, update: Vec<u8>) {
        if update.is_empty() {
            return;
        }
        self.emit(MergeEffect::SyncToRemote { update });
    }

    /// Emit a disk write unless the disk already holds `contents`.
    pub(crate) fn write_disk(&mut self, contents: &str) {
        let hash = ContentHash::of(contents);
        if self.disk.as_ref().is_some_and(|disk| disk.hash == hash) {
            return;
        }
        let mtime = self.disk.as_ref().map_or(0, |disk| disk.mtime);
        self.emit(MergeEffect::WriteDisk {
            path: self.path.clone(),
            contents: contents.to_string(),
        });
        self.last_written_hash = Some(hash.clone());
        self.disk = Some(Metadata { hash, mtime });
    }

    /// Push the replica's text to the editor if it shows something else.
    pub(crate) fn dispatch_to_editor(&mut self, canonical: &str) {
        let editor = self
            .last_known_editor_text
            .clone()
            .unwrap_or_default();
        if editor != canonical {
            let changes: Vec<PositionedChange> = diff_changes(&editor, canonical);
            self.emit(MergeEffect::DispatchCm6 { changes });
        }
        self.last_known_editor_text = Some(canonical.to_string());
    }

    /// Move the ancestor to `contents` at the current local state vector.
    ///
    /// Only valid from idle states and the unload cleanup.
    pub(crate) fn advance_lca(&mut self, contents: &str) {
        let mtime = self.disk.as_ref().map_or(0, |disk| disk.mtime);
        self.lca = Some(LcaState {
            contents: contents.to_string(),
            meta: Metadata::for_contents(contents, mtime),
            state_vector: self.local_state_vector.clone().unwrap_or_default(),
        });
    }

    /// Refresh state vectors (and the local hash) from live replicas.
    pub(crate) fn refresh_vectors(&mut self) {
        if let Some(local) = &self.local {
            self.local_state_vector = Some(local.state_vector());
            self.local_hash = Some(ContentHash::of(&local.text()));
        }
        if let Some(remote) = &self.remote {
            self.remote_state_vector = Some(remote.state_vector());
        }
    }

    /// Which replicas moved away from the ancestor, from hashes and state
    /// vectors alone.
    pub fn deviations(&self) -> Deviations {
        let baseline = self
            .lca
            .as_ref()
            .map(|lca| lca.state_vector.clone())
            .unwrap_or_default();
        let local_sv = self.local_state_vector.clone().unwrap_or_default();
        let local = state_vector_has_news(&local_sv, &baseline).unwrap_or(false);
        let known = if local_sv.is_empty() { &baseline } else { &local_sv };
        let remote = self
            .remote_state_vector
            .as_deref()
            .map(|sv| state_vector_has_news(sv, known).unwrap_or(false))
            .unwrap_or(false);
        let disk = self.pending_disk.is_some();
        Deviations { local, remote, disk }
    }
}

/// Which replicas moved since the last common ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deviations {
    /// Local replica has history the ancestor lacks.
    pub local: bool,
    /// Remote replica has history the local replica lacks.
    pub remote: bool,
    /// Disk holds contents not yet absorbed.
    pub disk: bool,
}

impl Deviations {
    /// Nothing moved.
    pub fn none(&self) -> bool {
        !self.local && !self.remote && !self.disk
    }
}
