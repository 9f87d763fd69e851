//! Events consumed and effects produced by a document machine.

use sync_types::{ContentHash, DiskState, Guid, PersistedState, PositionedChange, SyncStatus};

use crate::hsm::Event;
use crate::merge::{ConflictRegion, PositionedRegion};

/// Inputs to a document machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeEvent {
    /// Start tracking a document.
    Load {
        /// Document identifier.
        guid: Guid,
        /// Vault-relative path.
        path: String,
    },
    /// Stop tracking the document.
    Unload,
    /// An editor opened the document.
    AcquireLock {
        /// Text the editor is showing.
        editor_content: String,
    },
    /// The editor closed the document.
    ReleaseLock,
    /// The file changed on disk.
    DiskChanged {
        /// New file contents.
        contents: String,
        /// Modification time (ms since epoch).
        mtime: i64,
        /// Hash of `contents`.
        hash: ContentHash,
    },
    /// An update arrived from the network replica.
    RemoteUpdate {
        /// Encoded CRDT update.
        update: Vec<u8>,
    },
    /// A `WriteDisk` effect finished.
    SaveComplete {
        /// Modification time after the write.
        mtime: i64,
        /// Hash of what was written.
        hash: ContentHash,
    },
    /// The editor changed its text.
    Cm6Change {
        /// Changes positioned against the previous editor text.
        changes: Vec<PositionedChange>,
        /// Editor text after the changes.
        doc_text: String,
        /// The change echoes a `DispatchCm6` this machine emitted.
        is_from_replica: bool,
    },
    /// The network transport connected.
    Connected,
    /// The network transport disconnected.
    Disconnected,
    /// The network replica caught up with its peers.
    ProviderSynced,
    /// Resolve the conflict with the disk side.
    ResolveAcceptDisk,
    /// Resolve the conflict with the local side.
    ResolveAcceptLocal,
    /// Resolve the conflict with externally merged text.
    ResolveAcceptMerged {
        /// Merged text.
        contents: String,
    },
    /// Defer the conflict without resolving it.
    DismissConflict,
    /// The user opened the diff view.
    OpenDiffView,
    /// The user closed the diff view without resolving.
    Cancel,
    /// Persistence finished loading.
    PersistenceLoaded {
        /// Persisted record, if any.
        state: Option<PersistedState>,
        /// Persisted local replica updates, if any.
        updates: Option<Vec<u8>>,
    },
    /// Compare the editor text against the local replica.
    CheckDrift,
    /// A collaborator failed.
    Error {
        /// Description of the failure.
        error: String,
    },
    /// An invoke finished.
    InvokeDone(InvokeOutput),
    /// An invoke failed.
    InvokeFailed {
        /// Description of the failure.
        error: String,
    },
}

impl Event for MergeEvent {
    fn kind(&self) -> &'static str {
        match self {
            MergeEvent::Load { .. } => "LOAD",
            MergeEvent::Unload => "UNLOAD",
            MergeEvent::AcquireLock { .. } => "ACQUIRE_LOCK",
            MergeEvent::ReleaseLock => "RELEASE_LOCK",
            MergeEvent::DiskChanged { .. } => "DISK_CHANGED",
            MergeEvent::RemoteUpdate { .. } => "REMOTE_UPDATE",
            MergeEvent::SaveComplete { .. } => "SAVE_COMPLETE",
            MergeEvent::Cm6Change { .. } => "CM6_CHANGE",
            MergeEvent::Connected => "CONNECTED",
            MergeEvent::Disconnected => "DISCONNECTED",
            MergeEvent::ProviderSynced => "PROVIDER_SYNCED",
            MergeEvent::ResolveAcceptDisk => "RESOLVE_ACCEPT_DISK",
            MergeEvent::ResolveAcceptLocal => "RESOLVE_ACCEPT_LOCAL",
            MergeEvent::ResolveAcceptMerged { .. } => "RESOLVE_ACCEPT_MERGED",
            MergeEvent::DismissConflict => "DISMISS_CONFLICT",
            MergeEvent::OpenDiffView => "OPEN_DIFF_VIEW",
            MergeEvent::Cancel => "CANCEL",
            MergeEvent::PersistenceLoaded { .. } => "PERSISTENCE_LOADED",
            MergeEvent::CheckDrift => "CHECK_DRIFT",
            MergeEvent::Error { .. } => "ERROR",
            MergeEvent::InvokeDone(_) => "done.invoke",
            MergeEvent::InvokeFailed { .. } => "error.invoke",
        }
    }
}

impl MergeEvent {
    /// `DiskChanged` with the hash computed from `contents`.
    pub fn disk_changed(contents: impl Into<String>, mtime: i64) -> Self {
        let disk = DiskState::new(contents, mtime);
        MergeEvent::DiskChanged {
            contents: disk.contents,
            mtime: disk.mtime,
            hash: disk.hash,
        }
    }
}

/// Result of an invoke, carried back by [`MergeEvent::InvokeDone`].
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutput {
    /// Nothing needed doing.
    Unchanged,
    /// Disk contents were written into the local replica under a fork.
    Ingested {
        /// Local text before the ingest (kept if a fork already existed).
        fork_base: String,
        /// Full local replica state after the ingest.
        local_state: Vec<u8>,
        /// Update produced by the ingest.
        update: Vec<u8>,
        /// The ingested disk state.
        disk: DiskState,
    },
    /// Replicas were reconciled.
    Reconciled(Reconciled),
    /// A merge found conflicting hunks.
    Conflicted(Conflicted),
    /// A text-level merge for a live session.
    Merged {
        /// Merged text.
        text: String,
    },
    /// Unload cleanup finished.
    Cleaned {
        /// Whether disk and local text agree, so the ancestor can advance.
        disk_matches_local: bool,
        /// Local text at cleanup time.
        contents: String,
    },
}

/// Reconciled replica states.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// Text every replica now holds.
    pub contents: String,
    /// Full local replica state.
    pub local_state: Vec<u8>,
    /// Update to append to the local update log (unused when `rebuilt`).
    pub local_update: Vec<u8>,
    /// The local replica was rebuilt on top of remote history; its persisted
    /// log must be replaced rather than appended to.
    pub rebuilt: bool,
    /// Full remote replica state.
    pub remote_state: Vec<u8>,
    /// Update to send to the network.
    pub remote_update: Vec<u8>,
    /// A fork was consumed by this reconciliation.
    pub fork_cleared: bool,
}

/// A conflicting reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflicted {
    /// The conflict.
    pub conflict: ConflictState,
    /// Replica states to adopt before surfacing the conflict, when the
    /// invoke changed them.
    pub replicas: Option<Reconciled>,
    /// A fork was consumed by this reconciliation.
    pub fork_cleared: bool,
}

/// An unresolved conflict between the local replica and a competing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictState {
    /// Common ancestor text.
    pub base: String,
    /// Local replica side.
    pub local: String,
    /// Competing side (disk contents or remote text).
    pub other: String,
    /// Whether `other` is the disk side.
    pub other_is_disk: bool,
    /// Local and remote replicas hold independent histories; they must not
    /// be unioned until the conflict is resolved.
    pub divergent: bool,
    /// Conflicting hunks.
    pub regions: Vec<ConflictRegion>,
}

impl ConflictState {
    /// Text on the disk side of the conflict.
    pub fn disk_text(&self) -> &str {
        if self.other_is_disk {
            &self.other
        } else {
            &self.local
        }
    }

    /// Hash pair used to recognize a deferred conflict.
    pub fn hashes(&self) -> (ContentHash, ContentHash) {
        (ContentHash::of(self.disk_text()), ContentHash::of(&self.local))
    }
}

/// Outputs of a document machine, consumed by external collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeEffect {
    /// Push changes to the editor.
    DispatchCm6 {
        /// Changes positioned against the editor's current text.
        changes: Vec<PositionedChange>,
    },
    /// Write the file.
    WriteDisk {
        /// Vault-relative path.
        path: String,
        /// New contents.
        contents: String,
    },
    /// Send an update to the network replica.
    SyncToRemote {
        /// Encoded CRDT update.
        update: Vec<u8>,
    },
    /// Persist the document record.
    PersistState {
        /// Document identifier.
        guid: Guid,
        /// Record to store.
        state: PersistedState,
    },
    /// Append an update to the local replica's log.
    PersistUpdates {
        /// Update log name.
        db_name: String,
        /// Encoded CRDT update.
        update: Vec<u8>,
    },
    /// Replace the local replica's log with a full state.
    ReplaceUpdates {
        /// Update log name.
        db_name: String,
        /// Encoded full state.
        state: Vec<u8>,
    },
    /// The derived status changed.
    StatusChanged {
        /// Document identifier.
        guid: Guid,
        /// New status.
        status: SyncStatus,
    },
    /// Highlight conflicting regions in the editor.
    ShowConflictDecorations {
        /// Regions positioned against the editor text.
        regions: Vec<PositionedRegion>,
    },
    /// Remove conflict highlights.
    HideConflictDecorations,
}

impl MergeEffect {
    /// Wire-style name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MergeEffect::DispatchCm6 { .. } => "DISPATCH_CM6",
            MergeEffect::WriteDisk { .. } => "WRITE_DISK",
            MergeEffect::SyncToRemote { .. } => "SYNC_TO_REMOTE",
            MergeEffect::PersistState { .. } => "PERSIST_STATE",
            MergeEffect::PersistUpdates { .. } => "PERSIST_UPDATES",
            MergeEffect::ReplaceUpdates { .. } => "REPLACE_UPDATES",
            MergeEffect::StatusChanged { .. } => "STATUS_CHANGED",
            MergeEffect::ShowConflictDecorations { .. } => "SHOW_CONFLICT_DECORATIONS",
            MergeEffect::HideConflictDecorations => "HIDE_CONFLICT_DECORATIONS",
        }
    }
}
