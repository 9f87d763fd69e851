//! CRDT replica wrapper.
//!
//! A [`Replica`] is a `yrs` document with a single text root. The rest of the
//! crate only sees explicit operations: read the text, apply an encoded
//! update, apply positioned changes, encode state or a diff against a state
//! vector. Update and state-vector bytes use the v1 encoding and are opaque
//! to every other module.

use sync_types::PositionedChange;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::merge::diff_changes;

/// Name of the text root every replica stores its contents under.
pub const TEXT_ROOT: &str = "contents";

/// Errors raised by replica operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    /// Update bytes could not be decoded.
    #[error("failed to decode update: {0}")]
    DecodeUpdate(String),

    /// State vector bytes could not be decoded.
    #[error("failed to decode state vector: {0}")]
    DecodeStateVector(String),

    /// A decoded update could not be integrated.
    #[error("failed to apply update: {0}")]
    Apply(String),

    /// Positioned changes did not fit the current text.
    #[error("invalid changes: {0}")]
    InvalidChanges(#[from] sync_types::SyncError),

    /// Update merging failed.
    #[error("failed to merge updates: {0}")]
    Merge(String),
}

/// A live CRDT document holding one text.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a replica from an encoded update (typically a full state).
    pub fn from_update(update: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new();
        replica.apply_update(update)?;
        Ok(replica)
    }

    /// Create a replica holding `text` as its first insertion.
    pub fn with_text(text: &str) -> Self {
        let replica = Self::new();
        if !text.is_empty() {
            let root = replica.doc.get_or_insert_text(TEXT_ROOT);
            let mut txn = replica.doc.transact_mut();
            root.insert(&mut txn, 0, text);
        }
        replica
    }

    /// Materialize the current text.
    pub fn text(&self) -> String {
        let root = self.doc.get_or_insert_text(TEXT_ROOT);
        let txn = self.doc.transact();
        root.get_string(&txn)
    }

    /// Encoded state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Encode the full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode everything this replica has that `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = decode_state_vector(state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Apply an encoded update. Returns whether the replica changed.
    ///
    /// Deletions do not advance the state vector, so the text is compared
    /// too. Applying the same update twice is a no-op the second time.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<bool, ReplicaError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| ReplicaError::DecodeUpdate(e.to_string()))?;
        let before = (self.state_vector(), self.text());
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        Ok(self.state_vector() != before.0 || self.text() != before.1)
    }

    /// Apply editor changes positioned against the current text.
    ///
    /// Returns the encoded update produced by the edit.
    pub fn apply_changes(&mut self, changes: &[PositionedChange]) -> Result<Vec<u8>, ReplicaError> {
        let current = self.text();
        PositionedChange::check_batch(&current, changes)?;
        let before = self.doc.transact().state_vector();
        let root = self.doc.get_or_insert_text(TEXT_ROOT);
        {
            let mut txn = self.doc.transact_mut();
            // Back to front so earlier offsets stay valid.
            for change in changes.iter().rev() {
                if change.to > change.from {
                    root.remove_range(&mut txn, offset(change.from), offset(change.to - change.from));
                }
                if !change.insert.is_empty() {
                    root.insert(&mut txn, offset(change.from), &change.insert);
                }
            }
        }
        Ok(self.doc.transact().encode_diff_v1(&before))
    }

    /// Rewrite the text to `target` with a minimal diff.
    ///
    /// Returns the changes (positioned against the old text) and the encoded
    /// update they produced.
    pub fn set_text(
        &mut self,
        target: &str,
    ) -> Result<(Vec<PositionedChange>, Vec<u8>), ReplicaError> {
        let changes = diff_changes(&self.text(), target);
        let update = self.apply_changes(&changes)?;
        Ok((changes, update))
    }

    /// Whether this replica holds history not covered by `state_vector`.
    pub fn has_history_beyond(&self, state_vector: &[u8]) -> Result<bool, ReplicaError> {
        state_vector_has_news(&self.state_vector(), state_vector)
    }

    /// A fresh replica (new client id) with the same history.
    pub fn fork(&self) -> Result<Self, ReplicaError> {
        Self::from_update(&self.encode_state())
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("client_id", &self.doc.client_id())
            .finish_non_exhaustive()
    }
}

fn offset(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, ReplicaError> {
    if bytes.is_empty() {
        return Ok(StateVector::default());
    }
    StateVector::decode_v1(bytes).map_err(|e| ReplicaError::DecodeStateVector(e.to_string()))
}

/// Whether `candidate` records any clock ahead of `baseline`.
pub fn state_vector_has_news(candidate: &[u8], baseline: &[u8]) -> Result<bool, ReplicaError> {
    let candidate = decode_state_vector(candidate)?;
    let baseline = decode_state_vector(baseline)?;
    Ok(candidate
        .iter()
        .any(|(client, clock)| *clock > baseline.get(client)))
}

/// Encoded state vector of an encoded update, without keeping a live replica.
pub fn state_vector_of(update: &[u8]) -> Result<Vec<u8>, ReplicaError> {
    Ok(Replica::from_update(update)?.state_vector())
}

/// Text of an encoded update, without keeping a live replica.
pub fn text_of(update: &[u8]) -> Result<String, ReplicaError> {
    Ok(Replica::from_update(update)?.text())
}

/// Compact two encoded updates into one.
///
/// Used to accumulate inbound updates for documents with no live replica:
/// successive updates are merged rather than appended.
pub fn merge_updates(first: &[u8], second: &[u8]) -> Result<Vec<u8>, ReplicaError> {
    yrs::merge_updates_v1(&[first, second]).map_err(|e| ReplicaError::Merge(e.to_string()))
}
