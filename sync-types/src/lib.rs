//! # sync-types
//!
//! Shared data model for trisync, the three-replica document reconciler.
//!
//! This crate provides the foundational types used across all trisync crates:
//! - [`Guid`], [`ContentHash`], [`Metadata`] - Identity and content fingerprints
//! - [`LcaState`], [`ForkState`], [`DeferredConflict`] - Reconciliation bookkeeping
//! - [`PersistedState`], [`DiskState`] - Shapes exchanged with persistence collaborators
//! - [`PositionedChange`] - Editor-facing text changes
//! - [`SyncStatus`] - Read-only projection for observers
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod change;
mod error;
mod ids;
mod state;

pub mod serde_bytes;

pub use change::PositionedChange;
pub use error::SyncError;
pub use ids::{ContentHash, Guid};
pub use state::{
    DeferredConflict, DiskState, ForkState, LcaState, Metadata, PersistedState, SyncStatus,
};
