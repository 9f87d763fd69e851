//! # sync-core
//!
//! Pure logic for trisync (no I/O, instant tests).
//!
//! This crate implements the reconciliation machinery for a document that
//! lives in three places at once: the editor, the file on disk and the
//! collaborative replica shared with other peers.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. State machines emit [`MergeEffect`]s and invoke
//! futures instead of touching disk or network. This enables:
//! - Instant unit tests (no mocks, no runtime)
//! - Deterministic behavior (same events, same effects)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (persistence, timers, editor dispatch) is performed by
//! `sync-client`, which interprets the effects produced here.
//!
//! ## Modules
//!
//! - [`hsm`] - Hierarchical state machine interpreter
//! - [`document`] - The per-document reconciliation chart
//! - [`merge`] - Two-way and three-way text merges
//! - [`replica`] - CRDT replica wrapper
//! - [`invariants`] - Optional runtime invariant checker
//! - [`wake_queue`] - Priority queue bounding warm documents

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod hsm;
pub mod invariants;
pub mod merge;
pub mod replica;
pub mod wake_queue;

pub use document::{
    ConflictState, DocumentError, DocumentMachine, MergeEffect, MergeEvent, MergeState,
};
pub use invariants::{CheckerConfig, CheckerMode, InvariantChecker, InvariantViolation, Severity};
pub use merge::{
    diff_changes, three_way_merge, three_way_merge_guarded, two_way_merge, ConflictRegion,
    MergeResult,
};
pub use replica::{Replica, ReplicaError};
pub use wake_queue::{Enqueued, WakePriority, WakeQueue, WakeQueueError, WakeRequest};
