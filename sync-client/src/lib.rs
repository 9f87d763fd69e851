//! # sync-client
//!
//! Async runtime for trisync document machines.
//!
//! This is the library that hosts embed to keep an editor, the files on disk
//! and a collaborative replica reconciled.
//!
//! ## Features
//!
//! - **Document Actors**: One task per live document; events and invoke
//!   completions are processed strictly one at a time
//! - **Pool Management**: Bounded warm set with a priority wake queue and
//!   idle hibernation
//! - **Hibernated Buffering**: Remote updates for sleeping documents are
//!   compacted and delivered on wake
//! - **Pluggable Persistence**: In-memory and JSON-file backends behind one
//!   async trait
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{MemoryPersistence, PoolConfig, PoolManager};
//! use sync_core::WakePriority;
//!
//! let (pool, mut effects) = PoolManager::new(PoolConfig::default(), MemoryPersistence::new("vault"));
//! pool.register(guid.clone(), "notes/today.md");
//!
//! // Remote activity wakes the document through the queue
//! pool.enqueue_wake(&guid, WakePriority::Normal, Some(update)).await?;
//!
//! // Apply WRITE_DISK, DISPATCH_CM6, SYNC_TO_REMOTE in the host
//! while let Some(effect) = effects.recv().await {
//!     host.apply(effect);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod document;
pub mod persistence;
pub mod pool;

pub use config::PoolConfig;
pub use document::{DocumentEffect, DocumentHandle, DocumentSnapshot};
pub use persistence::{
    update_log_name, FilePersistence, MemoryPersistence, Persistence, PersistenceError,
};
pub use pool::{PoolError, PoolManager, Residency, MAX_QUEUED_WAKES};
