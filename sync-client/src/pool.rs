//! PoolManager - a bounded set of live document machines.
//!
//! Every registered document is tracked here, but only a bounded number
//! hold a live [`DocumentHandle`] at any time:
//!
//! ```text
//! hibernated ──wake──► waking ──loaded──► warm ──mark_active──► active
//!      ▲                                   │  ◄────unload────────┘
//!      └──────────── hibernating ◄─────────┘ (idle timeout / hibernate)
//! ```
//!
//! While a document is hibernated, inbound remote updates are compacted
//! into a single buffered update and delivered when it wakes. The pool also
//! keeps a cache of persisted records so LCA and status queries work for
//! documents that have no live machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use serde::Serialize;
use sync_core::replica::merge_updates;
use sync_core::{
    CheckerConfig, DocumentError, DocumentMachine, Enqueued, MergeEvent, ReplicaError,
    WakePriority, WakeQueue, WakeQueueError,
};
use sync_types::{Guid, LcaState, PersistedState, SyncStatus};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::document::{DocumentEffect, DocumentHandle, DocumentSnapshot};
use crate::persistence::{update_log_name, Persistence, PersistenceError};

/// Maximum number of wake requests waiting for a slot.
pub const MAX_QUEUED_WAKES: usize = 10_000;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The guid was never registered.
    #[error("unknown document: {0}")]
    UnknownDocument(Guid),

    /// The document has no running actor.
    #[error("document closed: {0}")]
    DocumentClosed(Guid),

    /// The document already holds an editor lock.
    #[error("document is locked by an editor: {0}")]
    LockConflict(Guid),

    /// The document holds no editor lock.
    #[error("document is not locked: {0}")]
    NotLocked(Guid),

    /// The document is between residencies.
    #[error("document is busy: {0}")]
    Busy(Guid),

    /// Machine construction failed.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Persistence failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Wake queue rejected a request.
    #[error("wake queue error: {0}")]
    Queue(#[from] WakeQueueError),

    /// Buffered updates could not be compacted.
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
}

/// Where a document currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Residency {
    /// No live machine.
    Hibernated,
    /// Machine is being created and loaded.
    Waking,
    /// Live machine, no editor.
    Warm,
    /// Live machine with an editor lock.
    Active,
    /// Live machine is unloading.
    Hibernating,
}

#[derive(Debug)]
struct Slot {
    path: String,
    residency: Residency,
    handle: Option<DocumentHandle>,
    pending: Option<Vec<u8>>,
    timer: Option<JoinHandle<()>>,
    timer_epoch: u64,
}

impl Slot {
    fn new(path: String) -> Self {
        Self {
            path,
            residency: Residency::Hibernated,
            handle: None,
            pending: None,
            timer: None,
            timer_epoch: 0,
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_epoch += 1;
    }
}

struct PoolInner<P> {
    config: PoolConfig,
    checker: CheckerConfig,
    persistence: Arc<P>,
    effects: mpsc::Sender<DocumentEffect>,
    documents: DashMap<Guid, Slot>,
    states: DashMap<Guid, PersistedState>,
    queue: Mutex<WakeQueue>,
    online: AtomicBool,
    expired: mpsc::UnboundedSender<(Guid, u64)>,
}

/// Manages document machines, their hibernation and the wake queue.
///
/// Cloning is cheap; clones share the same pool.
pub struct PoolManager<P: Persistence> {
    inner: Arc<PoolInner<P>>,
}

impl<P: Persistence> Clone for PoolManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Persistence> std::fmt::Debug for PoolManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.inner.config)
            .field("documents", &self.inner.documents.len())
            .finish()
    }
}

impl<P: Persistence> PoolManager<P> {
    /// Create a pool on the current tokio runtime.
    ///
    /// Returns the pool and the receiver for every document's effects.
    pub fn new(config: PoolConfig, persistence: P) -> (Self, mpsc::Receiver<DocumentEffect>) {
        Self::with_checker(config, CheckerConfig::default(), persistence)
    }

    /// Like [`new`](Self::new), running the invariant checker in every
    /// document machine.
    pub fn with_checker(
        config: PoolConfig,
        checker: CheckerConfig,
        persistence: P,
    ) -> (Self, mpsc::Receiver<DocumentEffect>) {
        let (effects, receiver) = mpsc::channel(config.effect_buffer.max(1));
        let (expired, expirations) = mpsc::unbounded_channel();
        let queue = WakeQueue::new(config.max_concurrent_warm, MAX_QUEUED_WAKES);
        let inner = Arc::new(PoolInner {
            config,
            checker,
            persistence: Arc::new(persistence),
            effects,
            documents: DashMap::new(),
            states: DashMap::new(),
            queue: Mutex::new(queue),
            online: AtomicBool::new(false),
            expired,
        });
        tokio::spawn(reap(Arc::downgrade(&inner), expirations));
        (Self { inner }, receiver)
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn queue(&self) -> MutexGuard<'_, WakeQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, guid: &Guid) -> Result<Ref<'_, Guid, Slot>, PoolError> {
        self.inner
            .documents
            .get(guid)
            .ok_or_else(|| PoolError::UnknownDocument(guid.clone()))
    }

    fn slot_mut(&self, guid: &Guid) -> Result<RefMut<'_, Guid, Slot>, PoolError> {
        self.inner
            .documents
            .get_mut(guid)
            .ok_or_else(|| PoolError::UnknownDocument(guid.clone()))
    }

    fn live_handle(&self, guid: &Guid) -> Option<DocumentHandle> {
        self.inner
            .documents
            .get(guid)
            .and_then(|slot| slot.handle.clone())
    }

    // ===========================================
    // Registration
    // ===========================================

    /// Track a document. Returns false if it was already registered.
    pub fn register(&self, guid: Guid, path: impl Into<String>) -> bool {
        let path = path.into();
        match self.inner.documents.entry(guid) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                tracing::debug!("{}: registered at {}", vacant.key(), path);
                vacant.insert(Slot::new(path));
                true
            }
        }
    }

    /// Stop tracking a document, closing its machine if live.
    pub async fn unregister(&self, guid: &Guid) -> Result<(), PoolError> {
        let (_, mut slot) = self
            .inner
            .documents
            .remove(guid)
            .ok_or_else(|| PoolError::UnknownDocument(guid.clone()))?;
        slot.stop_timer();

        let closed = match slot.handle.take() {
            Some(handle) => handle.close().await.map(Some),
            None => Ok(None),
        };
        self.queue().remove(guid);
        tracing::debug!("{}: unregistered", guid);
        self.pump().await;

        if let Some(state) = closed? {
            self.inner.states.insert(guid.clone(), state);
        }
        Ok(())
    }

    /// Whether `guid` is registered.
    pub fn is_registered(&self, guid: &Guid) -> bool {
        self.inner.documents.contains_key(guid)
    }

    /// Current residency of `guid`.
    pub fn residency(&self, guid: &Guid) -> Option<Residency> {
        self.inner.documents.get(guid).map(|slot| slot.residency)
    }

    /// Whether remote updates are buffered for a hibernated document.
    pub fn has_pending(&self, guid: &Guid) -> bool {
        self.inner
            .documents
            .get(guid)
            .is_some_and(|slot| slot.pending.is_some())
    }

    /// Slots held by warm, active and waking documents.
    ///
    /// May exceed `max_concurrent_warm` after direct [`wake`](Self::wake) or
    /// [`mark_active`](Self::mark_active) calls.
    pub fn warm_count(&self) -> usize {
        self.queue().occupied()
    }

    /// Wake requests waiting for a slot.
    pub fn queued_count(&self) -> usize {
        self.queue().len()
    }

    // ===========================================
    // Wake / Hibernate
    // ===========================================

    /// Wake a document now, bypassing the queue.
    ///
    /// Direct wakes are not bounded by `max_concurrent_warm`, so
    /// [`warm_count`](Self::warm_count) can exceed the configured limit.
    /// Queued wakes then wait until enough documents hibernate.
    pub async fn wake(&self, guid: &Guid) -> Result<(), PoolError> {
        {
            let mut slot = self.slot_mut(guid)?;
            match slot.residency {
                Residency::Warm => {
                    self.restart_timer(guid, &mut slot);
                    return Ok(());
                }
                Residency::Active | Residency::Waking => return Ok(()),
                Residency::Hibernating => return Err(PoolError::Busy(guid.clone())),
                Residency::Hibernated => slot.residency = Residency::Waking,
            }
        }
        self.queue().admit(guid);
        if let Err(e) = self.activate(guid).await {
            self.queue().remove(guid);
            return Err(e);
        }
        Ok(())
    }

    /// Request a wake through the priority queue.
    ///
    /// An optional remote update is delivered (or buffered) first. A request
    /// for a document that is already warm only refreshes its idle timer; a
    /// request for a queued document can only raise its priority.
    pub async fn enqueue_wake(
        &self,
        guid: &Guid,
        priority: WakePriority,
        update: Option<Vec<u8>>,
    ) -> Result<Enqueued, PoolError> {
        match update {
            Some(update) => self.remote_update(guid, update)?,
            None if !self.is_registered(guid) => {
                return Err(PoolError::UnknownDocument(guid.clone()))
            }
            None => {}
        }

        let outcome = self.queue().enqueue(guid.clone(), priority)?;
        match outcome {
            Enqueued::AlreadyWarm => self.touch(guid)?,
            Enqueued::Queued | Enqueued::Upgraded => {
                tracing::debug!("{}: wake {:?} at {:?}", guid, outcome, priority)
            }
            Enqueued::Unchanged => {}
        }
        self.pump().await;
        Ok(outcome)
    }

    /// Wake queued documents while slots are free.
    async fn pump(&self) {
        loop {
            let Some(request) = self.queue().dequeue() else {
                break;
            };
            let guid = request.guid;
            let residency = match self.inner.documents.get_mut(&guid) {
                Some(mut slot) => {
                    let current = slot.residency;
                    if current == Residency::Hibernated {
                        slot.residency = Residency::Waking;
                    }
                    Some(current)
                }
                None => None,
            };
            match residency {
                None => {
                    self.queue().remove(&guid);
                    continue;
                }
                Some(Residency::Hibernated) => {}
                Some(_) => {
                    self.queue().complete(&guid);
                    continue;
                }
            }

            match self.activate(&guid).await {
                Ok(()) => {
                    self.queue().complete(&guid);
                }
                Err(e) => {
                    tracing::warn!("{}: wake failed: {}", guid, e);
                    self.queue().fail(&guid);
                    break;
                }
            }
        }
    }

    /// Start a machine for a document marked `Waking`.
    async fn activate(&self, guid: &Guid) -> Result<(), PoolError> {
        let result = self.start_document(guid).await;
        if result.is_err() {
            if let Some(mut slot) = self.inner.documents.get_mut(guid) {
                slot.residency = Residency::Hibernated;
            }
        }
        result
    }

    async fn start_document(&self, guid: &Guid) -> Result<(), PoolError> {
        let path = self.slot(guid)?.path.clone();
        let vault_id = self.inner.persistence.get_vault_id(guid).await?;
        let machine = DocumentMachine::new(guid.clone(), path)?
            .with_db_name(update_log_name(&vault_id, guid))
            .with_checker(self.inner.checker.clone());
        let handle = DocumentHandle::spawn(
            machine,
            Arc::clone(&self.inner.persistence),
            self.inner.effects.clone(),
        );
        handle.load()?;
        if self.inner.online.load(Ordering::SeqCst) {
            handle.send(MergeEvent::Connected)?;
        }

        let Some(mut slot) = self.inner.documents.get_mut(guid) else {
            let _ = handle.close().await;
            return Err(PoolError::UnknownDocument(guid.clone()));
        };
        if let Some(update) = slot.pending.take() {
            handle.send(MergeEvent::RemoteUpdate { update })?;
        }
        slot.handle = Some(handle);
        slot.residency = Residency::Warm;
        self.restart_timer(guid, &mut slot);
        tracing::debug!("{}: woke", guid);
        Ok(())
    }

    /// Unload a warm document's machine and free its slot.
    pub async fn hibernate(&self, guid: &Guid) -> Result<(), PoolError> {
        let handle = {
            let mut slot = self.slot_mut(guid)?;
            match slot.residency {
                Residency::Hibernated | Residency::Hibernating => return Ok(()),
                Residency::Active => return Err(PoolError::LockConflict(guid.clone())),
                Residency::Waking => return Err(PoolError::Busy(guid.clone())),
                Residency::Warm => {}
            }
            slot.stop_timer();
            slot.residency = Residency::Hibernating;
            slot.handle.take()
        };

        let closed = match handle {
            Some(handle) => handle.close().await.map(Some),
            None => Ok(None),
        };
        if let Some(mut slot) = self.inner.documents.get_mut(guid) {
            slot.residency = Residency::Hibernated;
        }
        self.queue().release(guid);
        tracing::debug!("{}: hibernated", guid);
        self.pump().await;

        if let Some(state) = closed? {
            self.inner.states.insert(guid.clone(), state);
        }
        Ok(())
    }

    fn restart_timer(&self, guid: &Guid, slot: &mut Slot) {
        slot.stop_timer();
        let epoch = slot.timer_epoch;
        let expired = self.inner.expired.clone();
        let timeout = self.inner.config.idle_timeout();
        let guid = guid.clone();
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expired.send((guid, epoch));
        }));
    }

    fn timer_current(&self, guid: &Guid, epoch: u64) -> bool {
        self.inner
            .documents
            .get(guid)
            .is_some_and(|slot| slot.residency == Residency::Warm && slot.timer_epoch == epoch)
    }

    /// Record activity on a warm document, postponing hibernation.
    pub fn touch(&self, guid: &Guid) -> Result<(), PoolError> {
        let mut slot = self.slot_mut(guid)?;
        if slot.residency == Residency::Warm {
            self.restart_timer(guid, &mut slot);
        }
        Ok(())
    }

    // ===========================================
    // Editor Lock
    // ===========================================

    /// Wake the document if needed and acquire the editor lock.
    ///
    /// Wakes directly like [`wake`](Self::wake), ignoring the warm limit.
    /// The idle timer is suspended until [`unload`](Self::unload).
    pub async fn mark_active(
        &self,
        guid: &Guid,
        editor_content: impl Into<String>,
    ) -> Result<(), PoolError> {
        self.wake(guid).await?;
        let handle = {
            let mut slot = self.slot_mut(guid)?;
            match slot.residency {
                Residency::Warm => {}
                Residency::Active => return Err(PoolError::LockConflict(guid.clone())),
                _ => return Err(PoolError::Busy(guid.clone())),
            }
            let handle = slot
                .handle
                .clone()
                .ok_or_else(|| PoolError::DocumentClosed(guid.clone()))?;
            slot.stop_timer();
            slot.residency = Residency::Active;
            handle
        };
        handle.send(MergeEvent::AcquireLock {
            editor_content: editor_content.into(),
        })?;
        tracing::info!("{}: editor lock acquired", guid);
        Ok(())
    }

    /// Release the editor lock. The document stays warm until idle.
    pub fn unload(&self, guid: &Guid) -> Result<(), PoolError> {
        let mut slot = self.slot_mut(guid)?;
        if slot.residency != Residency::Active {
            return Err(PoolError::NotLocked(guid.clone()));
        }
        let handle = slot
            .handle
            .clone()
            .ok_or_else(|| PoolError::DocumentClosed(guid.clone()))?;
        handle.send(MergeEvent::ReleaseLock)?;
        slot.residency = Residency::Warm;
        self.restart_timer(guid, &mut slot);
        tracing::info!("{}: editor lock released", guid);
        Ok(())
    }

    // ===========================================
    // Events
    // ===========================================

    /// Deliver a remote update, or buffer it while the document hibernates.
    ///
    /// Buffered updates are merged into one, not appended.
    pub fn remote_update(&self, guid: &Guid, update: Vec<u8>) -> Result<(), PoolError> {
        let mut slot = self.slot_mut(guid)?;
        if let Some(handle) = slot.handle.clone() {
            if slot.residency == Residency::Warm {
                self.restart_timer(guid, &mut slot);
            }
            return handle.send(MergeEvent::RemoteUpdate { update });
        }
        let compacted = match &slot.pending {
            Some(existing) => merge_updates(existing, &update)?,
            None => update,
        };
        slot.pending = Some(compacted);
        tracing::trace!("{}: buffered remote update", guid);
        Ok(())
    }

    /// Send an event to a live document.
    pub fn send(&self, guid: &Guid, event: MergeEvent) -> Result<(), PoolError> {
        let mut slot = self.slot_mut(guid)?;
        let handle = slot
            .handle
            .clone()
            .ok_or_else(|| PoolError::DocumentClosed(guid.clone()))?;
        if slot.residency == Residency::Warm {
            self.restart_timer(guid, &mut slot);
        }
        handle.send(event)
    }

    /// The network provider confirmed `guid` is fresh.
    pub fn provider_synced(&self, guid: &Guid) -> Result<(), PoolError> {
        self.send(guid, MergeEvent::ProviderSynced)
    }

    /// Record connectivity and tell every live document.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        let handles: Vec<DocumentHandle> = self
            .inner
            .documents
            .iter()
            .filter_map(|slot| slot.handle.clone())
            .collect();
        for handle in handles {
            let event = if online {
                MergeEvent::Connected
            } else {
                MergeEvent::Disconnected
            };
            if handle.send(event).is_err() {
                tracing::debug!("{}: closed before connectivity change", handle.guid());
            }
        }
    }

    /// Current state of a live document.
    pub async fn snapshot(&self, guid: &Guid) -> Result<DocumentSnapshot, PoolError> {
        self.live_handle(guid)
            .ok_or_else(|| PoolError::DocumentClosed(guid.clone()))?
            .snapshot()
            .await
    }

    /// Wait until a live document processed everything sent to it.
    pub async fn quiesce(&self, guid: &Guid) -> Result<(), PoolError> {
        match self.live_handle(guid) {
            Some(handle) => handle.quiesce().await,
            None => Ok(()),
        }
    }

    /// Close every live machine.
    pub async fn shutdown(&self) {
        let live: Vec<(Guid, DocumentHandle)> = self
            .inner
            .documents
            .iter_mut()
            .filter_map(|mut slot| {
                slot.stop_timer();
                let handle = slot.handle.take()?;
                slot.residency = Residency::Hibernating;
                Some((slot.key().clone(), handle))
            })
            .collect();

        for (guid, handle) in live {
            match handle.close().await {
                Ok(state) => {
                    self.inner.states.insert(guid.clone(), state);
                }
                Err(e) => tracing::warn!("{}: close failed: {}", guid, e),
            }
            if let Some(mut slot) = self.inner.documents.get_mut(&guid) {
                slot.residency = Residency::Hibernated;
            }
            self.queue().release(&guid);
        }
        tracing::info!("pool shut down");
    }

    // ===========================================
    // LCA Cache / Status
    // ===========================================

    async fn cached_state(&self, guid: &Guid) -> Result<Option<PersistedState>, PoolError> {
        let cached = self.inner.states.get(guid).map(|state| state.value().clone());
        if cached.is_some() {
            return Ok(cached);
        }
        let loaded = self.inner.persistence.load_state(guid).await?;
        if let Some(state) = &loaded {
            self.inner.states.insert(guid.clone(), state.clone());
        }
        Ok(loaded)
    }

    /// Populate the cache from every persisted record.
    pub async fn load_all(&self) -> Result<usize, PoolError> {
        let states = self.inner.persistence.load_all_states().await?;
        let count = states.len();
        for state in states {
            self.inner.states.insert(state.guid.clone(), state);
        }
        tracing::info!("loaded {} persisted documents", count);
        Ok(count)
    }

    /// Last common ancestor of `guid`, with or without a live machine.
    pub async fn get_lca(&self, guid: &Guid) -> Result<Option<LcaState>, PoolError> {
        if let Some(handle) = self.live_handle(guid) {
            return Ok(handle.snapshot().await?.persisted.lca);
        }
        Ok(self.cached_state(guid).await?.and_then(|state| state.lca))
    }

    /// Replace the ancestor of a document with no live machine.
    pub async fn set_lca(&self, guid: &Guid, lca: Option<LcaState>) -> Result<(), PoolError> {
        if self.live_handle(guid).is_some() {
            return Err(PoolError::Busy(guid.clone()));
        }
        let mut state = match self.cached_state(guid).await? {
            Some(state) => state,
            None => {
                let path = self
                    .inner
                    .documents
                    .get(guid)
                    .map(|slot| slot.path.clone())
                    .unwrap_or_default();
                PersistedState::new(guid.clone(), path)
            }
        };
        state.lca = lca;
        self.inner.persistence.save_state(&state).await?;
        self.inner.states.insert(guid.clone(), state);
        Ok(())
    }

    /// Sync status of `guid`, instantiating nothing.
    pub async fn status_of(&self, guid: &Guid) -> Result<SyncStatus, PoolError> {
        if let Some(handle) = self.live_handle(guid) {
            return Ok(handle.snapshot().await?.status);
        }
        match self.cached_state(guid).await? {
            Some(state) => Ok(state.status()),
            None if self.is_registered(guid) => Ok(SyncStatus::Synced),
            None => Err(PoolError::UnknownDocument(guid.clone())),
        }
    }

    /// Status of every cached record, sorted by guid.
    pub fn cached_statuses(&self) -> Vec<(PersistedState, SyncStatus)> {
        let mut statuses: Vec<_> = self
            .inner
            .states
            .iter()
            .map(|state| (state.value().clone(), state.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.guid.cmp(&b.0.guid));
        statuses
    }
}

/// Hibernate documents whose idle timer fired.
async fn reap<P: Persistence>(
    pool: Weak<PoolInner<P>>,
    mut expirations: mpsc::UnboundedReceiver<(Guid, u64)>,
) {
    while let Some((guid, epoch)) = expirations.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let pool = PoolManager { inner };
        if !pool.timer_current(&guid, epoch) {
            continue;
        }
        tracing::debug!("{}: idle timeout", guid);
        if let Err(e) = pool.hibernate(&guid).await {
            tracing::warn!("{}: hibernate failed: {}", guid, e);
        }
    }
}
