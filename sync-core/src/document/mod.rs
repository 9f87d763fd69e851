//! Document state machine.
//!
//! One [`DocumentMachine`] tracks one document across its three replicas
//! (disk, local CRDT, remote CRDT). It is a chart run by the [`crate::hsm`]
//! interpreter: events go in through [`DocumentMachine::send`], effects come
//! out through [`DocumentMachine::take_effects`], and merge work is handed to
//! the driver as invokes ([`DocumentMachine::take_invokes`]) whose results
//! come back through [`DocumentMachine::complete`].
//!
//! Events that arrive while the machine waits (on persistence, the network
//! or a merge) are buffered and replayed in arrival order once it stops
//! waiting.

mod actions;
mod chart;
mod context;
mod events;
mod guards;
mod invokes;

use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use sync_types::{Guid, PersistedState, SyncStatus};
use thiserror::Error;

use crate::hsm::{
    Event, InvokeToken, Machine, MachineDefinition, Registry, StartedInvoke, ValidationError,
};
use crate::invariants::{CheckerConfig, InvariantChecker, InvariantViolation, Observation};

pub use chart::{definition, registry, CHART_ID, WAITING_STATES};
pub use context::{Deviations, MergeState};
pub use events::{ConflictState, Conflicted, InvokeOutput, MergeEffect, MergeEvent, Reconciled};

/// Upper bound on invoke rounds driven by [`DocumentMachine::settle`].
pub const MAX_SETTLE_ROUNDS: usize = 32;

/// Errors building a document machine.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The chart references names the registry lacks.
    #[error("document chart is invalid: {0:?}")]
    InvalidChart(Vec<ValidationError>),
}

type Chart = (Arc<MachineDefinition>, Arc<Registry<MergeState, MergeEvent>>);

fn shared_chart() -> &'static Chart {
    static CHART: OnceLock<Chart> = OnceLock::new();
    CHART.get_or_init(|| (Arc::new(definition()), Arc::new(registry())))
}

/// A document's reconciliation state machine.
#[derive(Debug)]
pub struct DocumentMachine {
    machine: Machine<MergeState, MergeEvent>,
    status: Option<SyncStatus>,
    checker: InvariantChecker,
    violation: Option<InvariantViolation>,
}

impl DocumentMachine {
    /// Create a machine for `guid` in `unloaded`.
    pub fn new(guid: Guid, path: impl Into<String>) -> Result<Self, DocumentError> {
        let (definition, registry) = shared_chart();
        let context = MergeState {
            guid: guid.clone(),
            path: path.into(),
            state_path: definition.initial.clone(),
            ..Default::default()
        };
        let machine = Machine::new(definition.clone(), registry.clone(), context)
            .map_err(DocumentError::InvalidChart)?
            .with_label(guid.to_string());
        Ok(Self {
            machine,
            status: None,
            checker: InvariantChecker::default(),
            violation: None,
        })
    }

    /// Use `db_name` for the local update log instead of the guid.
    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.machine.context_mut().db_name = db_name.into();
        self
    }

    /// Run the invariant checker after every event.
    pub fn with_checker(mut self, config: CheckerConfig) -> Self {
        self.checker = InvariantChecker::new(config);
        self
    }

    /// Process an event (and any buffered events it releases).
    ///
    /// Returns whether the event caused a transition.
    pub fn send(&mut self, event: MergeEvent) -> bool {
        match self.try_send(event) {
            Ok(taken) => taken,
            Err(violation) => {
                tracing::error!("{}: {}", self.guid(), violation);
                true
            }
        }
    }

    /// Like [`send`](Self::send), but returns the first invariant violation
    /// when the checker runs in `fail` mode.
    pub fn try_send(&mut self, event: MergeEvent) -> Result<bool, InvariantViolation> {
        let taken = self.step(|machine| machine.send(event));
        self.finish()?;
        Ok(taken)
    }

    /// Route an invoke result back into the machine. Stale results are
    /// ignored.
    pub fn complete(
        &mut self,
        token: InvokeToken,
        result: Result<MergeEvent, MergeEvent>,
    ) -> bool {
        match self.try_complete(token, result) {
            Ok(taken) => taken,
            Err(violation) => {
                tracing::error!("{}: {}", self.guid(), violation);
                true
            }
        }
    }

    /// Like [`complete`](Self::complete), surfacing invariant violations.
    pub fn try_complete(
        &mut self,
        token: InvokeToken,
        result: Result<MergeEvent, MergeEvent>,
    ) -> Result<bool, InvariantViolation> {
        let taken = self.step(|machine| machine.complete(token, result));
        self.finish()?;
        Ok(taken)
    }

    /// Drive started invokes to completion inline.
    ///
    /// Invoke sources are CPU-only, so their futures are ready on first
    /// poll. Returns the number of completions delivered.
    pub fn settle(&mut self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let started = self.take_invokes();
            if started.is_empty() {
                break;
            }
            for invoke in started {
                match invoke.future.now_or_never() {
                    Some(result) => {
                        self.complete(invoke.token, result);
                        delivered += 1;
                    }
                    None => tracing::warn!(
                        "{}: invoke {} was not ready, dropped",
                        self.guid(),
                        invoke.src
                    ),
                }
            }
        }
        delivered
    }

    /// Effects produced since the last call.
    pub fn take_effects(&mut self) -> Vec<MergeEffect> {
        std::mem::take(&mut self.machine.context_mut().effects)
    }

    /// Invokes started since the last call.
    pub fn take_invokes(&mut self) -> Vec<StartedInvoke<MergeEvent>> {
        self.machine.take_invokes()
    }

    /// Document identifier.
    pub fn guid(&self) -> &Guid {
        &self.machine.context().guid
    }

    /// Current leaf state.
    pub fn state_path(&self) -> &str {
        self.machine.state_path()
    }

    /// Whether the current leaf is `state` or nested under it.
    pub fn matches(&self, state: &str) -> bool {
        self.machine.matches(state)
    }

    /// Whether events are currently being buffered.
    pub fn is_waiting(&self) -> bool {
        WAITING_STATES.iter().any(|state| self.machine.matches(state))
    }

    /// Read-only view of the machine's state.
    pub fn context(&self) -> &MergeState {
        self.machine.context()
    }

    /// Mutable access for drivers and tests.
    pub fn context_mut(&mut self) -> &mut MergeState {
        self.machine.context_mut()
    }

    /// Derived sync status.
    pub fn status(&self) -> SyncStatus {
        derive_status(&self.machine)
    }

    /// The record persistence would store right now.
    pub fn persisted_state(&self) -> PersistedState {
        self.machine.context().persisted()
    }

    /// Violations the checker recorded.
    pub fn violations(&self) -> &[InvariantViolation] {
        self.checker.violations()
    }

    /// Run one machine step, then replay buffered events while the machine
    /// is not waiting. Each step is checked on its own.
    fn step(&mut self, run: impl FnOnce(&mut Machine<MergeState, MergeEvent>) -> bool) -> bool {
        let before = Observation::of(self.machine.context());
        let taken = run(&mut self.machine);
        self.after(&before);

        while !self.is_waiting() {
            let Some(next) = self.machine.context_mut().buffered.pop_front() else {
                break;
            };
            tracing::trace!("{}: replaying {}", self.guid(), next.kind());
            let before = Observation::of(self.machine.context());
            self.machine.send(next);
            self.after(&before);
        }
        taken
    }

    fn after(&mut self, before: &Observation) {
        let leaf = self.machine.state_path().to_string();
        self.machine.context_mut().state_path = leaf;

        let status = self.status();
        if self.status != Some(status) {
            self.status = Some(status);
            let guid = self.guid().clone();
            tracing::debug!("{}: status {}", guid, status);
            self.machine
                .context_mut()
                .effects
                .push(MergeEffect::StatusChanged { guid, status });
        }

        if let Err(violation) = self.checker.check(before, self.machine.context(), status) {
            self.violation.get_or_insert(violation);
        }
    }

    fn finish(&mut self) -> Result<(), InvariantViolation> {
        match self.violation.take() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }
}

fn derive_status(machine: &Machine<MergeState, MergeEvent>) -> SyncStatus {
    let ctx = machine.context();
    if ctx.error.is_some() {
        return SyncStatus::Error;
    }
    if machine.matches("active.conflict") || ctx.idle_conflict || ctx.deferred_conflict.is_some()
    {
        return SyncStatus::Conflict;
    }
    if machine.matches("unloaded") {
        return ctx.persisted().status();
    }
    if machine.matches("idle.synced") {
        return SyncStatus::Synced;
    }
    let disk_matches_local = ctx
        .disk
        .as_ref()
        .is_some_and(|disk| Some(&disk.hash) == ctx.local_hash.as_ref());
    if machine.matches("active.tracking") && ctx.fork.is_none() && disk_matches_local {
        return SyncStatus::Synced;
    }
    SyncStatus::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{text_of, Replica};
    use sync_types::{ContentHash, LcaState, Metadata, PositionedChange};

    const PATH: &str = "notes/doc.md";

    fn machine() -> DocumentMachine {
        DocumentMachine::new(Guid::new("doc"), PATH)
            .unwrap()
            .with_checker(CheckerConfig::strict())
    }

    /// A machine loaded from persistence whose replicas and disk all hold
    /// `origin`'s text.
    fn loaded(origin: &Replica) -> DocumentMachine {
        let text = origin.text();
        let mut m = machine();
        m.send(MergeEvent::Load {
            guid: Guid::new("doc"),
            path: PATH.into(),
        });
        let mut state = PersistedState::new(Guid::new("doc"), PATH);
        state.lca = Some(LcaState {
            contents: text.clone(),
            meta: Metadata::for_contents(&text, 100),
            state_vector: origin.state_vector(),
        });
        state.disk = Some(Metadata::for_contents(&text, 100));
        m.send(MergeEvent::PersistenceLoaded {
            state: Some(state),
            updates: Some(origin.encode_state()),
        });
        m
    }

    fn remote_edit(origin: &Replica, text: &str) -> Vec<u8> {
        let mut remote = origin.fork().unwrap();
        let sv = origin.state_vector();
        remote.set_text(text).unwrap();
        remote.encode_diff(&sv).unwrap()
    }

    fn acquire(m: &mut DocumentMachine, editor: &str) {
        m.send(MergeEvent::AcquireLock {
            editor_content: editor.into(),
        });
        m.settle();
    }

    fn writes(effects: &[MergeEffect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                MergeEffect::WriteDisk { contents, .. } => Some(contents.clone()),
                _ => None,
            })
            .collect()
    }

    // ===========================================
    // Loading
    // ===========================================

    #[test]
    fn fresh_document_is_synced_then_disk_ahead() {
        let mut m = machine();
        m.send(MergeEvent::Load {
            guid: Guid::new("doc"),
            path: PATH.into(),
        });
        assert_eq!(m.state_path(), "loading");
        m.send(MergeEvent::PersistenceLoaded {
            state: None,
            updates: None,
        });
        assert_eq!(m.state_path(), "idle.synced");
        assert_eq!(m.status(), SyncStatus::Synced);

        m.send(MergeEvent::disk_changed("hello", 1000));
        assert_eq!(m.state_path(), "idle.diskAhead");
        assert_eq!(m.context().db_name, "doc");
    }

    #[test]
    fn events_during_loading_replay_in_order() {
        let mut m = machine();
        m.send(MergeEvent::Load {
            guid: Guid::new("doc"),
            path: PATH.into(),
        });
        m.send(MergeEvent::disk_changed("hello", 1000));
        assert_eq!(m.context().buffered.len(), 1);
        assert_eq!(m.state_path(), "loading");

        m.send(MergeEvent::PersistenceLoaded {
            state: None,
            updates: None,
        });
        assert!(m.context().buffered.is_empty());
        assert_eq!(m.state_path(), "idle.diskAhead");
    }

    #[test]
    fn status_changes_are_emitted_once() {
        let mut m = machine();
        m.send(MergeEvent::Load {
            guid: Guid::new("doc"),
            path: PATH.into(),
        });
        m.send(MergeEvent::PersistenceLoaded {
            state: None,
            updates: None,
        });
        m.send(MergeEvent::Connected);
        let statuses: Vec<SyncStatus> = m
            .take_effects()
            .into_iter()
            .filter_map(|e| match e {
                MergeEffect::StatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![SyncStatus::Pending, SyncStatus::Synced]);
    }

    // ===========================================
    // Idle
    // ===========================================

    #[test]
    fn remote_update_auto_merges_to_disk() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        assert_eq!(m.state_path(), "idle.synced");
        m.take_effects();

        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "hello world"),
        });
        assert_eq!(m.state_path(), "idle.remoteAhead");
        m.settle();

        assert_eq!(m.state_path(), "idle.synced");
        let lca = m.context().lca.clone().unwrap();
        assert_eq!(lca.contents, "hello world");
        assert_eq!(writes(&m.take_effects()), vec!["hello world".to_string()]);
        assert!(m.violations().is_empty());
    }

    #[test]
    fn same_remote_update_twice_is_idempotent() {
        let origin = Replica::with_text("hello");
        let update = remote_edit(&origin, "hello world");
        let mut m = loaded(&origin);

        m.send(MergeEvent::RemoteUpdate {
            update: update.clone(),
        });
        m.settle();
        let first = m.context().local_text();
        m.send(MergeEvent::RemoteUpdate { update });
        m.settle();

        assert_eq!(m.state_path(), "idle.synced");
        assert_eq!(m.context().local_text(), first);
        assert_eq!(first.as_deref(), Some("hello world"));
    }

    #[test]
    fn disk_edit_forks_until_provider_synced() {
        let origin = Replica::with_text("one\ntwo\n");
        let mut m = loaded(&origin);

        m.send(MergeEvent::disk_changed("ONE\ntwo\n", 200));
        m.settle();
        assert_eq!(m.state_path(), "idle.localAhead");
        assert_eq!(m.context().fork.as_ref().unwrap().base, "one\ntwo\n");

        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "one\ntwo\nthree\n"),
        });
        m.settle();
        assert_eq!(m.state_path(), "idle.localAhead");

        m.take_effects();
        m.send(MergeEvent::ProviderSynced);
        m.settle();

        assert_eq!(m.state_path(), "idle.synced");
        assert!(m.context().fork.is_none());
        let merged = "ONE\ntwo\nthree\n";
        assert_eq!(m.context().lca.as_ref().unwrap().contents, merged);
        let effects = m.take_effects();
        assert_eq!(writes(&effects), vec![merged.to_string()]);
        assert!(effects
            .iter()
            .any(|e| matches!(e, MergeEffect::ReplaceUpdates { .. })));
        assert!(m.violations().is_empty());
    }

    #[test]
    fn disk_echo_only_refreshes_metadata() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        m.send(MergeEvent::disk_changed("hello", 555));
        assert_eq!(m.state_path(), "idle.synced");
        assert_eq!(m.context().disk.as_ref().unwrap().mtime, 555);
    }

    #[test]
    fn save_complete_refreshes_lca_mtime() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        m.send(MergeEvent::SaveComplete {
            mtime: 777,
            hash: ContentHash::of("hello"),
        });
        assert_eq!(m.context().lca.as_ref().unwrap().meta.mtime, 777);
    }

    #[test]
    fn error_while_idle_is_recoverable() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        m.send(MergeEvent::Error {
            error: "disk unavailable".into(),
        });
        assert_eq!(m.state_path(), "idle.error");
        assert_eq!(m.status(), SyncStatus::Error);

        m.send(MergeEvent::Load {
            guid: Guid::new("doc"),
            path: PATH.into(),
        });
        assert_eq!(m.state_path(), "loading");
        assert!(m.context().error.is_none());
    }

    // ===========================================
    // Active
    // ===========================================

    #[test]
    fn acquire_lock_reconciles_and_tracks() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        acquire(&mut m, "hello");
        assert_eq!(m.state_path(), "active.tracking");
        assert!(m.context().local.is_some());
        assert_eq!(m.status(), SyncStatus::Synced);
    }

    #[test]
    fn new_document_waits_for_provider() {
        let mut m = machine();
        m.send(MergeEvent::Load {
            guid: Guid::new("doc"),
            path: PATH.into(),
        });
        m.send(MergeEvent::PersistenceLoaded {
            state: None,
            updates: None,
        });
        acquire(&mut m, "");
        assert_eq!(m.state_path(), "active.entering.awaitingRemote");

        m.send(MergeEvent::ProviderSynced);
        m.settle();
        assert_eq!(m.state_path(), "active.tracking");
    }

    #[test]
    fn unload_while_waiting_for_provider_does_not_hang() {
        let mut m = machine();
        m.send(MergeEvent::Load {
            guid: Guid::new("doc"),
            path: PATH.into(),
        });
        m.send(MergeEvent::PersistenceLoaded {
            state: None,
            updates: None,
        });
        acquire(&mut m, "");
        assert_eq!(m.state_path(), "active.entering.awaitingRemote");

        m.send(MergeEvent::Unload);
        m.settle();
        assert_eq!(m.state_path(), "unloaded");
        assert!(m.context().local.is_none());
    }

    #[test]
    fn editor_changes_reach_remote() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        acquire(&mut m, "hello");
        m.take_effects();

        m.send(MergeEvent::Cm6Change {
            changes: vec![PositionedChange::insert(5, "!")],
            doc_text: "hello!".into(),
            is_from_replica: false,
        });
        let effects = m.take_effects();
        assert!(effects
            .iter()
            .any(|e| matches!(e, MergeEffect::SyncToRemote { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, MergeEffect::PersistUpdates { .. })));
        assert_eq!(m.context().local.as_ref().unwrap().text(), "hello!");
        assert_eq!(m.context().remote.as_ref().unwrap().text(), "hello!");
    }

    #[test]
    fn replica_echoes_are_not_reapplied() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        acquire(&mut m, "hello");
        m.take_effects();

        m.send(MergeEvent::Cm6Change {
            changes: vec![PositionedChange::insert(5, "!")],
            doc_text: "hello!".into(),
            is_from_replica: true,
        });
        assert!(m.take_effects().is_empty());
        assert_eq!(m.context().local.as_ref().unwrap().text(), "hello");
    }

    #[test]
    fn drift_is_corrected_once() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        acquire(&mut m, "hello");
        m.take_effects();

        m.context_mut().last_known_editor_text = Some("hullo".into());
        m.send(MergeEvent::CheckDrift);
        let dispatched = m
            .take_effects()
            .into_iter()
            .filter(|e| matches!(e, MergeEffect::DispatchCm6 { .. }))
            .count();
        assert_eq!(dispatched, 1);

        m.send(MergeEvent::CheckDrift);
        assert!(m.take_effects().is_empty());
    }

    #[test]
    fn remote_update_while_active_reaches_editor() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        acquire(&mut m, "hello");
        m.take_effects();

        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "hello world"),
        });
        let effects = m.take_effects();
        assert!(effects.contains(&MergeEffect::DispatchCm6 {
            changes: vec![PositionedChange::insert(5, " world")]
        }));
        assert_eq!(m.context().local.as_ref().unwrap().text(), "hello world");
    }

    #[test]
    fn disk_edit_with_unchanged_local_merges_two_way() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        m.send(MergeEvent::ProviderSynced);
        acquire(&mut m, "hello");

        m.send(MergeEvent::disk_changed("hello disk", 300));
        assert_eq!(m.state_path(), "active.merging.twoWay");
        m.settle();
        assert_eq!(m.state_path(), "active.tracking");
        assert_eq!(m.context().local.as_ref().unwrap().text(), "hello disk");
        assert_eq!(m.context().lca.as_ref().unwrap().contents, "hello");
    }

    #[test]
    fn conflicting_disk_edit_shows_banner_and_resolves() {
        let base = "title\nbody\n";
        let origin = Replica::with_text(base);
        let mut m = loaded(&origin);
        m.send(MergeEvent::ProviderSynced);
        acquire(&mut m, base);

        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "title\nremote body\n"),
        });
        m.take_effects();
        m.send(MergeEvent::disk_changed("title\ndisk body\n", 2000));
        m.settle();

        assert_eq!(m.state_path(), "active.conflict.bannerShown");
        assert_eq!(m.status(), SyncStatus::Conflict);
        assert!(m
            .take_effects()
            .iter()
            .any(|e| matches!(e, MergeEffect::ShowConflictDecorations { regions } if regions.len() == 1)));
        assert_eq!(m.context().lca.as_ref().unwrap().contents, base);

        m.send(MergeEvent::ResolveAcceptDisk);
        assert_eq!(m.state_path(), "active.tracking");
        assert!(m.context().conflict.is_none());
        assert_eq!(
            m.context().local.as_ref().unwrap().text(),
            "title\ndisk body\n"
        );
        let effects = m.take_effects();
        assert!(effects.contains(&MergeEffect::HideConflictDecorations));
        assert!(effects
            .iter()
            .any(|e| matches!(e, MergeEffect::SyncToRemote { .. })));
        assert!(m.violations().is_empty());
    }

    #[test]
    fn dismissed_conflict_is_not_shown_again() {
        let base = "title\nbody\n";
        let origin = Replica::with_text(base);
        let mut m = loaded(&origin);
        m.send(MergeEvent::ProviderSynced);
        acquire(&mut m, base);
        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "title\nremote body\n"),
        });
        m.send(MergeEvent::disk_changed("title\ndisk body\n", 2000));
        m.settle();
        m.send(MergeEvent::DismissConflict);

        assert_eq!(m.state_path(), "active.tracking");
        assert!(m.context().deferred_conflict.is_some());
        assert_eq!(m.status(), SyncStatus::Conflict);

        // Same disk contents again, from a different mtime.
        m.send(MergeEvent::disk_changed("title\ndisk body\n", 2001));
        m.settle();
        assert_eq!(m.state_path(), "active.tracking");
    }

    fn shows_banner(effects: &[MergeEffect]) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, MergeEffect::ShowConflictDecorations { .. }))
    }

    #[test]
    fn lock_on_forked_document_waits_for_provider() {
        let base = "title\nbody\n";
        let origin = Replica::with_text(base);
        let mut m = loaded(&origin);
        m.send(MergeEvent::disk_changed("title\ndisk body\n", 2000));
        m.settle();
        assert_eq!(m.state_path(), "idle.localAhead");

        acquire(&mut m, "title\ndisk body\n");
        assert_eq!(m.state_path(), "active.entering.awaitingRemote");
        assert_eq!(m.context().fork.as_ref().unwrap().base, base);
        assert!(!m.context().provider_synced);

        // Concurrent history from a peer that never saw the disk edit.
        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "title\nremote body\n"),
        });
        m.settle();
        assert_eq!(m.state_path(), "active.entering.awaitingRemote");
        assert_eq!(
            m.context().local.as_ref().unwrap().text(),
            "title\ndisk body\n"
        );
        assert!(m.context().fork.is_some());
        assert!(!shows_banner(&m.take_effects()));

        m.send(MergeEvent::ProviderSynced);
        m.settle();

        assert_eq!(m.state_path(), "active.conflict.bannerShown");
        assert!(m.context().fork.is_none());
        assert_eq!(m.status(), SyncStatus::Conflict);
        assert_eq!(
            m.context().local.as_ref().unwrap().text(),
            "title\ndisk body\n"
        );
        assert!(shows_banner(&m.take_effects()));
        assert!(m.violations().is_empty());
    }

    #[test]
    fn idle_disk_and_remote_conflict_surfaces_after_lock() {
        let base = "title\nbody\n";
        let origin = Replica::with_text(base);
        let mut m = loaded(&origin);
        m.send(MergeEvent::disk_changed("title\ndisk body\n", 2000));
        m.settle();
        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "title\nremote body\n"),
        });
        m.settle();
        assert_eq!(m.state_path(), "idle.localAhead");
        assert!(m.context().fork.is_some());

        acquire(&mut m, "title\ndisk body\n");
        assert_eq!(m.state_path(), "active.entering.awaitingRemote");
        assert!(m.context().fork.is_some());
        assert!(!shows_banner(&m.take_effects()));

        m.send(MergeEvent::ProviderSynced);
        m.settle();
        assert_eq!(m.state_path(), "active.conflict.bannerShown");
        assert!(m.context().fork.is_none());
        assert_eq!(m.context().lca.as_ref().unwrap().contents, base);
        assert!(shows_banner(&m.take_effects()));

        m.send(MergeEvent::ResolveAcceptLocal);
        m.settle();
        assert_eq!(m.state_path(), "active.tracking");
        assert!(m.context().fork.is_none());
        assert!(m.context().conflict.is_none());
        assert_eq!(
            m.context().local.as_ref().unwrap().text(),
            "title\ndisk body\n"
        );

        // A second sync signal finds nothing left to reconcile.
        m.send(MergeEvent::ProviderSynced);
        m.settle();
        assert_eq!(m.state_path(), "active.tracking");
        assert!(m.context().fork.is_none());
        assert!(!shows_banner(&m.take_effects()));
        assert!(m.violations().is_empty());
    }

    #[test]
    fn fork_closes_and_lca_advances_on_release() {
        let base = "hello\n";
        let origin = Replica::with_text(base);
        let mut m = loaded(&origin);
        acquire(&mut m, base);
        assert_eq!(m.state_path(), "active.tracking");

        m.send(MergeEvent::disk_changed("hello\nfrom disk\n", 300));
        assert_eq!(m.state_path(), "active.tracking");
        assert_eq!(m.context().fork.as_ref().unwrap().base, base);
        assert_eq!(m.context().lca.as_ref().unwrap().contents, base);

        m.send(MergeEvent::ProviderSynced);
        m.settle();
        assert_eq!(m.state_path(), "active.tracking");
        assert!(m.context().fork.is_none());
        assert_eq!(
            m.context().remote.as_ref().unwrap().text(),
            "hello\nfrom disk\n"
        );
        assert_eq!(m.context().lca.as_ref().unwrap().contents, base);

        m.send(MergeEvent::ReleaseLock);
        m.settle();
        assert_eq!(m.state_path(), "idle.synced");
        assert!(m.context().local.is_none());
        assert_eq!(
            m.context().lca.as_ref().unwrap().contents,
            "hello\nfrom disk\n"
        );
        assert!(m.violations().is_empty());
    }

    #[test]
    fn active_errors_do_not_leave_the_session() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        acquire(&mut m, "hello");
        m.send(MergeEvent::Error {
            error: "write failed".into(),
        });
        assert_eq!(m.state_path(), "active.tracking");
        assert_eq!(m.status(), SyncStatus::Error);
    }

    #[test]
    fn second_lock_is_rejected() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        acquire(&mut m, "hello");
        assert!(m.send(MergeEvent::AcquireLock {
            editor_content: "other".into()
        }));
        assert_eq!(m.state_path(), "active.tracking");
        assert_eq!(m.context().last_known_editor_text.as_deref(), Some("hello"));
    }

    // ===========================================
    // Unloading
    // ===========================================

    #[test]
    fn unload_ends_in_unloaded() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        m.send(MergeEvent::Unload);
        assert_eq!(m.state_path(), "unloading");
        m.settle();
        assert_eq!(m.state_path(), "unloaded");
        assert!(m.context().local_doc.is_none());
    }

    #[test]
    fn stale_invoke_results_are_ignored() {
        let origin = Replica::with_text("hello");
        let mut m = loaded(&origin);
        m.send(MergeEvent::RemoteUpdate {
            update: remote_edit(&origin, "hello world"),
        });
        let stale = m.take_invokes();
        assert_eq!(stale.len(), 1);

        // Leaving the state orphans the running merge.
        m.send(MergeEvent::Error {
            error: "boom".into(),
        });
        for invoke in stale {
            let result = invoke.future.now_or_never().unwrap();
            assert!(!m.complete(invoke.token, result));
        }
        assert_eq!(m.state_path(), "idle.error");
        assert_eq!(text_of(&m.context().local_doc.clone().unwrap()).unwrap(), "hello");
    }
}
