//! Actions of the document chart.
//!
//! Actions never fail: collaborator and replica errors are recorded on the
//! context and surface through the derived status.

use sync_types::{ContentHash, DeferredConflict, DiskState, ForkState, Metadata};

use super::context::MergeState;
use super::events::{ConflictState, InvokeOutput, MergeEffect, MergeEvent, Reconciled};
use crate::replica::{merge_updates, state_vector_of, Replica};

// ===========================================
// Lifecycle
// ===========================================

pub(super) fn assign_identity(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::Load { guid, path } = ev else {
        return;
    };
    ctx.guid = guid.clone();
    ctx.path = path.clone();
    if ctx.db_name.is_empty() {
        ctx.db_name = guid.to_string();
    }
    ctx.persistence_loaded = false;
    tracing::debug!("{}: loading {}", ctx.guid, ctx.path);
}

pub(super) fn buffer_event(ctx: &mut MergeState, ev: &MergeEvent) {
    ctx.buffered.push_back(ev.clone());
}

pub(super) fn apply_persisted(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::PersistenceLoaded { state, updates } = ev else {
        return;
    };
    if let Some(state) = state {
        ctx.lca = state.lca.clone();
        ctx.disk = state.disk.clone();
        ctx.fork = state.fork.clone();
        ctx.deferred_conflict = state.deferred_conflict.clone();
        if ctx.path.is_empty() {
            ctx.path = state.path.clone();
        }
    }

    match updates {
        Some(updates) => match state_vector_of(updates) {
            Ok(sv) => {
                ctx.local_doc = Some(updates.clone());
                ctx.local_state_vector = Some(sv.clone());
                if ctx.remote_doc.is_none() {
                    // Both replicas start from the persisted history.
                    ctx.remote_doc = Some(updates.clone());
                    ctx.remote_state_vector = Some(sv);
                }
            }
            Err(e) => ctx.record_error(format!("persisted updates unreadable: {}", e)),
        },
        None => {
            ctx.local_doc = None;
            ctx.local_state_vector = None;
        }
    }

    ctx.local_hash = match (&ctx.lca, &ctx.local_state_vector) {
        (Some(lca), Some(sv)) if *sv == lca.state_vector => Some(lca.meta.hash.clone()),
        _ if ctx.fork.is_some() => ctx.disk.as_ref().map(|disk| disk.hash.clone()),
        (_, None) => Some(ContentHash::of("")),
        _ => None,
    };
    ctx.persistence_loaded = true;
}

pub(super) fn record_error(ctx: &mut MergeState, ev: &MergeEvent) {
    match ev {
        MergeEvent::Error { error } | MergeEvent::InvokeFailed { error } => {
            ctx.record_error(error.clone());
        }
        _ => {}
    }
}

pub(super) fn clear_error(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.error = None;
}

pub(super) fn accept_lock(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::AcquireLock { editor_content } = ev else {
        return;
    };
    ctx.last_known_editor_text = Some(editor_content.clone());
    ctx.pending_editor_content = Some(editor_content.clone());
    ctx.unload_requested = false;
    tracing::info!("{}: lock acquired", ctx.guid);
}

pub(super) fn reject_lock(ctx: &mut MergeState, _: &MergeEvent) {
    tracing::debug!("{}: lock already held, ignoring", ctx.guid);
}

pub(super) fn request_unload(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.unload_requested = true;
}

pub(super) fn set_online(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.is_online = true;
}

pub(super) fn set_offline(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.is_online = false;
    ctx.provider_synced = false;
}

pub(super) fn mark_provider_synced(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.provider_synced = true;
}

// ===========================================
// Disk
// ===========================================

pub(super) fn record_disk_meta(ctx: &mut MergeState, ev: &MergeEvent) {
    if let MergeEvent::DiskChanged { hash, mtime, .. } = ev {
        ctx.disk = Some(Metadata {
            hash: hash.clone(),
            mtime: *mtime,
        });
    }
}

pub(super) fn stash_disk(ctx: &mut MergeState, ev: &MergeEvent) {
    if let MergeEvent::DiskChanged {
        contents,
        mtime,
        hash,
    } = ev
    {
        ctx.pending_disk = Some(DiskState {
            contents: contents.clone(),
            mtime: *mtime,
            hash: hash.clone(),
        });
    }
}

/// Idle: refresh disk metadata; a save of the ancestor's contents also
/// refreshes the ancestor's mtime.
pub(super) fn record_save(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::SaveComplete { mtime, hash } = ev else {
        return;
    };
    ctx.disk = Some(Metadata {
        hash: hash.clone(),
        mtime: *mtime,
    });
    if let Some(lca) = ctx.lca.as_mut().filter(|lca| lca.meta.hash == *hash) {
        lca.meta.mtime = *mtime;
    }
    ctx.persist_state();
}

pub(super) fn record_save_active(ctx: &mut MergeState, ev: &MergeEvent) {
    if let MergeEvent::SaveComplete { mtime, hash } = ev {
        ctx.disk = Some(Metadata {
            hash: hash.clone(),
            mtime: *mtime,
        });
    }
}

fn absorb_pending_disk(ctx: &mut MergeState) {
    if let Some(pending) = ctx.pending_disk.take() {
        ctx.disk = Some(pending.meta());
    }
}

// ===========================================
// Idle
// ===========================================

pub(super) fn append_remote(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::RemoteUpdate { update } = ev else {
        return;
    };
    let merged = match &ctx.remote_doc {
        Some(existing) => merge_updates(existing, update),
        None => Ok(update.clone()),
    };
    match merged.and_then(|doc| state_vector_of(&doc).map(|sv| (doc, sv))) {
        Ok((doc, sv)) => {
            ctx.remote_doc = Some(doc);
            ctx.remote_state_vector = Some(sv);
        }
        Err(e) => ctx.record_error(format!("remote update rejected: {}", e)),
    }
}

pub(super) fn clear_idle_conflict(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.idle_conflict = false;
    ctx.conflict = None;
}

/// Adopt reconciled replica bytes while idle.
fn adopt_encoded(ctx: &mut MergeState, reconciled: &Reconciled) -> bool {
    let vectors = state_vector_of(&reconciled.local_state)
        .and_then(|local| state_vector_of(&reconciled.remote_state).map(|remote| (local, remote)));
    let (local_sv, remote_sv) = match vectors {
        Ok(vectors) => vectors,
        Err(e) => {
            ctx.record_error(format!("reconciled state unreadable: {}", e));
            return false;
        }
    };
    ctx.local_doc = Some(reconciled.local_state.clone());
    ctx.remote_doc = Some(reconciled.remote_state.clone());
    ctx.local_state_vector = Some(local_sv);
    ctx.remote_state_vector = Some(remote_sv);
    ctx.local_hash = Some(ContentHash::of(&reconciled.contents));
    persist_replicas(ctx, reconciled);
    true
}

fn persist_replicas(ctx: &mut MergeState, reconciled: &Reconciled) {
    if reconciled.rebuilt {
        ctx.replace_updates(reconciled.local_state.clone());
    } else {
        ctx.persist_update(reconciled.local_update.clone());
    }
    ctx.sync_to_remote(reconciled.remote_update.clone());
    if reconciled.fork_cleared {
        ctx.fork = None;
    }
}

pub(super) fn apply_idle_reconcile(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::InvokeDone(InvokeOutput::Reconciled(reconciled)) = ev else {
        return;
    };
    if !adopt_encoded(ctx, reconciled) {
        return;
    }
    absorb_pending_disk(ctx);
    ctx.conflict = None;
    ctx.idle_conflict = false;
    ctx.write_disk(&reconciled.contents);
    ctx.advance_lca(&reconciled.contents);
    ctx.persist_state();
}

pub(super) fn apply_ingest(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::InvokeDone(InvokeOutput::Ingested {
        fork_base,
        local_state,
        update,
        disk,
    }) = ev
    else {
        return;
    };
    let sv = match state_vector_of(local_state) {
        Ok(sv) => sv,
        Err(e) => {
            ctx.record_error(format!("ingested state unreadable: {}", e));
            return;
        }
    };
    if ctx.fork.is_none() {
        ctx.fork = Some(ForkState {
            base: fork_base.clone(),
        });
    }
    ctx.local_doc = Some(local_state.clone());
    ctx.local_state_vector = Some(sv);
    ctx.local_hash = Some(disk.hash.clone());
    ctx.disk = Some(disk.meta());
    ctx.pending_disk = None;
    ctx.persist_update(update.clone());
    ctx.persist_state();
    tracing::info!("{}: disk edit ingested under fork", ctx.guid);
}

pub(super) fn apply_idle_conflict(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::InvokeDone(InvokeOutput::Conflicted(conflicted)) = ev else {
        return;
    };
    if let Some(replicas) = &conflicted.replicas {
        adopt_encoded(ctx, replicas);
    }
    if conflicted.fork_cleared {
        ctx.fork = None;
    }
    absorb_pending_disk(ctx);
    ctx.conflict = Some(conflicted.conflict.clone());
    ctx.idle_conflict = true;
    ctx.persist_state();
    tracing::info!(
        "{}: idle reconciliation conflicted ({} regions)",
        ctx.guid,
        conflicted.conflict.regions.len()
    );
}

// ===========================================
// Active: replicas
// ===========================================

fn load(bytes: Option<&Vec<u8>>) -> Result<Replica, crate::replica::ReplicaError> {
    match bytes {
        Some(bytes) if !bytes.is_empty() => Replica::from_update(bytes),
        _ => Ok(Replica::new()),
    }
}

pub(super) fn create_replicas(ctx: &mut MergeState, _: &MergeEvent) {
    let local = load(ctx.local_doc.as_ref()).unwrap_or_else(|e| {
        ctx.record_error(format!("local replica unreadable: {}", e));
        Replica::new()
    });
    let remote = load(ctx.remote_doc.as_ref()).unwrap_or_else(|e| {
        ctx.record_error(format!("remote replica unreadable: {}", e));
        Replica::new()
    });
    ctx.local = Some(local);
    ctx.remote = Some(remote);
    ctx.local_doc = None;
    ctx.remote_doc = None;
    ctx.refresh_vectors();
}

pub(super) fn suspend_replicas(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.refresh_vectors();
    if let Some(local) = ctx.local.take() {
        ctx.local_doc = Some(local.encode_state());
    }
    if let Some(remote) = ctx.remote.take() {
        ctx.remote_doc = Some(remote.encode_state());
    }
    ctx.pending_editor_content = None;
    ctx.last_known_editor_text = None;
    tracing::info!("{}: lock released", ctx.guid);
}

/// Swap in reconciled replica states while active.
fn adopt_live(ctx: &mut MergeState, reconciled: &Reconciled) -> bool {
    let replicas = Replica::from_update(&reconciled.local_state)
        .and_then(|local| Replica::from_update(&reconciled.remote_state).map(|r| (local, r)));
    match replicas {
        Ok((local, remote)) => {
            ctx.local = Some(local);
            ctx.remote = Some(remote);
            ctx.refresh_vectors();
            persist_replicas(ctx, reconciled);
            true
        }
        Err(e) => {
            ctx.record_error(format!("reconciled state unreadable: {}", e));
            false
        }
    }
}

pub(super) fn apply_active_reconcile(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::InvokeDone(InvokeOutput::Reconciled(reconciled)) = ev else {
        return;
    };
    if !adopt_live(ctx, reconciled) {
        return;
    }
    ctx.conflict = None;
    ctx.error = None;
    ctx.pending_editor_content = None;
    ctx.dispatch_to_editor(&reconciled.contents);
    ctx.write_disk(&reconciled.contents);
    ctx.persist_state();
}

// ===========================================
// Active: editing
// ===========================================

pub(super) fn record_editor_text(ctx: &mut MergeState, ev: &MergeEvent) {
    if let MergeEvent::Cm6Change { doc_text, .. } = ev {
        ctx.last_known_editor_text = Some(doc_text.clone());
    }
}

pub(super) fn apply_editor_change(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::Cm6Change {
        changes, doc_text, ..
    } = ev
    else {
        return;
    };
    let diverged = ctx.histories_diverged();
    let Some(local) = ctx.local.as_mut() else {
        ctx.last_known_editor_text = Some(doc_text.clone());
        return;
    };
    let before = local.text();
    if ctx
        .last_known_editor_text
        .as_ref()
        .is_some_and(|editor| *editor != before)
    {
        // The editor shows something other than the replica (an open
        // conflict); the resolution reconciles them.
        ctx.last_known_editor_text = Some(doc_text.clone());
        return;
    }

    let applied = local.apply_changes(changes).map(|update| (update, local.text()));
    ctx.last_known_editor_text = Some(doc_text.clone());
    match applied {
        Ok((update, text)) => {
            if !diverged {
                if let Some(Err(e)) = ctx.remote.as_mut().map(|r| r.apply_update(&update)) {
                    ctx.record_error(format!("remote replica rejected local edit: {}", e));
                }
                ctx.sync_to_remote(update.clone());
            }
            ctx.persist_update(update);
            if text != *doc_text {
                tracing::warn!("{}: editor drifted from replica, re-dispatching", ctx.guid);
                ctx.dispatch_to_editor(&text);
            }
        }
        Err(e) => {
            tracing::warn!("{}: editor change rejected ({}), re-dispatching", ctx.guid, e);
            ctx.dispatch_to_editor(&before);
        }
    }
    ctx.refresh_vectors();
}

pub(super) fn check_drift(ctx: &mut MergeState, _: &MergeEvent) {
    let Some(text) = ctx.local.as_ref().map(Replica::text) else {
        return;
    };
    if ctx.last_known_editor_text.as_deref() != Some(text.as_str()) {
        tracing::info!("{}: drift detected, re-dispatching replica text", ctx.guid);
        ctx.dispatch_to_editor(&text);
    }
}

pub(super) fn apply_remote_update(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::RemoteUpdate { update } = ev else {
        return;
    };
    let Some(remote) = ctx.remote.as_mut() else {
        return;
    };
    if let Err(e) = remote.apply_update(update) {
        ctx.record_error(format!("remote update rejected: {}", e));
        return;
    }
    if !ctx.histories_diverged() {
        let applied = ctx
            .local
            .as_mut()
            .map(|local| local.apply_update(update).map(|changed| (changed, local.text())));
        match applied {
            Some(Ok((true, text))) => {
                ctx.persist_update(update.clone());
                if ctx.conflict.is_none() {
                    ctx.dispatch_to_editor(&text);
                }
            }
            Some(Err(e)) => ctx.record_error(format!("local replica rejected update: {}", e)),
            _ => {}
        }
    }
    ctx.refresh_vectors();
}

/// History that arrives before the provider confirms freshness lands in the
/// remote replica only; the entry reconciliation folds it into local.
pub(super) fn stage_remote_update(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::RemoteUpdate { update } = ev else {
        return;
    };
    let Some(remote) = ctx.remote.as_mut() else {
        return;
    };
    if let Err(e) = remote.apply_update(update) {
        ctx.record_error(format!("remote update rejected: {}", e));
        return;
    }
    ctx.refresh_vectors();
}

/// Disk edit while the network replica is not confirmed fresh: ingest it
/// under a fork instead of merging.
pub(super) fn fork_and_ingest(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::DiskChanged {
        contents,
        mtime,
        hash,
    } = ev
    else {
        return;
    };
    let Some(local) = ctx.local.as_mut() else {
        return;
    };
    let base = local.text();
    let update = match local.set_text(contents) {
        Ok((_, update)) => update,
        Err(e) => {
            ctx.record_error(format!("disk ingest failed: {}", e));
            return;
        }
    };
    if ctx.fork.is_none() {
        ctx.fork = Some(ForkState { base });
    }
    ctx.disk = Some(Metadata {
        hash: hash.clone(),
        mtime: *mtime,
    });
    ctx.persist_update(update);
    ctx.dispatch_to_editor(contents);
    ctx.refresh_vectors();
    ctx.persist_state();
    tracing::info!("{}: disk edit forked until the network is fresh", ctx.guid);
}

pub(super) fn snapshot_editor(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.pending_editor_content = ctx.last_known_editor_text.clone();
}

/// Replace the local text with a merge result, propagating the edit.
fn set_local_text(ctx: &mut MergeState, text: &str) -> bool {
    let diverged = ctx.histories_diverged();
    let Some(local) = ctx.local.as_mut() else {
        return false;
    };
    let update = match local.set_text(text) {
        Ok((_, update)) => update,
        Err(e) => {
            ctx.record_error(format!("failed to apply merge: {}", e));
            return false;
        }
    };
    if !diverged {
        if let Some(Err(e)) = ctx.remote.as_mut().map(|r| r.apply_update(&update)) {
            ctx.record_error(format!("remote replica rejected merge: {}", e));
        }
        ctx.sync_to_remote(update.clone());
    }
    ctx.persist_update(update);
    true
}

pub(super) fn apply_active_merge(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::InvokeDone(InvokeOutput::Merged { text }) = ev else {
        return;
    };
    if !set_local_text(ctx, text) {
        return;
    }
    absorb_pending_disk(ctx);
    ctx.error = None;
    ctx.dispatch_to_editor(text);
    ctx.write_disk(text);
    ctx.refresh_vectors();
    ctx.persist_state();
}

// ===========================================
// Conflicts
// ===========================================

fn adopt_conflict(ctx: &mut MergeState, ev: &MergeEvent) -> Option<ConflictState> {
    let MergeEvent::InvokeDone(InvokeOutput::Conflicted(conflicted)) = ev else {
        return None;
    };
    if let Some(replicas) = &conflicted.replicas {
        adopt_live(ctx, replicas);
    }
    if conflicted.fork_cleared {
        ctx.fork = None;
    }
    absorb_pending_disk(ctx);
    ctx.pending_editor_content = None;
    Some(conflicted.conflict.clone())
}

pub(super) fn set_conflict(ctx: &mut MergeState, ev: &MergeEvent) {
    let Some(conflict) = adopt_conflict(ctx, ev) else {
        return;
    };
    tracing::info!(
        "{}: conflict with {} regions",
        ctx.guid,
        conflict.regions.len()
    );
    ctx.conflict = Some(conflict);
    ctx.persist_state();
}

/// The user already deferred this exact conflict: keep the local text and
/// skip the banner.
pub(super) fn keep_deferred(ctx: &mut MergeState, ev: &MergeEvent) {
    let Some(conflict) = adopt_conflict(ctx, ev) else {
        return;
    };
    tracing::debug!("{}: conflict previously deferred", ctx.guid);
    ctx.conflict = conflict.divergent.then_some(conflict);
    if let Some(text) = ctx.local.as_ref().map(Replica::text) {
        ctx.dispatch_to_editor(&text);
    }
    ctx.persist_state();
}

pub(super) fn show_decorations(ctx: &mut MergeState, _: &MergeEvent) {
    let Some(conflict) = &ctx.conflict else {
        return;
    };
    let editor = ctx
        .last_known_editor_text
        .clone()
        .or_else(|| ctx.local.as_ref().map(Replica::text))
        .unwrap_or_default();
    let regions = conflict.regions.iter().map(|r| r.locate(&editor)).collect();
    ctx.emit(MergeEffect::ShowConflictDecorations { regions });
}

pub(super) fn hide_decorations(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.emit(MergeEffect::HideConflictDecorations);
}

fn resolve_with(ctx: &mut MergeState, text: &str) {
    let Some(conflict) = ctx.conflict.take() else {
        return;
    };
    if conflict.divergent {
        // Rebuild on top of remote history; the old local log is replaced.
        let rebuilt = ctx.remote.as_ref().map(|remote| {
            let remote_sv = remote.state_vector();
            remote.fork().and_then(|mut local| {
                local.set_text(text)?;
                let update = local.encode_diff(&remote_sv)?;
                Ok((local, update))
            })
        });
        match rebuilt {
            Some(Ok((local, update))) => {
                if let Some(Err(e)) = ctx.remote.as_mut().map(|r| r.apply_update(&update)) {
                    ctx.record_error(format!("remote replica rejected resolution: {}", e));
                }
                ctx.replace_updates(local.encode_state());
                ctx.sync_to_remote(update);
                ctx.local = Some(local);
            }
            Some(Err(e)) => {
                ctx.record_error(format!("failed to apply resolution: {}", e));
                return;
            }
            None => return,
        }
    } else if !set_local_text(ctx, text) {
        return;
    }
    ctx.fork = None;
    ctx.deferred_conflict = None;
    ctx.dispatch_to_editor(text);
    ctx.write_disk(text);
    ctx.refresh_vectors();
    ctx.persist_state();
    tracing::info!("{}: conflict resolved", ctx.guid);
}

pub(super) fn resolve_accept_disk(ctx: &mut MergeState, _: &MergeEvent) {
    if let Some(text) = ctx.conflict.as_ref().map(|c| c.disk_text().to_string()) {
        resolve_with(ctx, &text);
    }
}

pub(super) fn resolve_accept_local(ctx: &mut MergeState, _: &MergeEvent) {
    if let Some(text) = ctx.conflict.as_ref().map(|c| c.local.clone()) {
        resolve_with(ctx, &text);
    }
}

pub(super) fn resolve_accept_merged(ctx: &mut MergeState, ev: &MergeEvent) {
    if let MergeEvent::ResolveAcceptMerged { contents } = ev {
        resolve_with(ctx, contents);
    }
}

pub(super) fn defer_conflict(ctx: &mut MergeState, _: &MergeEvent) {
    let Some(conflict) = ctx.conflict.take() else {
        return;
    };
    let (disk_hash, local_hash) = conflict.hashes();
    ctx.deferred_conflict = Some(DeferredConflict {
        disk_hash,
        local_hash,
    });
    if conflict.divergent {
        ctx.conflict = Some(conflict);
    }
    if let Some(text) = ctx.local.as_ref().map(Replica::text) {
        ctx.dispatch_to_editor(&text);
    }
    ctx.persist_state();
    tracing::info!("{}: conflict deferred", ctx.guid);
}

// ===========================================
// Unloading
// ===========================================

pub(super) fn apply_cleanup(ctx: &mut MergeState, ev: &MergeEvent) {
    let MergeEvent::InvokeDone(InvokeOutput::Cleaned {
        disk_matches_local,
        contents,
    }) = ev
    else {
        return;
    };
    if *disk_matches_local {
        ctx.advance_lca(contents);
        ctx.local_hash = Some(ContentHash::of(contents));
    }
    ctx.persist_state();
}

pub(super) fn finish_unload(ctx: &mut MergeState, _: &MergeEvent) {
    ctx.local_doc = None;
    ctx.remote_doc = None;
    ctx.pending_disk = None;
    ctx.conflict = None;
    ctx.idle_conflict = false;
    ctx.unload_requested = false;
    ctx.persistence_loaded = false;
    tracing::info!("{}: unloaded", ctx.guid);
}
