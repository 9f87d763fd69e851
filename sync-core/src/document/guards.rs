//! Guards of the document chart.

use sync_types::ContentHash;

use super::context::MergeState;
use super::events::{InvokeOutput, MergeEvent};

// ===========================================
// Idle classification
// ===========================================

pub(super) fn is_synced(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.fork.is_none() && !ctx.idle_conflict && ctx.deviations().none()
}

pub(super) fn is_local_ahead(ctx: &MergeState, _: &MergeEvent) -> bool {
    let dev = ctx.deviations();
    (ctx.fork.is_some() && !dev.disk) || (dev.local && !dev.remote && !dev.disk)
}

pub(super) fn is_remote_ahead(ctx: &MergeState, _: &MergeEvent) -> bool {
    let dev = ctx.deviations();
    dev.remote && !dev.local && !dev.disk && !ctx.histories_diverged()
}

pub(super) fn is_disk_ahead(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.deviations().disk
}

/// A forked local replica may only be reconciled once the network replica
/// is known to be fresh.
pub(super) fn can_reconcile(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.provider_synced || (ctx.fork.is_none() && ctx.pending_disk.is_none())
}

// ===========================================
// Invoke outputs
// ===========================================

pub(super) fn is_unchanged(_: &MergeState, ev: &MergeEvent) -> bool {
    matches!(ev, MergeEvent::InvokeDone(InvokeOutput::Unchanged))
}

pub(super) fn is_reconciled(_: &MergeState, ev: &MergeEvent) -> bool {
    matches!(ev, MergeEvent::InvokeDone(InvokeOutput::Reconciled(_)))
}

pub(super) fn is_conflicted(_: &MergeState, ev: &MergeEvent) -> bool {
    matches!(ev, MergeEvent::InvokeDone(InvokeOutput::Conflicted(_)))
}

pub(super) fn is_merged(_: &MergeState, ev: &MergeEvent) -> bool {
    matches!(ev, MergeEvent::InvokeDone(InvokeOutput::Merged { .. }))
}

/// The conflict carries the same hash pair the user already deferred.
pub(super) fn is_deferred_conflict(ctx: &MergeState, ev: &MergeEvent) -> bool {
    let (MergeEvent::InvokeDone(InvokeOutput::Conflicted(conflicted)), Some(deferred)) =
        (ev, &ctx.deferred_conflict)
    else {
        return false;
    };
    let (disk_hash, local_hash) = conflicted.conflict.hashes();
    deferred.disk_hash == disk_hash && deferred.local_hash == local_hash
}

// ===========================================
// Active
// ===========================================

pub(super) fn is_from_replica(_: &MergeState, ev: &MergeEvent) -> bool {
    matches!(
        ev,
        MergeEvent::Cm6Change {
            is_from_replica: true,
            ..
        }
    )
}

/// Disk reports contents this machine already knows about.
pub(super) fn is_disk_echo(ctx: &MergeState, ev: &MergeEvent) -> bool {
    let MergeEvent::DiskChanged { hash, .. } = ev else {
        return false;
    };
    if ctx.last_written_hash.as_ref() == Some(hash) {
        return true;
    }
    if ctx.pending_disk.as_ref().is_some_and(|d| &d.hash == hash) {
        return true;
    }
    let local_hash = match &ctx.local {
        Some(local) => Some(ContentHash::of(&local.text())),
        None => ctx.local_hash.clone(),
    };
    local_hash.as_ref() == Some(hash)
}

pub(super) fn is_provider_unsynced(ctx: &MergeState, _: &MergeEvent) -> bool {
    !ctx.provider_synced
}

/// Local text still equals the ancestor, so only disk moved.
pub(super) fn is_local_unchanged(ctx: &MergeState, _: &MergeEvent) -> bool {
    match (&ctx.lca, &ctx.local) {
        (Some(lca), Some(local)) => {
            !ctx.histories_diverged() && lca.meta.hash.matches(&local.text())
        }
        _ => false,
    }
}

pub(super) fn has_divergence(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.histories_diverged()
}

pub(super) fn is_persistence_loaded(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.persistence_loaded
}

pub(super) fn has_prior_content(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.persistence_loaded
        && (ctx.lca.is_some() || ctx.local.as_ref().is_some_and(|l| !l.text().is_empty()))
}

/// A fork from an earlier disk edit is still waiting for network freshness.
pub(super) fn has_unconfirmed_fork(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.persistence_loaded && ctx.fork.is_some() && !ctx.provider_synced
}

pub(super) fn is_provider_synced(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.provider_synced
}

pub(super) fn is_unload_requested(ctx: &MergeState, _: &MergeEvent) -> bool {
    ctx.unload_requested
}
