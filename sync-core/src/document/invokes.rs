//! Invoke sources.
//!
//! Each source snapshots what it needs from the context (encoded replicas,
//! texts) and returns a `'static` future. The futures are CPU-only; drivers
//! may spawn them or poll them inline.

use futures_util::future::{BoxFuture, FutureExt};
use sync_types::{ContentHash, DiskState};

use super::context::MergeState;
use super::events::{ConflictState, Conflicted, InvokeOutput, MergeEvent, Reconciled};
use crate::merge::{three_way_merge, three_way_merge_guarded, two_way_merge, MergeResult};
use crate::replica::{text_of, Replica, ReplicaError};

type InvokeFuture = BoxFuture<'static, Result<MergeEvent, MergeEvent>>;

fn finish(result: Result<InvokeOutput, ReplicaError>) -> Result<MergeEvent, MergeEvent> {
    result
        .map(MergeEvent::InvokeDone)
        .map_err(|e| MergeEvent::InvokeFailed {
            error: e.to_string(),
        })
}

fn load(bytes: &[u8]) -> Result<Replica, ReplicaError> {
    if bytes.is_empty() {
        Ok(Replica::new())
    } else {
        Replica::from_update(bytes)
    }
}

fn live_or_encoded(live: Option<&Replica>, encoded: Option<&Vec<u8>>) -> Vec<u8> {
    match live {
        Some(replica) => replica.encode_state(),
        None => encoded.cloned().unwrap_or_default(),
    }
}

// ===========================================
// Idle
// ===========================================

/// `idle.remoteAhead`: fold remote history into the local replica.
pub(super) fn auto_merge(ctx: &MergeState, _: &MergeEvent) -> InvokeFuture {
    let local_doc = ctx.local_doc.clone().unwrap_or_default();
    let remote_doc = ctx.remote_doc.clone().unwrap_or_default();
    async move { finish(apply_remote(&local_doc, &remote_doc)) }.boxed()
}

fn apply_remote(local_doc: &[u8], remote_doc: &[u8]) -> Result<InvokeOutput, ReplicaError> {
    let mut local = load(local_doc)?;
    let mut remote = load(remote_doc)?;
    let local_sv = local.state_vector();
    if !remote.has_history_beyond(&local_sv)? {
        return Ok(InvokeOutput::Unchanged);
    }
    let update = remote.encode_diff(&local_sv)?;
    local.apply_update(&update)?;
    let contents = local.text();
    let remote_update = catch_up(&local, &mut remote)?;
    Ok(InvokeOutput::Reconciled(Reconciled {
        contents,
        local_state: local.encode_state(),
        local_update: update,
        rebuilt: false,
        remote_state: remote.encode_state(),
        remote_update,
        fork_cleared: false,
    }))
}

/// `idle.diskAhead`: write pending disk contents into the local replica.
pub(super) fn ingest_disk(ctx: &MergeState, _: &MergeEvent) -> InvokeFuture {
    let local_doc = ctx.local_doc.clone().unwrap_or_default();
    let disk = ctx.pending_disk.clone();
    let fork_base = ctx.fork.as_ref().map(|fork| fork.base.clone());
    async move {
        match disk {
            Some(disk) => finish(ingest(&local_doc, disk, fork_base)),
            None => finish(Ok(InvokeOutput::Unchanged)),
        }
    }
    .boxed()
}

fn ingest(
    local_doc: &[u8],
    disk: DiskState,
    fork_base: Option<String>,
) -> Result<InvokeOutput, ReplicaError> {
    let mut local = load(local_doc)?;
    let fork_base = fork_base.unwrap_or_else(|| local.text());
    let (_, update) = local.set_text(&disk.contents)?;
    Ok(InvokeOutput::Ingested {
        fork_base,
        local_state: local.encode_state(),
        update,
        disk,
    })
}

/// `idle.diverged`: reconcile local and remote, ingesting pending disk
/// contents first.
pub(super) fn reconcile_idle(ctx: &MergeState, _: &MergeEvent) -> InvokeFuture {
    let input = ReconcileInput {
        base: ctx.merge_base(),
        had_fork: ctx.fork.is_some(),
        divergent: ctx.histories_diverged(),
        local_state: ctx.local_doc.clone().unwrap_or_default(),
        remote_state: ctx.remote_doc.clone().unwrap_or_default(),
        pending_disk: ctx.pending_disk.clone(),
        editor: None,
        editor_base: None,
    };
    async move { finish(reconcile(input)) }.boxed()
}

/// `active.entering.reconciling`: reconcile live replicas, then fold in the
/// text the editor opened with.
pub(super) fn reconcile_active(ctx: &MergeState, _: &MergeEvent) -> InvokeFuture {
    let input = ReconcileInput {
        base: ctx.merge_base(),
        had_fork: ctx.fork.is_some(),
        divergent: ctx.histories_diverged(),
        local_state: live_or_encoded(ctx.local.as_ref(), ctx.local_doc.as_ref()),
        remote_state: live_or_encoded(ctx.remote.as_ref(), ctx.remote_doc.as_ref()),
        pending_disk: None,
        editor: ctx.pending_editor_content.clone(),
        editor_base: ctx.lca.as_ref().map(|lca| lca.contents.clone()),
    };
    async move { finish(reconcile(input)) }.boxed()
}

struct ReconcileInput {
    base: String,
    had_fork: bool,
    divergent: bool,
    local_state: Vec<u8>,
    remote_state: Vec<u8>,
    pending_disk: Option<DiskState>,
    editor: Option<String>,
    editor_base: Option<String>,
}

fn reconcile(input: ReconcileInput) -> Result<InvokeOutput, ReplicaError> {
    let mut local = load(&input.local_state)?;
    let remote = load(&input.remote_state)?;
    let original = (local.state_vector(), local.text());
    let mut base = input.base;
    let mut divergent = input.divergent;
    let mut ingested = false;

    if let Some(disk) = &input.pending_disk {
        if !divergent {
            base = local.text();
        }
        local.set_text(&disk.contents)?;
        divergent = true;
        ingested = true;
    }
    let fork_cleared = input.had_fork || ingested;
    let remote_has_news = remote.has_history_beyond(&local.state_vector())?;

    // Divergent histories are merged by text, never by CRDT union.
    let (mut local, rebuilt, mut text) = if divergent {
        let local_text = local.text();
        let remote_text = remote.text();
        match three_way_merge_guarded(&base, &local_text, &remote_text, remote_has_news) {
            MergeResult::Failure(failure) => {
                let replicas = if ingested {
                    Some(snapshot(&local, &remote, &original, false, fork_cleared)?)
                } else {
                    None
                };
                return Ok(InvokeOutput::Conflicted(Conflicted {
                    conflict: ConflictState {
                        base,
                        local: local_text,
                        other: remote_text,
                        other_is_disk: false,
                        divergent: true,
                        regions: failure.conflict_regions,
                    },
                    replicas,
                    fork_cleared,
                }));
            }
            MergeResult::Success(success) if remote_has_news => {
                let mut rebuilt = remote.fork()?;
                rebuilt.set_text(&success.merged)?;
                (rebuilt, true, success.merged)
            }
            MergeResult::Success(success) => {
                local.set_text(&success.merged)?;
                (local, false, success.merged)
            }
        }
    } else {
        if remote_has_news {
            let update = remote.encode_diff(&local.state_vector())?;
            local.apply_update(&update)?;
        }
        let text = local.text();
        (local, false, text)
    };

    if let Some(editor) = input.editor.as_deref().filter(|editor| *editor != text) {
        let ancestor = input.editor_base.unwrap_or_default();
        if editor != ancestor {
            match three_way_merge(&ancestor, &text, editor) {
                MergeResult::Success(success) => {
                    local.set_text(&success.merged)?;
                    text = success.merged;
                }
                MergeResult::Failure(failure) => {
                    let replicas =
                        snapshot(&local, &remote, &original, rebuilt, fork_cleared)?;
                    return Ok(InvokeOutput::Conflicted(Conflicted {
                        conflict: ConflictState {
                            base: ancestor,
                            local: text,
                            other: editor.to_string(),
                            other_is_disk: true,
                            divergent: false,
                            regions: failure.conflict_regions,
                        },
                        replicas: Some(replicas),
                        fork_cleared,
                    }));
                }
            }
        }
    }

    let reconciled = snapshot(&local, &remote, &original, rebuilt, fork_cleared)?;
    debug_assert_eq!(reconciled.contents, text);
    Ok(InvokeOutput::Reconciled(reconciled))
}

/// Whether `replica` differs from a recorded `(state vector, text)` pair.
/// Deletions leave the state vector alone, so the text is compared too.
fn moved_since(replica: &Replica, state_vector: &[u8], text: &str) -> Result<bool, ReplicaError> {
    Ok(replica.has_history_beyond(state_vector)? || replica.text() != text)
}

/// Send `remote` whatever `local` has that it lacks. Returns the update, or
/// nothing when `remote` is already current.
fn catch_up(local: &Replica, remote: &mut Replica) -> Result<Vec<u8>, ReplicaError> {
    let remote_sv = remote.state_vector();
    if !moved_since(local, &remote_sv, &remote.text())? {
        return Ok(Vec::new());
    }
    let update = local.encode_diff(&remote_sv)?;
    remote.apply_update(&update)?;
    Ok(update)
}

/// Bring `remote` up to `local` and capture both.
fn snapshot(
    local: &Replica,
    remote: &Replica,
    original: &(Vec<u8>, String),
    rebuilt: bool,
    fork_cleared: bool,
) -> Result<Reconciled, ReplicaError> {
    let mut remote = remote.fork()?;
    let remote_update = if rebuilt || !remote.has_history_beyond(&local.state_vector())? {
        catch_up(local, &mut remote)?
    } else {
        // Remote holds history the local side chose not to union.
        Vec::new()
    };
    let local_update = if moved_since(local, &original.0, &original.1)? {
        local.encode_diff(&original.0)?
    } else {
        Vec::new()
    };
    Ok(Reconciled {
        contents: local.text(),
        local_state: local.encode_state(),
        local_update,
        rebuilt,
        remote_state: remote.encode_state(),
        remote_update,
        fork_cleared,
    })
}

// ===========================================
// Active
// ===========================================

/// `active.merging.twoWay`: only disk moved since the ancestor.
pub(super) fn merge_two_way(ctx: &MergeState, _: &MergeEvent) -> InvokeFuture {
    let base = ctx.merge_base();
    let disk = ctx.pending_disk.as_ref().map(|disk| disk.contents.clone());
    async move {
        let output = match disk.map(|disk| two_way_merge(&base, &disk)) {
            Some(MergeResult::Success(success)) => InvokeOutput::Merged {
                text: success.merged,
            },
            _ => InvokeOutput::Unchanged,
        };
        finish(Ok(output))
    }
    .boxed()
}

/// `active.merging.threeWay`: disk and local both moved.
pub(super) fn merge_three_way(ctx: &MergeState, _: &MergeEvent) -> InvokeFuture {
    let base = ctx.merge_base();
    let local = ctx.local_text().unwrap_or_default();
    let disk = ctx.pending_disk.as_ref().map(|disk| disk.contents.clone());
    let divergent = ctx.histories_diverged();
    async move {
        let Some(disk) = disk else {
            return finish(Ok(InvokeOutput::Unchanged));
        };
        let output = match three_way_merge(&base, &local, &disk) {
            MergeResult::Success(success) => InvokeOutput::Merged {
                text: success.merged,
            },
            MergeResult::Failure(failure) => InvokeOutput::Conflicted(Conflicted {
                conflict: ConflictState {
                    base,
                    local,
                    other: disk,
                    other_is_disk: true,
                    divergent,
                    regions: failure.conflict_regions,
                },
                replicas: None,
                fork_cleared: false,
            }),
        };
        finish(Ok(output))
    }
    .boxed()
}

// ===========================================
// Unloading
// ===========================================

/// `unloading`: check whether disk and local text agree.
pub(super) fn cleanup(ctx: &MergeState, _: &MergeEvent) -> InvokeFuture {
    let local_doc = ctx.local_doc.clone().unwrap_or_default();
    let disk_hash = ctx.disk.as_ref().map(|disk| disk.hash.clone());
    async move {
        let contents = if local_doc.is_empty() {
            Ok(String::new())
        } else {
            text_of(&local_doc)
        };
        finish(contents.map(|contents| InvokeOutput::Cleaned {
            disk_matches_local: disk_hash == Some(ContentHash::of(&contents)),
            contents,
        }))
    }
    .boxed()
}
