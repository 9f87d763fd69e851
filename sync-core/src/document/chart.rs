//! The document chart and the registry that backs its names.

use crate::hsm::{Invoke, MachineDefinition, Registry, StateNode, Transition};

use super::context::MergeState;
use super::events::MergeEvent;
use super::{actions, guards, invokes};

/// Chart id, also the default log label.
pub const CHART_ID: &str = "document";

/// States that accept but postpone work; buffered events replay once the
/// machine leaves them.
pub const WAITING_STATES: &[&str] = &[
    "loading",
    "active.loading",
    "active.entering",
    "active.merging",
    "unloading",
];

fn buffer(node: StateNode, events: &[&str]) -> StateNode {
    events.iter().fold(node, |node, event| {
        node.on(*event, Transition::internal().action("bufferEvent"))
    })
}

fn with_network(node: StateNode) -> StateNode {
    node.on("CONNECTED", Transition::internal().action("setOnline"))
        .on("DISCONNECTED", Transition::internal().action("setOffline"))
        .on(
            "PROVIDER_SYNCED",
            Transition::internal().action("markProviderSynced"),
        )
}

/// Build the document chart.
pub fn definition() -> MachineDefinition {
    MachineDefinition::new(CHART_ID, "unloaded")
        // ---- lifecycle ----
        .state(
            StateNode::new("unloaded")
                .on("LOAD", Transition::to("loading").action("assignIdentity")),
        )
        .state(buffer(
            with_network(StateNode::new("loading"))
                .on(
                    "PERSISTENCE_LOADED",
                    Transition::to("idle").action("applyPersisted"),
                )
                .on("UNLOAD", Transition::to("unloaded"))
                .on("ERROR", Transition::to("idle.error").action("recordError")),
            &[
                "DISK_CHANGED",
                "REMOTE_UPDATE",
                "ACQUIRE_LOCK",
                "RELEASE_LOCK",
                "CM6_CHANGE",
                "CHECK_DRIFT",
                "SAVE_COMPLETE",
            ],
        ))
        // ---- idle ----
        .state(
            with_network(StateNode::new("idle").initial("loading"))
                .on(
                    "ACQUIRE_LOCK",
                    Transition::to("active").actions(["clearError", "acceptLock"]),
                )
                .on("UNLOAD", Transition::to("unloading").action("requestUnload"))
                .on("ERROR", Transition::to("idle.error").action("recordError"))
                .on(
                    "DISK_CHANGED",
                    Transition::internal()
                        .guard("isDiskEcho")
                        .action("recordDiskMeta"),
                )
                .on("DISK_CHANGED", Transition::to("idle.loading").action("stashDisk"))
                .on(
                    "REMOTE_UPDATE",
                    Transition::to("idle.loading").action("appendRemote"),
                )
                .on("SAVE_COMPLETE", Transition::internal().action("recordSave"))
                .on(
                    "PERSISTENCE_LOADED",
                    Transition::to("idle.loading").action("applyPersisted"),
                ),
        )
        .state(
            StateNode::new("idle.loading")
                .always(Transition::to("idle.synced").guard("isSynced"))
                .always(Transition::to("idle.localAhead").guard("isLocalAhead"))
                .always(Transition::to("idle.remoteAhead").guard("isRemoteAhead"))
                .always(Transition::to("idle.diskAhead").guard("isDiskAhead"))
                .always(Transition::to("idle.diverged")),
        )
        .state(StateNode::new("idle.synced").entry("clearIdleConflict"))
        .state(
            StateNode::new("idle.localAhead")
                .always(Transition::to("idle.diverged").guard("canReconcile")),
        )
        .state(
            StateNode::new("idle.remoteAhead").invoke(
                Invoke::new("autoMerge")
                    .on_done(Transition::to("idle.synced").guard("isUnchanged"))
                    .on_done(Transition::to("idle.synced").action("applyIdleReconcile"))
                    .on_error(Transition::to("idle.error").action("recordError")),
            ),
        )
        .state(
            StateNode::new("idle.diskAhead").invoke(
                Invoke::new("ingestDisk")
                    .on_done(Transition::to("idle.loading").guard("isUnchanged"))
                    .on_done(Transition::to("idle.localAhead").action("applyIngest"))
                    .on_error(Transition::to("idle.error").action("recordError")),
            ),
        )
        .state(
            StateNode::new("idle.diverged").invoke(
                Invoke::new("reconcileIdle")
                    .on_done(
                        Transition::internal()
                            .guard("isConflicted")
                            .action("applyIdleConflict"),
                    )
                    .on_done(Transition::to("idle.synced").action("applyIdleReconcile"))
                    .on_error(Transition::to("idle.error").action("recordError")),
            ),
        )
        .state(
            StateNode::new("idle.error").on(
                "LOAD",
                Transition::to("loading").actions(["clearError", "assignIdentity"]),
            ),
        )
        // ---- active ----
        .state(
            with_network(StateNode::new("active").initial("loading"))
                .exit("suspendReplicas")
                .on("RELEASE_LOCK", Transition::to("unloading"))
                .on("UNLOAD", Transition::to("unloading").action("requestUnload"))
                .on("ERROR", Transition::internal().action("recordError"))
                .on(
                    "REMOTE_UPDATE",
                    Transition::internal().action("applyRemoteUpdate"),
                )
                .on(
                    "CM6_CHANGE",
                    Transition::internal()
                        .guard("isFromReplica")
                        .action("recordEditorText"),
                )
                .on(
                    "CM6_CHANGE",
                    Transition::internal().action("applyEditorChange"),
                )
                .on(
                    "SAVE_COMPLETE",
                    Transition::internal().action("recordSaveActive"),
                )
                .on("ACQUIRE_LOCK", Transition::internal().action("rejectLock")),
        )
        .state(
            StateNode::new("active.loading")
                .entry("createReplicas")
                .always(Transition::to("active.entering")),
        )
        .state(buffer(
            StateNode::new("active.entering").initial("awaitingPersistence"),
            &[
                "DISK_CHANGED",
                "REMOTE_UPDATE",
                "CM6_CHANGE",
                "CHECK_DRIFT",
                "RELEASE_LOCK",
                "UNLOAD",
            ],
        ))
        .state(
            StateNode::new("active.entering.awaitingPersistence")
                .always(
                    Transition::to("active.entering.awaitingRemote")
                        .guard("hasUnconfirmedFork"),
                )
                .always(Transition::to("active.entering.reconciling").guard("hasPriorContent"))
                .always(
                    Transition::to("active.entering.awaitingRemote")
                        .guard("isPersistenceLoaded"),
                )
                .on(
                    "PERSISTENCE_LOADED",
                    Transition::to("active.entering.awaitingPersistence")
                        .actions(["applyPersisted", "createReplicas"]),
                ),
        )
        .state(
            StateNode::new("active.entering.awaitingRemote")
                .always(Transition::to("active.entering.reconciling").guard("isProviderSynced"))
                .on(
                    "REMOTE_UPDATE",
                    Transition::internal().action("stageRemoteUpdate"),
                )
                .on("RELEASE_LOCK", Transition::to("unloading"))
                .on("UNLOAD", Transition::to("unloading").action("requestUnload")),
        )
        .state(
            StateNode::new("active.entering.reconciling").invoke(
                Invoke::new("reconcileActive")
                    .on_done(
                        Transition::to("active.tracking")
                            .guard("isReconciled")
                            .action("applyActiveReconcile"),
                    )
                    .on_done(
                        Transition::to("active.tracking")
                            .guard("isDeferredConflict")
                            .action("keepDeferred"),
                    )
                    .on_done(Transition::to("active.conflict").action("setConflict"))
                    .on_error(Transition::to("active.tracking").action("recordError")),
            ),
        )
        .state(
            StateNode::new("active.tracking")
                .on(
                    "DISK_CHANGED",
                    Transition::internal()
                        .guard("isDiskEcho")
                        .action("recordDiskMeta"),
                )
                .on(
                    "DISK_CHANGED",
                    Transition::internal()
                        .guard("isProviderUnsynced")
                        .action("forkAndIngest"),
                )
                .on(
                    "DISK_CHANGED",
                    Transition::to("active.merging.twoWay")
                        .guard("isLocalUnchanged")
                        .action("stashDisk"),
                )
                .on(
                    "DISK_CHANGED",
                    Transition::to("active.merging.threeWay").action("stashDisk"),
                )
                .on("CHECK_DRIFT", Transition::internal().action("checkDrift"))
                .on(
                    "PROVIDER_SYNCED",
                    Transition::to("active.entering.reconciling")
                        .guard("hasDivergence")
                        .actions(["markProviderSynced", "snapshotEditor"]),
                )
                .on(
                    "PROVIDER_SYNCED",
                    Transition::internal().action("markProviderSynced"),
                ),
        )
        .state(buffer(
            StateNode::new("active.merging").initial("twoWay"),
            &[
                "DISK_CHANGED",
                "REMOTE_UPDATE",
                "CM6_CHANGE",
                "CHECK_DRIFT",
                "RELEASE_LOCK",
                "UNLOAD",
            ],
        ))
        .state(
            StateNode::new("active.merging.twoWay").invoke(
                Invoke::new("mergeTwoWay")
                    .on_done(
                        Transition::to("active.tracking")
                            .guard("isMerged")
                            .action("applyActiveMerge"),
                    )
                    .on_done(Transition::to("active.tracking"))
                    .on_error(Transition::to("active.tracking").action("recordError")),
            ),
        )
        .state(
            StateNode::new("active.merging.threeWay").invoke(
                Invoke::new("mergeThreeWay")
                    .on_done(
                        Transition::to("active.tracking")
                            .guard("isMerged")
                            .action("applyActiveMerge"),
                    )
                    .on_done(
                        Transition::to("active.tracking")
                            .guard("isDeferredConflict")
                            .action("keepDeferred"),
                    )
                    .on_done(
                        Transition::to("active.conflict")
                            .guard("isConflicted")
                            .action("setConflict"),
                    )
                    .on_done(Transition::to("active.tracking"))
                    .on_error(Transition::to("active.tracking").action("recordError")),
            ),
        )
        .state(
            StateNode::new("active.conflict")
                .initial("bannerShown")
                .exit("hideDecorations")
                .on(
                    "RESOLVE_ACCEPT_DISK",
                    Transition::to("active.tracking").action("resolveAcceptDisk"),
                )
                .on(
                    "RESOLVE_ACCEPT_LOCAL",
                    Transition::to("active.tracking").action("resolveAcceptLocal"),
                )
                .on(
                    "RESOLVE_ACCEPT_MERGED",
                    Transition::to("active.tracking").action("resolveAcceptMerged"),
                )
                .on("DISK_CHANGED", Transition::internal().action("recordDiskMeta")),
        )
        .state(
            StateNode::new("active.conflict.bannerShown")
                .entry("showDecorations")
                .on(
                    "DISMISS_CONFLICT",
                    Transition::to("active.tracking").action("deferConflict"),
                )
                .on(
                    "OPEN_DIFF_VIEW",
                    Transition::to("active.conflict.resolving"),
                ),
        )
        .state(
            StateNode::new("active.conflict.resolving")
                .on("CANCEL", Transition::to("active.conflict.bannerShown")),
        )
        // ---- unloading ----
        .state(buffer(
            with_network(StateNode::new("unloading"))
                .on("UNLOAD", Transition::internal().action("requestUnload"))
                .on("ERROR", Transition::internal().action("recordError"))
                .invoke(
                    Invoke::new("cleanup")
                        .on_done(
                            Transition::to("unloaded")
                                .guard("isUnloadRequested")
                                .actions(["applyCleanup", "finishUnload"]),
                        )
                        .on_done(Transition::to("idle").action("applyCleanup"))
                        .on_error(
                            Transition::to("unloaded")
                                .guard("isUnloadRequested")
                                .actions(["recordError", "finishUnload"]),
                        )
                        .on_error(Transition::to("idle.error").action("recordError")),
                ),
            &[
                "ACQUIRE_LOCK",
                "DISK_CHANGED",
                "REMOTE_UPDATE",
                "CM6_CHANGE",
                "LOAD",
            ],
        ))
}

/// Build the registry resolving every name the chart uses.
pub fn registry() -> Registry<MergeState, MergeEvent> {
    Registry::new()
        // guards
        .guard("isSynced", guards::is_synced)
        .guard("isLocalAhead", guards::is_local_ahead)
        .guard("isRemoteAhead", guards::is_remote_ahead)
        .guard("isDiskAhead", guards::is_disk_ahead)
        .guard("canReconcile", guards::can_reconcile)
        .guard("isUnchanged", guards::is_unchanged)
        .guard("isReconciled", guards::is_reconciled)
        .guard("isConflicted", guards::is_conflicted)
        .guard("isMerged", guards::is_merged)
        .guard("isDeferredConflict", guards::is_deferred_conflict)
        .guard("isFromReplica", guards::is_from_replica)
        .guard("isDiskEcho", guards::is_disk_echo)
        .guard("isProviderUnsynced", guards::is_provider_unsynced)
        .guard("isLocalUnchanged", guards::is_local_unchanged)
        .guard("hasDivergence", guards::has_divergence)
        .guard("isPersistenceLoaded", guards::is_persistence_loaded)
        .guard("hasPriorContent", guards::has_prior_content)
        .guard("hasUnconfirmedFork", guards::has_unconfirmed_fork)
        .guard("isProviderSynced", guards::is_provider_synced)
        .guard("isUnloadRequested", guards::is_unload_requested)
        // actions
        .action("assignIdentity", actions::assign_identity)
        .action("bufferEvent", actions::buffer_event)
        .action("applyPersisted", actions::apply_persisted)
        .action("recordError", actions::record_error)
        .action("clearError", actions::clear_error)
        .action("acceptLock", actions::accept_lock)
        .action("rejectLock", actions::reject_lock)
        .action("requestUnload", actions::request_unload)
        .action("setOnline", actions::set_online)
        .action("setOffline", actions::set_offline)
        .action("markProviderSynced", actions::mark_provider_synced)
        .action("recordDiskMeta", actions::record_disk_meta)
        .action("stashDisk", actions::stash_disk)
        .action("recordSave", actions::record_save)
        .action("recordSaveActive", actions::record_save_active)
        .action("appendRemote", actions::append_remote)
        .action("clearIdleConflict", actions::clear_idle_conflict)
        .action("applyIdleReconcile", actions::apply_idle_reconcile)
        .action("applyIngest", actions::apply_ingest)
        .action("applyIdleConflict", actions::apply_idle_conflict)
        .action("createReplicas", actions::create_replicas)
        .action("suspendReplicas", actions::suspend_replicas)
        .action("applyActiveReconcile", actions::apply_active_reconcile)
        .action("recordEditorText", actions::record_editor_text)
        .action("applyEditorChange", actions::apply_editor_change)
        .action("checkDrift", actions::check_drift)
        .action("applyRemoteUpdate", actions::apply_remote_update)
        .action("stageRemoteUpdate", actions::stage_remote_update)
        .action("forkAndIngest", actions::fork_and_ingest)
        .action("snapshotEditor", actions::snapshot_editor)
        .action("applyActiveMerge", actions::apply_active_merge)
        .action("setConflict", actions::set_conflict)
        .action("keepDeferred", actions::keep_deferred)
        .action("showDecorations", actions::show_decorations)
        .action("hideDecorations", actions::hide_decorations)
        .action("resolveAcceptDisk", actions::resolve_accept_disk)
        .action("resolveAcceptLocal", actions::resolve_accept_local)
        .action("resolveAcceptMerged", actions::resolve_accept_merged)
        .action("deferConflict", actions::defer_conflict)
        .action("applyCleanup", actions::apply_cleanup)
        .action("finishUnload", actions::finish_unload)
        // invokes
        .invoke("autoMerge", invokes::auto_merge)
        .invoke("ingestDisk", invokes::ingest_disk)
        .invoke("reconcileIdle", invokes::reconcile_idle)
        .invoke("reconcileActive", invokes::reconcile_active)
        .invoke("mergeTwoWay", invokes::merge_two_way)
        .invoke("mergeThreeWay", invokes::merge_three_way)
        .invoke("cleanup", invokes::cleanup)
}
