//! Optional invariant checker for document machines.
//!
//! The checker observes a machine after every processed event and reports
//! violations of the reconciliation invariants. It is a diagnostics layer:
//! in `log` mode violations are only logged, in `fail` mode the first
//! violation is returned to the caller.

use serde::{Deserialize, Serialize};
use sync_types::{LcaState, SyncStatus};
use thiserror::Error;

use crate::document::MergeState;
use crate::hsm::is_within;

/// How bad a violation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Suspicious but recoverable.
    Warning,
    /// State is inconsistent.
    Error,
    /// Data loss is possible.
    Critical,
}

/// What the checker does with a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckerMode {
    /// Log and continue.
    #[default]
    Log,
    /// Return the violation to the caller.
    Fail,
}

/// Checker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Log or fail.
    #[serde(default)]
    pub mode: CheckerMode,
    /// Whether checks run at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    false
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            mode: CheckerMode::default(),
            enabled: default_enabled(),
        }
    }
}

impl CheckerConfig {
    /// Enabled, failing on the first violation. Used by tests.
    pub fn strict() -> Self {
        Self {
            mode: CheckerMode::Fail,
            enabled: true,
        }
    }
}

/// A broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{severity:?} invariant '{rule}' violated in {state}: {detail}")]
pub struct InvariantViolation {
    /// Rule name.
    pub rule: &'static str,
    /// Severity of the rule.
    pub severity: Severity,
    /// Leaf state after the event.
    pub state: String,
    /// What was observed.
    pub detail: String,
}

/// What the checker needs to remember from before an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Leaf state.
    pub state_path: String,
    /// Last common ancestor.
    pub lca: Option<LcaState>,
}

impl Observation {
    /// Capture the parts of `ctx` compared across an event.
    pub fn of(ctx: &MergeState) -> Self {
        Self {
            state_path: ctx.state_path.clone(),
            lca: ctx.lca.clone(),
        }
    }
}

/// Evaluate every rule for one processed event.
pub fn check_transition(
    before: &Observation,
    ctx: &MergeState,
    status: SyncStatus,
) -> Vec<InvariantViolation> {
    let state = ctx.state_path.as_str();
    let mut violations = Vec::new();
    let mut report = |rule, severity, detail: String| {
        violations.push(InvariantViolation {
            rule,
            severity,
            state: state.to_string(),
            detail,
        });
    };

    if is_within(&before.state_path, "active") && is_within(state, "active") && before.lca != ctx.lca
    {
        report(
            "lca-frozen-while-active",
            Severity::Critical,
            format!("ancestor reassigned during {} -> {}", before.state_path, state),
        );
    }
    if !is_within(state, "active") && (ctx.local.is_some() || ctx.remote.is_some()) {
        report(
            "replicas-live-only-while-active",
            Severity::Error,
            "live replica outside an editing session".to_string(),
        );
    }
    if state == "idle.synced" && ctx.fork.is_some() {
        report(
            "no-fork-when-synced",
            Severity::Critical,
            "fork survived reconciliation".to_string(),
        );
    }
    if is_within(state, "active.conflict") && ctx.conflict.is_none() {
        report(
            "conflict-state-has-conflict",
            Severity::Error,
            "conflict state without conflict data".to_string(),
        );
    }
    if status == SyncStatus::Synced && (ctx.fork.is_some() || ctx.error.is_some()) {
        report(
            "status-consistent",
            Severity::Warning,
            "synced status with a fork or error recorded".to_string(),
        );
    }
    violations
}

/// Runs [`check_transition`] and applies the configured mode.
#[derive(Debug, Clone, Default)]
pub struct InvariantChecker {
    config: CheckerConfig,
    violations: Vec<InvariantViolation>,
}

impl InvariantChecker {
    /// Create a checker.
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config,
            violations: Vec::new(),
        }
    }

    /// Whether checks run.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check one processed event.
    ///
    /// Every violation is logged and recorded. In `fail` mode the most severe
    /// one is returned.
    pub fn check(
        &mut self,
        before: &Observation,
        ctx: &MergeState,
        status: SyncStatus,
    ) -> Result<(), InvariantViolation> {
        if !self.config.enabled {
            return Ok(());
        }
        let found = check_transition(before, ctx, status);
        for violation in &found {
            match violation.severity {
                Severity::Warning => tracing::warn!("{}: {}", ctx.guid, violation),
                Severity::Error | Severity::Critical => {
                    tracing::error!("{}: {}", ctx.guid, violation)
                }
            }
        }
        let worst = found.iter().max_by_key(|v| v.severity).cloned();
        self.violations.extend(found);
        match (self.config.mode, worst) {
            (CheckerMode::Fail, Some(violation)) => Err(violation),
            _ => Ok(()),
        }
    }

    /// Every violation seen so far.
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }
}
