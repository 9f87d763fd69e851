//! Construction-time validation of a chart against a registry.

use thiserror::Error;

use super::definition::{parent_of, MachineDefinition, Transition};
use super::registry::Registry;

/// An unresolved or malformed reference in a chart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The chart's initial state does not exist.
    #[error("initial state '{0}' does not exist")]
    UnknownInitial(String),

    /// A transition targets a state that does not exist.
    #[error("state '{state}' ({event}): unknown target '{target}'")]
    UnknownTarget {
        /// State declaring the transition.
        state: String,
        /// Event or handler label.
        event: String,
        /// Missing target.
        target: String,
    },

    /// A guard name is not registered.
    #[error("state '{state}' ({event}): unknown guard '{name}'")]
    UnknownGuard {
        /// State declaring the transition.
        state: String,
        /// Event or handler label.
        event: String,
        /// Missing guard.
        name: String,
    },

    /// An action name is not registered.
    #[error("state '{state}' ({event}): unknown action '{name}'")]
    UnknownAction {
        /// State declaring the action.
        state: String,
        /// Event, handler label, `entry` or `exit`.
        event: String,
        /// Missing action.
        name: String,
    },

    /// An invoke source is not registered.
    #[error("state '{state}': unknown invoke source '{name}'")]
    UnknownInvoke {
        /// State declaring the invoke.
        state: String,
        /// Missing source.
        name: String,
    },

    /// A compound state has no (valid) initial child.
    #[error("compound state '{0}' has no valid initial child")]
    MissingInitial(String),

    /// An unguarded candidate is followed by more candidates.
    #[error("state '{state}' ({event}): unguarded candidate {index} is not last")]
    UnreachableCandidate {
        /// State declaring the candidates.
        state: String,
        /// Event or handler label.
        event: String,
        /// Position of the unguarded candidate.
        index: usize,
    },

    /// A state path has no declared parent.
    #[error("state '{0}' has no parent state")]
    Orphan(String),
}

/// Check every reference in `def` against `registry`.
///
/// Returns every problem found, not just the first.
pub fn validate<C, E>(
    def: &MachineDefinition,
    registry: &Registry<C, E>,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if def.get(&def.initial).is_none() {
        errors.push(ValidationError::UnknownInitial(def.initial.clone()));
    }

    for node in def.states() {
        if let Some(parent) = parent_of(&node.id) {
            if def.get(parent).is_none() {
                errors.push(ValidationError::Orphan(node.id.clone()));
            }
        }

        if def.is_compound(&node.id) {
            let valid = node.initial.as_deref().is_some_and(|child| {
                parent_of(child) == Some(node.id.as_str()) && def.get(child).is_some()
            });
            if !valid {
                errors.push(ValidationError::MissingInitial(node.id.clone()));
            }
        }

        for (label, names) in [("entry", &node.entry), ("exit", &node.exit)] {
            for name in names {
                if !registry.has_action(name) {
                    errors.push(ValidationError::UnknownAction {
                        state: node.id.clone(),
                        event: label.to_string(),
                        name: name.clone(),
                    });
                }
            }
        }

        if let Some(invoke) = &node.invoke {
            if !registry.has_invoke(&invoke.src) {
                errors.push(ValidationError::UnknownInvoke {
                    state: node.id.clone(),
                    name: invoke.src.clone(),
                });
            }
        }

        for (event, candidates) in node.transitions() {
            check_candidates(def, registry, &node.id, &event, candidates, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_candidates<C, E>(
    def: &MachineDefinition,
    registry: &Registry<C, E>,
    state: &str,
    event: &str,
    candidates: &[Transition],
    errors: &mut Vec<ValidationError>,
) {
    for (index, transition) in candidates.iter().enumerate() {
        if let Some(target) = &transition.target {
            if def.get(target).is_none() {
                errors.push(ValidationError::UnknownTarget {
                    state: state.to_string(),
                    event: event.to_string(),
                    target: target.clone(),
                });
            }
        }
        match &transition.guard {
            Some(guard) if !registry.has_guard(guard) => {
                errors.push(ValidationError::UnknownGuard {
                    state: state.to_string(),
                    event: event.to_string(),
                    name: guard.clone(),
                });
            }
            None if index + 1 < candidates.len() => {
                errors.push(ValidationError::UnreachableCandidate {
                    state: state.to_string(),
                    event: event.to_string(),
                    index,
                });
            }
            _ => {}
        }
        for action in &transition.actions {
            if !registry.has_action(action) {
                errors.push(ValidationError::UnknownAction {
                    state: state.to_string(),
                    event: event.to_string(),
                    name: action.clone(),
                });
            }
        }
    }
}
