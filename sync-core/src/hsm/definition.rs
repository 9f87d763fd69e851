//! Declarative state charts.
//!
//! A [`MachineDefinition`] is plain data: states keyed by dotted path
//! (`"active.conflict.bannerShown"`), each with entry/exit actions, event
//! handlers, transient `always` transitions and an optional invoke. Guards,
//! actions and invoke sources are referenced by name and resolved against a
//! [`Registry`](super::Registry) when a machine is built.

use std::collections::BTreeMap;

/// One candidate transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Target state path. `None` means a targetless transition: actions run,
    /// no state is exited or entered.
    pub target: Option<String>,
    /// Guard name. A transition without a guard always matches.
    pub guard: Option<String>,
    /// Action names, run between exit and entry.
    pub actions: Vec<String>,
    /// When false and the target is the source state, exit/entry are skipped.
    pub reenter: bool,
}

impl Transition {
    /// Transition to `target`.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            guard: None,
            actions: Vec::new(),
            reenter: true,
        }
    }

    /// Targetless transition: actions only.
    pub fn internal() -> Self {
        Self {
            target: None,
            guard: None,
            actions: Vec::new(),
            reenter: false,
        }
    }

    /// Only take this transition when `guard` holds.
    pub fn guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    /// Append an action.
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    /// Append several actions.
    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.extend(actions.into_iter().map(Into::into));
        self
    }

    /// Skip exit/entry when the target equals the source.
    pub fn no_reenter(mut self) -> Self {
        self.reenter = false;
        self
    }
}

/// An asynchronous operation started on state entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoke {
    /// Invoke source name.
    pub src: String,
    /// Candidates evaluated with the success output.
    pub on_done: Vec<Transition>,
    /// Candidates evaluated with the failure output.
    pub on_error: Vec<Transition>,
}

impl Invoke {
    /// Invoke `src` with no handlers yet.
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            on_done: Vec::new(),
            on_error: Vec::new(),
        }
    }

    /// Add a success candidate.
    pub fn on_done(mut self, transition: Transition) -> Self {
        self.on_done.push(transition);
        self
    }

    /// Add a failure candidate.
    pub fn on_error(mut self, transition: Transition) -> Self {
        self.on_error.push(transition);
        self
    }
}

/// A state in the chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNode {
    /// Full dotted path.
    pub id: String,
    /// Full path of the initial child, for compound states.
    pub initial: Option<String>,
    /// Actions run on entry.
    pub entry: Vec<String>,
    /// Actions run on exit.
    pub exit: Vec<String>,
    /// Event kind to ordered candidates.
    pub on: BTreeMap<String, Vec<Transition>>,
    /// Transient transitions checked right after entry.
    pub always: Vec<Transition>,
    /// Operation started while this state is active.
    pub invoke: Option<Invoke>,
}

impl StateNode {
    /// A state at `id` with nothing declared.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial: None,
            entry: Vec::new(),
            exit: Vec::new(),
            on: BTreeMap::new(),
            always: Vec::new(),
            invoke: None,
        }
    }

    /// Initial child, given by its last path segment.
    pub fn initial(mut self, child: &str) -> Self {
        self.initial = Some(format!("{}.{}", self.id, child));
        self
    }

    /// Add an entry action.
    pub fn entry(mut self, action: impl Into<String>) -> Self {
        self.entry.push(action.into());
        self
    }

    /// Add an exit action.
    pub fn exit(mut self, action: impl Into<String>) -> Self {
        self.exit.push(action.into());
        self
    }

    /// Add a candidate for `event`. Candidates keep declaration order.
    pub fn on(mut self, event: impl Into<String>, transition: Transition) -> Self {
        self.on.entry(event.into()).or_default().push(transition);
        self
    }

    /// Add a transient candidate.
    pub fn always(mut self, transition: Transition) -> Self {
        self.always.push(transition);
        self
    }

    /// Start `invoke` whenever this state is entered.
    pub fn invoke(mut self, invoke: Invoke) -> Self {
        self.invoke = Some(invoke);
        self
    }

    /// Every transition declared on this node, with a label for diagnostics.
    pub(crate) fn transitions(&self) -> Vec<(String, &[Transition])> {
        let mut out: Vec<(String, &[Transition])> = self
            .on
            .iter()
            .map(|(event, list)| (event.clone(), list.as_slice()))
            .collect();
        if !self.always.is_empty() {
            out.push(("always".to_string(), self.always.as_slice()));
        }
        if let Some(invoke) = &self.invoke {
            out.push((format!("{}.done", invoke.src), invoke.on_done.as_slice()));
            out.push((format!("{}.error", invoke.src), invoke.on_error.as_slice()));
        }
        out
    }
}

/// A complete chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDefinition {
    /// Chart name, used in logs.
    pub id: String,
    /// Initial state path (resolved down to a leaf).
    pub initial: String,
    states: BTreeMap<String, StateNode>,
}

impl MachineDefinition {
    /// An empty chart starting at `initial`.
    pub fn new(id: impl Into<String>, initial: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial: initial.into(),
            states: BTreeMap::new(),
        }
    }

    /// Add a state. A later node with the same path replaces the earlier one.
    pub fn state(mut self, node: StateNode) -> Self {
        self.states.insert(node.id.clone(), node);
        self
    }

    /// Look up a state by path.
    pub fn get(&self, id: &str) -> Option<&StateNode> {
        self.states.get(id)
    }

    /// All states, ordered by path.
    pub fn states(&self) -> impl Iterator<Item = &StateNode> {
        self.states.values()
    }

    /// Whether `id` has child states.
    pub fn is_compound(&self, id: &str) -> bool {
        self.children(id).next().is_some()
    }

    /// Direct children of `id`.
    pub fn children<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a StateNode> + 'a {
        self.states
            .values()
            .filter(move |node| parent_of(&node.id) == Some(id))
    }

    /// Follow `initial` links from `id` down to a leaf.
    ///
    /// Stops early (returning the deepest state reached) if a compound state
    /// has no valid initial child; validation reports that case.
    pub fn resolve_leaf(&self, id: &str) -> String {
        let mut current = id.to_string();
        for _ in 0..self.states.len() {
            match self.get(&current).and_then(|node| node.initial.clone()) {
                Some(child) if self.states.contains_key(&child) => current = child,
                _ => break,
            }
        }
        current
    }
}

/// Parent path of a dotted state path.
pub fn parent_of(id: &str) -> Option<&str> {
    id.rfind('.').map(|at| &id[..at])
}

/// `id` and all its ancestors, outermost first.
pub fn ancestors(id: &str) -> Vec<&str> {
    let mut out: Vec<&str> = id
        .match_indices('.')
        .map(|(at, _)| &id[..at])
        .collect();
    out.push(id);
    out
}

/// Whether `state` equals `prefix` or is nested under it.
pub fn is_within(state: &str, prefix: &str) -> bool {
    state == prefix
        || (state.starts_with(prefix) && state.as_bytes().get(prefix.len()) == Some(&b'.'))
}
