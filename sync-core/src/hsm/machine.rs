//! The interpreter.
//!
//! A [`Machine`] owns a context value and a current leaf state. Events are
//! processed to completion one at a time: candidate selection, exit actions,
//! transition actions, entry actions, then `always` resolution. Invokes of
//! states still active afterwards are started and handed to the driver via
//! [`Machine::take_invokes`]; their results come back through
//! [`Machine::complete`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::definition::{ancestors, is_within, MachineDefinition, Transition};
use super::registry::Registry;
use super::validate::{validate, ValidationError};

/// Upper bound on consecutive `always` transitions in a single step.
pub const MAX_ALWAYS_STEPS: usize = 64;

/// Events carry a kind used to look up candidates.
pub trait Event {
    /// Event kind, matched against the chart's `on` keys.
    fn kind(&self) -> &'static str;
}

/// Generation token identifying one invoke start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvokeToken(u64);

impl InvokeToken {
    /// Raw generation number.
    pub fn generation(&self) -> u64 {
        self.0
    }
}

/// An invoke started by the machine, waiting to be driven.
pub struct StartedInvoke<E> {
    /// Token to pass back to [`Machine::complete`].
    pub token: InvokeToken,
    /// State that started the invoke.
    pub state: String,
    /// Invoke source name.
    pub src: String,
    /// The operation itself.
    pub future: BoxFuture<'static, Result<E, E>>,
}

impl<E> std::fmt::Debug for StartedInvoke<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedInvoke")
            .field("token", &self.token)
            .field("state", &self.state)
            .field("src", &self.src)
            .finish_non_exhaustive()
    }
}

/// A running state machine.
pub struct Machine<C, E> {
    definition: Arc<MachineDefinition>,
    registry: Arc<Registry<C, E>>,
    context: C,
    leaf: String,
    label: String,
    next_generation: u64,
    /// State path to the token of its running invoke.
    running: HashMap<String, InvokeToken>,
    started: Vec<StartedInvoke<E>>,
}

impl<C, E: Event> Machine<C, E> {
    /// Validate `definition` against `registry` and build a machine in the
    /// chart's initial leaf.
    ///
    /// The initial state is not "entered": no entry actions, `always`
    /// transitions or invokes run until the first event.
    pub fn new(
        definition: Arc<MachineDefinition>,
        registry: Arc<Registry<C, E>>,
        context: C,
    ) -> Result<Self, Vec<ValidationError>> {
        validate(&definition, &registry)?;
        let leaf = definition.resolve_leaf(&definition.initial);
        let label = definition.id.clone();
        Ok(Self {
            definition,
            registry,
            context,
            leaf,
            label,
            next_generation: 0,
            running: HashMap::new(),
            started: Vec::new(),
        })
    }

    /// Label used in log lines (defaults to the chart id).
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Current leaf state path.
    pub fn state_path(&self) -> &str {
        &self.leaf
    }

    /// Whether the current leaf is `state` or nested under it.
    pub fn matches(&self, state: &str) -> bool {
        is_within(&self.leaf, state)
    }

    /// Context, read-only.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Context, mutable. Used by drivers for bookkeeping outside transitions.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// The chart this machine runs.
    pub fn definition(&self) -> &MachineDefinition {
        &self.definition
    }

    /// Whether any invoke is currently awaited.
    pub fn has_running_invoke(&self) -> bool {
        !self.running.is_empty()
    }

    /// Invokes started since the last call.
    pub fn take_invokes(&mut self) -> Vec<StartedInvoke<E>> {
        std::mem::take(&mut self.started)
    }

    /// Process one event to completion.
    ///
    /// Returns whether a transition was taken. An event with no matching
    /// candidate is a no-op.
    pub fn send(&mut self, event: E) -> bool {
        let kind = event.kind();
        let leaf = self.leaf.clone();
        for state in ancestors(&leaf).into_iter().rev() {
            let selected = self
                .definition
                .get(state)
                .and_then(|node| node.on.get(kind))
                .and_then(|candidates| self.select(candidates, &event))
                .cloned();
            if let Some(transition) = selected {
                self.step(state, &transition, &event, kind);
                return true;
            }
        }
        tracing::trace!("{}: {} ignored in {}", self.label, kind, self.leaf);
        false
    }

    /// Route an invoke result back into the machine.
    ///
    /// Returns false (and does nothing) when the token is stale: the state
    /// that started the invoke was exited or re-entered since.
    pub fn complete(&mut self, token: InvokeToken, result: Result<E, E>) -> bool {
        let Some(state) = self
            .running
            .iter()
            .find(|(_, running)| **running == token)
            .map(|(state, _)| state.clone())
        else {
            tracing::debug!(
                "{}: stale invoke completion (generation {}) ignored in {}",
                self.label,
                token.0,
                self.leaf
            );
            return false;
        };
        self.running.remove(&state);

        let Some(invoke) = self.definition.get(&state).and_then(|n| n.invoke.as_ref()) else {
            return false;
        };
        let (label, candidates, event) = match &result {
            Ok(event) => ("done", &invoke.on_done, event),
            Err(event) => ("error", &invoke.on_error, event),
        };
        let kind = event.kind();
        let selected = self.select(candidates, event).cloned();
        let src = invoke.src.clone();
        match selected {
            Some(transition) => {
                self.step(&state, &transition, event, kind);
                true
            }
            None => {
                tracing::debug!(
                    "{}: {}.{} had no matching candidate in {}",
                    self.label,
                    src,
                    label,
                    self.leaf
                );
                true
            }
        }
    }

    fn select<'t>(&self, candidates: &'t [Transition], event: &E) -> Option<&'t Transition> {
        candidates.iter().find(|t| match &t.guard {
            Some(name) => self
                .registry
                .get_guard(name)
                .is_some_and(|guard| guard(&self.context, event)),
            None => true,
        })
    }

    fn step(&mut self, source: &str, transition: &Transition, event: &E, kind: &str) {
        let from = self.leaf.clone();
        let mut entered = Vec::new();
        self.take_transition(source, transition, event, &mut entered);

        let mut steps = 0;
        while let Some((state, always)) = self.find_always(event) {
            steps += 1;
            if steps > MAX_ALWAYS_STEPS {
                tracing::warn!(
                    "{}: always transitions did not settle after {} steps in {}",
                    self.label,
                    MAX_ALWAYS_STEPS,
                    self.leaf
                );
                break;
            }
            self.take_transition(&state, &always, event, &mut entered);
        }

        if from != self.leaf {
            tracing::debug!("{}: {} -> {} on {}", self.label, from, self.leaf, kind);
        }
        self.start_invokes(&entered, event);
    }

    fn find_always(&self, event: &E) -> Option<(String, Transition)> {
        for state in ancestors(&self.leaf).into_iter().rev() {
            let Some(node) = self.definition.get(state) else {
                continue;
            };
            if let Some(t) = self.select(&node.always, event) {
                return Some((state.to_string(), t.clone()));
            }
        }
        None
    }

    fn take_transition(
        &mut self,
        source: &str,
        transition: &Transition,
        event: &E,
        entered: &mut Vec<String>,
    ) {
        let Some(target) = &transition.target else {
            self.run_actions(&transition.actions, event);
            return;
        };
        if !transition.reenter && target == source {
            self.run_actions(&transition.actions, event);
            return;
        }

        let target_leaf = self.definition.resolve_leaf(target);
        let from = self.leaf.clone();
        let from_chain = ancestors(&from);
        let target_chain = ancestors(target);
        // The target itself is always exited and re-entered if active.
        let shared = from_chain
            .iter()
            .zip(target_chain.iter())
            .take_while(|(a, b)| a == b)
            .count()
            .min(target_chain.len() - 1);

        for state in from_chain[shared..].iter().rev() {
            self.exit_state(state, event);
        }
        self.run_actions(&transition.actions, event);

        let to_chain = ancestors(&target_leaf);
        for state in &to_chain[shared..] {
            self.enter_state(state, event);
            entered.push(state.to_string());
        }
        self.leaf = target_leaf;
    }

    fn exit_state(&mut self, state: &str, event: &E) {
        self.running.remove(state);
        if let Some(node) = self.definition.get(state) {
            let exit = node.exit.clone();
            self.run_actions(&exit, event);
        }
    }

    fn enter_state(&mut self, state: &str, event: &E) {
        if let Some(node) = self.definition.get(state) {
            let entry = node.entry.clone();
            self.run_actions(&entry, event);
        }
    }

    fn run_actions(&mut self, names: &[String], event: &E) {
        for name in names {
            if let Some(action) = self.registry.get_action(name) {
                action(&mut self.context, event);
            }
        }
    }

    fn start_invokes(&mut self, entered: &[String], event: &E) {
        for state in entered {
            if !is_within(&self.leaf, state) {
                continue;
            }
            let Some(invoke) = self.definition.get(state).and_then(|n| n.invoke.as_ref()) else {
                continue;
            };
            let Some(source) = self.registry.get_invoke(&invoke.src) else {
                continue;
            };
            self.next_generation += 1;
            let token = InvokeToken(self.next_generation);
            let future = source(&self.context, event);
            self.running.insert(state.clone(), token);
            tracing::trace!("{}: invoke {} started in {}", self.label, invoke.src, state);
            self.started.push(StartedInvoke {
                token,
                state: state.clone(),
                src: invoke.src.clone(),
                future,
            });
        }
    }
}

impl<C: std::fmt::Debug, E> std::fmt::Debug for Machine<C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("label", &self.label)
            .field("leaf", &self.leaf)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::{Invoke, StateNode};
    use futures_util::FutureExt;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Go,
        Bump,
        Stay,
        Done(u32),
        Failed,
    }

    impl Event for Ev {
        fn kind(&self) -> &'static str {
            match self {
                Ev::Go => "GO",
                Ev::Bump => "BUMP",
                Ev::Stay => "STAY",
                Ev::Done(_) => "done",
                Ev::Failed => "error",
            }
        }
    }

    #[derive(Debug, Default)]
    struct Ctx {
        log: Vec<String>,
        counter: u32,
    }

    fn logger(tag: &'static str) -> impl Fn(&mut Ctx, &Ev) + Send + Sync + 'static {
        move |ctx: &mut Ctx, _: &Ev| ctx.log.push(tag.to_string())
    }

    fn registry() -> Registry<Ctx, Ev> {
        Registry::new()
            .action("exitA", logger("exit a"))
            .action("exitA1", logger("exit a.one"))
            .action("enterB", logger("enter b"))
            .action("enterB1", logger("enter b.one"))
            .action("go", logger("go"))
            .action("bump", |ctx: &mut Ctx, _: &Ev| ctx.counter += 1)
            .action("store", |ctx: &mut Ctx, ev: &Ev| {
                if let Ev::Done(n) = ev {
                    ctx.counter = *n;
                }
            })
            .guard("small", |ctx: &Ctx, _: &Ev| ctx.counter < 3)
            .guard("big", |ctx: &Ctx, _: &Ev| ctx.counter >= 3)
            .invoke("work", |ctx: &Ctx, _: &Ev| {
                let n = ctx.counter + 10;
                async move { Ok::<Ev, Ev>(Ev::Done(n)) }.boxed()
            })
            .invoke("broken", |_: &Ctx, _: &Ev| async { Err::<Ev, Ev>(Ev::Failed) }.boxed())
    }

    fn chart() -> MachineDefinition {
        MachineDefinition::new("test", "a")
            .state(StateNode::new("a").initial("one").exit("exitA"))
            .state(
                StateNode::new("a.one")
                    .exit("exitA1")
                    .on("GO", Transition::to("b").action("go"))
                    .on("BUMP", Transition::internal().action("bump"))
                    .on("STAY", Transition::to("a.one").no_reenter().action("bump")),
            )
            .state(StateNode::new("b").initial("one").entry("enterB"))
            .state(
                StateNode::new("b.one")
                    .entry("enterB1")
                    .always(Transition::to("c").guard("big"))
                    .on("BUMP", Transition::to("b.one").action("bump")),
            )
            .state(
                StateNode::new("c")
                    .on("BUMP", Transition::to("c"))
                    .invoke(Invoke::new("work").on_done(Transition::to("d").action("store"))),
            )
            .state(
                StateNode::new("d")
                    .on("GO", Transition::to("e"))
                    .on("BUMP", Transition::to("c")),
            )
            .state(StateNode::new("e").invoke(
                Invoke::new("broken").on_error(Transition::to("a")),
            ))
    }

    fn machine() -> Machine<Ctx, Ev> {
        Machine::new(Arc::new(chart()), Arc::new(registry()), Ctx::default()).unwrap()
    }

    // ===========================================
    // Dispatch
    // ===========================================

    #[test]
    fn starts_in_initial_leaf_without_entry() {
        let m = machine();
        assert_eq!(m.state_path(), "a.one");
        assert!(m.matches("a"));
        assert!(m.context().log.is_empty());
    }

    #[test]
    fn exit_then_actions_then_entry() {
        let mut m = machine();
        assert!(m.send(Ev::Go));
        assert_eq!(m.state_path(), "b.one");
        assert_eq!(
            m.context().log,
            vec!["exit a.one", "exit a", "go", "enter b", "enter b.one"]
        );
    }

    #[test]
    fn unknown_event_is_noop() {
        let mut m = machine();
        m.send(Ev::Go);
        assert!(!m.send(Ev::Stay));
        assert_eq!(m.state_path(), "b.one");
    }

    #[test]
    fn internal_and_no_reenter_skip_exit_entry() {
        let mut m = machine();
        m.send(Ev::Bump);
        m.send(Ev::Stay);
        assert_eq!(m.context().counter, 2);
        assert!(m.context().log.is_empty());
    }

    #[test]
    fn self_transition_reenters_by_default() {
        let mut m = machine();
        m.send(Ev::Go);
        m.context_mut().log.clear();
        m.send(Ev::Bump);
        assert_eq!(m.context().log, vec!["enter b.one"]);
    }

    // ===========================================
    // Always + invoke
    // ===========================================

    #[test]
    fn always_runs_after_entry_and_starts_invoke() {
        let mut m = machine();
        m.context_mut().counter = 3;
        m.send(Ev::Go);
        assert_eq!(m.state_path(), "c");

        let invokes = m.take_invokes();
        assert_eq!(invokes.len(), 1);
        assert_eq!(invokes[0].src, "work");
        assert!(m.has_running_invoke());

        let StartedInvoke { token, future, .. } = invokes.into_iter().next().unwrap();
        let result = future.now_or_never().unwrap();
        assert!(m.complete(token, result));
        assert_eq!(m.state_path(), "d");
        assert_eq!(m.context().counter, 13);
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut m = machine();
        m.context_mut().counter = 3;
        m.send(Ev::Go);
        let first = m.take_invokes().remove(0);

        // Re-entering c supersedes the first invoke.
        m.send(Ev::Bump);
        assert_eq!(m.state_path(), "c");
        let second = m.take_invokes().remove(0);
        assert!(second.token > first.token);

        let stale = first.future.now_or_never().unwrap();
        assert!(!m.complete(first.token, stale));
        assert_eq!(m.state_path(), "c");

        let result = second.future.now_or_never().unwrap();
        assert!(m.complete(second.token, result));
        assert_eq!(m.state_path(), "d");
    }

    #[test]
    fn error_routes_through_on_error() {
        let mut m = machine();
        m.context_mut().counter = 3;
        m.send(Ev::Go);
        let work = m.take_invokes().remove(0);
        let result = work.future.now_or_never().unwrap();
        m.complete(work.token, result);
        m.send(Ev::Go);
        assert_eq!(m.state_path(), "e");

        let broken = m.take_invokes().remove(0);
        let result = broken.future.now_or_never().unwrap();
        assert!(result.is_err());
        assert!(m.complete(broken.token, result));
        assert_eq!(m.state_path(), "a.one");
    }

    #[test]
    fn invalid_chart_is_rejected_at_construction() {
        let def = MachineDefinition::new("bad", "x")
            .state(StateNode::new("x").on("GO", Transition::to("y").action("missing")));
        let err = Machine::new(Arc::new(def), Arc::new(registry()), Ctx::default()).unwrap_err();
        assert_eq!(err.len(), 2);
    }
}
