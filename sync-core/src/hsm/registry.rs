//! Named guards, actions and invoke sources.

use std::collections::HashMap;

use futures_util::future::BoxFuture;

/// Guard: reads context and the current event.
pub type GuardFn<C, E> = Box<dyn Fn(&C, &E) -> bool + Send + Sync>;

/// Action: mutates context.
pub type ActionFn<C, E> = Box<dyn Fn(&mut C, &E) + Send + Sync>;

/// Invoke source: snapshots what it needs from context and returns a future
/// resolving to a success or failure event.
pub type InvokeFn<C, E> = Box<dyn Fn(&C, &E) -> BoxFuture<'static, Result<E, E>> + Send + Sync>;

/// Lookup table from names used in a chart to implementations.
pub struct Registry<C, E> {
    guards: HashMap<String, GuardFn<C, E>>,
    actions: HashMap<String, ActionFn<C, E>>,
    invokes: HashMap<String, InvokeFn<C, E>>,
}

impl<C, E> Registry<C, E> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            guards: HashMap::new(),
            actions: HashMap::new(),
            invokes: HashMap::new(),
        }
    }

    /// Register a guard.
    pub fn guard<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&C, &E) -> bool + Send + Sync + 'static,
    {
        self.guards.insert(name.to_string(), Box::new(f));
        self
    }

    /// Register an action.
    pub fn action<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut C, &E) + Send + Sync + 'static,
    {
        self.actions.insert(name.to_string(), Box::new(f));
        self
    }

    /// Register an invoke source.
    pub fn invoke<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&C, &E) -> BoxFuture<'static, Result<E, E>> + Send + Sync + 'static,
    {
        self.invokes.insert(name.to_string(), Box::new(f));
        self
    }

    /// Look up a guard.
    pub fn get_guard(&self, name: &str) -> Option<&GuardFn<C, E>> {
        self.guards.get(name)
    }

    /// Look up an action.
    pub fn get_action(&self, name: &str) -> Option<&ActionFn<C, E>> {
        self.actions.get(name)
    }

    /// Look up an invoke source.
    pub fn get_invoke(&self, name: &str) -> Option<&InvokeFn<C, E>> {
        self.invokes.get(name)
    }

    /// Whether a guard named `name` exists.
    pub fn has_guard(&self, name: &str) -> bool {
        self.guards.contains_key(name)
    }

    /// Whether an action named `name` exists.
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Whether an invoke source named `name` exists.
    pub fn has_invoke(&self, name: &str) -> bool {
        self.invokes.contains_key(name)
    }
}

impl<C, E> Default for Registry<C, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, E> std::fmt::Debug for Registry<C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("guards", &self.guards.len())
            .field("actions", &self.actions.len())
            .field("invokes", &self.invokes.len())
            .finish()
    }
}
