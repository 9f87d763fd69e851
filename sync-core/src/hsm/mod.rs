//! Hierarchical state machine interpreter.
//!
//! Charts are declared as data ([`MachineDefinition`]) and bound to code
//! through a [`Registry`] of named guards, actions and invoke sources.
//! [`validate`] checks every name up front and reports all failures at once;
//! [`Machine::new`] refuses to build a machine from an invalid chart.
//!
//! The interpreter is synchronous. Invokes are returned to the caller as
//! boxed futures tagged with an [`InvokeToken`]; a completion whose token no
//! longer matches a running invoke is dropped.

mod definition;
mod machine;
mod registry;
mod validate;

pub use definition::{ancestors, is_within, parent_of, Invoke, MachineDefinition, StateNode, Transition};
pub use machine::{Event, InvokeToken, Machine, StartedInvoke, MAX_ALWAYS_STEPS};
pub use registry::{ActionFn, GuardFn, InvokeFn, Registry};
pub use validate::{validate, ValidationError};
