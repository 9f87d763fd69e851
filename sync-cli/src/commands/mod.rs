//! CLI command implementations.

pub mod merge;
pub mod status;
pub mod validate;
