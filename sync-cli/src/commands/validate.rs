//! Validate the document chart.

use std::fmt::Write as _;
use std::process::ExitCode;
use sync_core::document::{definition, registry, CHART_ID};
use sync_core::hsm::{validate, MachineDefinition, ValidationError};

/// Run the validate command.
pub fn run() -> ExitCode {
    let def = definition();
    let result = validate(&def, &registry());
    print!("{}", render(&def, &result));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(errors) => {
            tracing::error!("{}: {} unresolved references", CHART_ID, errors.len());
            ExitCode::FAILURE
        }
    }
}

/// Summary line on success, one line per problem otherwise.
pub fn render(def: &MachineDefinition, result: &Result<(), Vec<ValidationError>>) -> String {
    let states = def.states().count();
    let mut out = String::new();
    match result {
        Ok(()) => {
            let _ = writeln!(out, "chart '{}': {} states, ok", CHART_ID, states);
        }
        Err(errors) => {
            let _ = writeln!(
                out,
                "chart '{}': {} states, {} problem(s)",
                CHART_ID,
                states,
                errors.len()
            );
            for error in errors {
                let _ = writeln!(out, "  - {}", error);
            }
        }
    }
    out
}
