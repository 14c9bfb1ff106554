use std::fmt;

use crate::resolver::incompatibility::{Cause, Incompatibility};

/// Returned when version solving fails. Holds the final root
/// incompatibility, whose derivation graph reaches every conflict that
/// contributed; displaying the failure renders the blame chain.
#[derive(Debug)]
pub struct SolveFailure {
    pub incompatibility: Incompatibility,
}

impl SolveFailure {
    pub fn new(incompatibility: Incompatibility) -> Self {
        Self { incompatibility }
    }
}

impl std::error::Error for SolveFailure {}

impl fmt::Display for SolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_derivation(f, &self.incompatibility, true)
    }
}

/// Writes the chain of reasoning that led to `incompatibility`: external
/// causes are stated, derived ones are expanded first.
fn write_derivation(
    f: &mut fmt::Formatter<'_>,
    incompatibility: &Incompatibility,
    root: bool,
) -> fmt::Result {
    let consequence = if root {
        "version solving failed".to_string()
    } else {
        incompatibility.to_string()
    };

    match incompatibility.cause() {
        Cause::Conflict { conflict, other } => {
            match (conflict.is_derived(), other.is_derived()) {
                (false, false) => {
                    writeln!(f, "Because {conflict} and {other}, {consequence}.")
                }
                (true, false) => {
                    write_derivation(f, conflict, false)?;
                    writeln!(f, "And because {other}, {consequence}.")
                }
                (false, true) => {
                    write_derivation(f, other, false)?;
                    writeln!(f, "And because {conflict}, {consequence}.")
                }
                (true, true) => {
                    write_derivation(f, conflict, false)?;
                    write_derivation(f, other, false)?;
                    writeln!(f, "So, {consequence}.")
                }
            }
        }
        _ => writeln!(f, "Because {incompatibility}, {consequence}."),
    }
}
