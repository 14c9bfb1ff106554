//! High-level operations composing the solver, sources, cache and lock
//! file: "bring this project to a consistent state".

mod lockfile;
mod resolve;

pub use lockfile::{read_lockfile, write_lockfile};
pub use resolve::{EnsureOutcome, ensure_up_to_date};
