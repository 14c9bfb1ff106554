use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use smol_str::SmolStr;

use crate::core::package::PackageName;
use crate::core::source::Description;
use crate::resolver::term::Term;
use crate::version::VersionConstraint;

/// A set of terms that cannot all hold at once. The solver's knowledge base
/// is a growing collection of these.
#[derive(Clone)]
pub struct Incompatibility(Arc<IncompatibilityInner>);

pub struct IncompatibilityInner {
    pub terms: Vec<Term>,
    pub cause: Cause,
}

/// Why an incompatibility holds.
#[derive(Clone)]
pub enum Cause {
    /// The root package must be selected.
    Root,
    /// `terms[0]` depends on the inverse of `terms[1]`.
    Dependency,
    /// No versions exist in the term's range.
    NoVersions,
    /// The package could not be served at all.
    NotFound { error: String },
    /// The version requires an SDK we cannot satisfy.
    Sdk {
        sdk: SmolStr,
        constraint: VersionConstraint,
    },
    /// An extra constraint injected by a caller, with its stated reason.
    Custom { reason: String },
    /// Derived during conflict resolution from two prior incompatibilities.
    Conflict {
        conflict: Incompatibility,
        other: Incompatibility,
    },
}

impl Incompatibility {
    pub fn new(terms: Vec<Term>, cause: Cause) -> Self {
        let terms = coalesce(terms);
        Self(Arc::new(IncompatibilityInner { terms, cause }))
    }

    pub fn terms(&self) -> &[Term] {
        &self.0.terms
    }

    pub fn cause(&self) -> &Cause {
        &self.0.cause
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.0.cause, Cause::Conflict { .. })
    }

    /// An incompatibility that rules out every possible state is the
    /// signature of an unsolvable problem: either it has no terms, or its
    /// only term insists the root package itself cannot be selected.
    pub fn is_failure(&self) -> bool {
        let terms = self.terms();
        terms.is_empty()
            || (terms.len() == 1
                && terms[0].positive
                && terms[0].package.description.is_root())
    }

    pub fn names(&self) -> impl Iterator<Item = &PackageName> {
        self.terms().iter().map(|term| term.name()).unique()
    }
}

/// Merges terms that concern the same package and source, so every package
/// appears at most once per source.
fn coalesce(terms: Vec<Term>) -> Vec<Term> {
    if terms.len() <= 1 {
        return terms;
    }

    let mut order: Vec<(PackageName, Description)> = Vec::new();
    let mut merged: HashMap<(PackageName, Description), Term> = HashMap::new();
    for term in terms {
        let key = (term.package.name.clone(), term.package.description.clone());
        match merged.get(&key) {
            Some(existing) => {
                if let Some(intersection) = existing.intersect(&term) {
                    merged.insert(key, intersection);
                }
            }
            None => {
                order.push(key.clone());
                merged.insert(key, term);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms = self.terms();
        match &self.0.cause {
            Cause::Root => {
                write!(f, "{} is the current package", terms[0].package.name)
            }
            Cause::Dependency => {
                write!(f, "{} depends on {}", terms[0].package, terms[1].package)
            }
            Cause::NoVersions => {
                write!(f, "no versions of {} match {}", terms[0].package.name, terms[0].package.constraint)
            }
            Cause::NotFound { error } => {
                write!(f, "{} doesn't exist ({error})", terms[0].package.name)
            }
            Cause::Sdk { sdk, constraint } => {
                write!(f, "{} requires the {sdk} SDK version {constraint}", terms[0].package)
            }
            Cause::Custom { reason } => f.write_str(reason),
            Cause::Conflict { .. } => {
                if terms.is_empty() {
                    return f.write_str("version solving failed");
                }
                if terms.len() == 1 {
                    let term = &terms[0];
                    return if term.positive {
                        if term.package.description.is_root() {
                            f.write_str("version solving failed")
                        } else if term.package.constraint.is_any() {
                            write!(f, "{} is forbidden", term.package.name)
                        } else {
                            write!(f, "{} is forbidden", term.package)
                        }
                    } else {
                        write!(f, "{} is required", term.package)
                    };
                }

                let (positive, negative): (Vec<_>, Vec<_>) =
                    terms.iter().partition(|term| term.positive);
                if !positive.is_empty() && !negative.is_empty() {
                    write!(
                        f,
                        "{} requires {}",
                        positive.iter().map(|term| term.package.to_string()).join(" and "),
                        negative.iter().map(|term| term.package.to_string()).join(" or "),
                    )
                } else if !positive.is_empty() {
                    write!(
                        f,
                        "{} are incompatible",
                        positive.iter().map(|term| term.package.to_string()).join(" and "),
                    )
                } else {
                    write!(
                        f,
                        "one of {} must be selected",
                        negative.iter().map(|term| term.package.to_string()).join(" or "),
                    )
                }
            }
        }
    }
}

impl fmt::Debug for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Incompatibility({self})")
    }
}
