use std::fmt;

use crate::core::package::{PackageName, PackageRange};

/// A signed statement about a package: a positive term asserts the selected
/// version must lie in the range, a negative one that it must not.
#[derive(Clone, PartialEq, Eq)]
pub struct Term {
    pub package: PackageRange,
    pub positive: bool,
}

/// How the set of versions allowed by one term relates to another's.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SetRelation {
    /// Every version allowed by this term is allowed by the other.
    Subset,
    /// No version allowed by this term is allowed by the other.
    Disjoint,
    /// Some versions are shared, some are not.
    Overlapping,
}

impl Term {
    pub fn positive(package: PackageRange) -> Self {
        Self {
            package,
            positive: true,
        }
    }

    pub fn negative(package: PackageRange) -> Self {
        Self {
            package,
            positive: false,
        }
    }

    pub fn name(&self) -> &PackageName {
        &self.package.name
    }

    pub fn inverse(&self) -> Term {
        Term {
            package: self.package.clone(),
            positive: !self.positive,
        }
    }

    /// Terms talk about the same package only when their descriptions
    /// agree; a hosted `foo` and a git `foo` are unrelated packages that
    /// merely share a name.
    fn compatible_package(&self, other: &Term) -> bool {
        self.package.description == other.package.description
    }

    /// The relationship between the states allowed by `self` and by
    /// `other`, which must concern the same package name.
    pub fn relation(&self, other: &Term) -> SetRelation {
        debug_assert_eq!(self.name(), other.name());
        let own = &self.package.constraint;
        let theirs = &other.package.constraint;

        if other.positive {
            if self.positive {
                if !self.compatible_package(other) {
                    return SetRelation::Disjoint;
                }
                if theirs.allows_all(own) {
                    return SetRelation::Subset;
                }
                if !own.allows_any(theirs) {
                    return SetRelation::Disjoint;
                }
                SetRelation::Overlapping
            } else {
                if !self.compatible_package(other) {
                    return SetRelation::Overlapping;
                }
                if own.allows_all(theirs) {
                    return SetRelation::Disjoint;
                }
                SetRelation::Overlapping
            }
        } else if self.positive {
            if !self.compatible_package(other) {
                return SetRelation::Subset;
            }
            if !theirs.allows_any(own) {
                return SetRelation::Subset;
            }
            if theirs.allows_all(own) {
                return SetRelation::Disjoint;
            }
            SetRelation::Overlapping
        } else {
            if !self.compatible_package(other) {
                return SetRelation::Overlapping;
            }
            if own.allows_all(theirs) {
                return SetRelation::Subset;
            }
            SetRelation::Overlapping
        }
    }

    /// Whether every state allowed by `self` is allowed by `other`.
    pub fn satisfies(&self, other: &Term) -> bool {
        self.name() == other.name() && self.relation(other) == SetRelation::Subset
    }

    /// The intersection of the states allowed by both terms, or `None` when
    /// it cannot be expressed as a single term.
    pub fn intersect(&self, other: &Term) -> Option<Term> {
        debug_assert_eq!(self.name(), other.name());
        if self.compatible_package(other) {
            if self.positive != other.positive {
                let (positive, negative) = if self.positive {
                    (self, other)
                } else {
                    (other, self)
                };
                let constraint = positive
                    .package
                    .constraint
                    .difference(&negative.package.constraint);
                non_empty(positive.package.with_constraint(constraint), true)
            } else if self.positive {
                let constraint = self
                    .package
                    .constraint
                    .intersect(&other.package.constraint);
                non_empty(self.package.with_constraint(constraint), true)
            } else {
                let constraint = self.package.constraint.union(&other.package.constraint);
                non_empty(self.package.with_constraint(constraint), false)
            }
        } else if self.positive != other.positive {
            // A positive term for one source excludes every other source,
            // so it subsumes the negative term.
            Some(if self.positive {
                self.clone()
            } else {
                other.clone()
            })
        } else {
            None
        }
    }

    /// The states allowed by `self` but not by `other`.
    pub fn difference(&self, other: &Term) -> Option<Term> {
        self.intersect(&other.inverse())
    }
}

fn non_empty(package: PackageRange, positive: bool) -> Option<Term> {
    if package.constraint.is_empty() {
        None
    } else {
        Some(Term { package, positive })
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.positive {
            f.write_str("not ")?;
        }
        write!(f, "{}", self.package)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({self})")
    }
}
