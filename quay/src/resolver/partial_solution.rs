use std::collections::HashMap;

use crate::core::package::{PackageId, PackageName, PackageRange};
use crate::core::source::Description;
use crate::resolver::incompatibility::Incompatibility;
use crate::resolver::term::{SetRelation, Term};

/// One entry in the partial solution: either a decision (a concrete version
/// was selected) or a derivation forced by an incompatibility.
pub struct Assignment {
    pub term: Term,
    pub decision_level: usize,
    pub index: usize,
    kind: AssignmentKind,
}

enum AssignmentKind {
    Decision(PackageId),
    Derivation(Incompatibility),
}

impl Assignment {
    pub fn is_decision(&self) -> bool {
        matches!(self.kind, AssignmentKind::Decision(_))
    }

    /// The incompatibility that forced this derivation; `None` for
    /// decisions.
    pub fn cause(&self) -> Option<&Incompatibility> {
        match &self.kind {
            AssignmentKind::Derivation(cause) => Some(cause),
            AssignmentKind::Decision(_) => None,
        }
    }
}

/// The ordered list of assignments the solver has made so far, with
/// per-package indexes of what they amount to.
pub struct PartialSolution {
    assignments: Vec<Assignment>,
    decisions: HashMap<PackageName, PackageId>,
    /// The cumulative positive requirement per package, when any.
    positive: HashMap<PackageName, Term>,
    /// Cumulative negative requirements, keyed by package and source.
    negative: HashMap<PackageName, HashMap<Description, Term>>,
    attempted_solutions: u64,
    backtracking: bool,
}

impl PartialSolution {
    pub fn new() -> Self {
        Self {
            assignments: Vec::new(),
            decisions: HashMap::new(),
            positive: HashMap::new(),
            negative: HashMap::new(),
            attempted_solutions: 1,
            backtracking: false,
        }
    }

    /// The number of distinct solutions that have been attempted so far.
    pub fn attempted_solutions(&self) -> u64 {
        self.attempted_solutions
    }

    pub fn decision_level(&self) -> usize {
        self.decisions.len()
    }

    pub fn decisions(&self) -> impl Iterator<Item = &PackageId> {
        self.decisions.values()
    }

    pub fn decision(&self, name: &PackageName) -> Option<&PackageId> {
        self.decisions.get(name)
    }

    pub fn assignment(&self, index: usize) -> &Assignment {
        &self.assignments[index]
    }

    /// Positive requirements that do not have a decision yet: the packages
    /// still waiting for a version pick.
    pub fn unsatisfied(&self) -> Vec<PackageRange> {
        self.positive
            .iter()
            .filter(|(name, _)| !self.decisions.contains_key(*name))
            .map(|(_, term)| term.package.clone())
            .collect()
    }

    pub fn decide(&mut self, package: PackageId) {
        // A backtrack followed by a decision means we are off exploring a
        // new potential solution.
        if self.backtracking {
            self.attempted_solutions += 1;
            self.backtracking = false;
        }
        self.decisions.insert(package.name.clone(), package.clone());
        self.assign(Assignment {
            term: Term::positive(package.as_range()),
            decision_level: self.decisions.len(),
            index: self.assignments.len(),
            kind: AssignmentKind::Decision(package),
        });
    }

    pub fn derive(&mut self, package: PackageRange, positive: bool, cause: Incompatibility) {
        self.assign(Assignment {
            term: Term { package, positive },
            decision_level: self.decision_level(),
            index: self.assignments.len(),
            kind: AssignmentKind::Derivation(cause),
        });
    }

    fn assign(&mut self, assignment: Assignment) {
        self.register(&assignment);
        self.assignments.push(assignment);
    }

    /// Folds the assignment into the per-package indexes.
    fn register(&mut self, assignment: &Assignment) {
        let name = assignment.term.name().clone();
        if let Some(old) = self.positive.get(&name) {
            let combined = old
                .intersect(&assignment.term)
                .expect("a consistent solution cannot assign an empty term");
            self.positive.insert(name, combined);
            return;
        }

        if assignment.term.positive {
            // Fold any accumulated negatives into the new positive; a
            // negative about another source is subsumed by it.
            let negatives = self.negative.remove(&name);
            let mut term = assignment.term.clone();
            if let Some(by_source) = negatives {
                for negative in by_source.values() {
                    term = term
                        .intersect(negative)
                        .expect("a consistent solution cannot assign an empty term");
                }
            }
            self.positive.insert(name, term);
        } else {
            let description = assignment.term.package.description.clone();
            let by_source = self.negative.entry(name).or_default();
            let term = match by_source.get(&description) {
                Some(existing) => existing
                    .intersect(&assignment.term)
                    .expect("a consistent solution cannot assign an empty term"),
                None => assignment.term.clone(),
            };
            by_source.insert(description, term);
        }
    }

    /// How the partial solution as a whole relates to the given term.
    pub fn relation(&self, term: &Term) -> SetRelation {
        if let Some(positive) = self.positive.get(term.name()) {
            return positive.relation(term);
        }
        let Some(by_source) = self.negative.get(term.name()) else {
            return SetRelation::Overlapping;
        };
        let Some(negative) = by_source.get(&term.package.description) else {
            return SetRelation::Overlapping;
        };
        negative.relation(term)
    }

    pub fn satisfies(&self, term: &Term) -> bool {
        self.relation(term) == SetRelation::Subset
    }

    /// The index of the earliest assignment from which the accumulated
    /// assignments satisfy `term`.
    pub fn satisfier_index(&self, term: &Term) -> usize {
        let mut assigned: Option<Term> = None;
        for assignment in &self.assignments {
            if assignment.term.name() != term.name() {
                continue;
            }
            let same_package = assignment.term.package.description.is_root()
                || assignment.term.package.description == term.package.description;
            if !same_package {
                if !assignment.term.positive {
                    continue;
                }
                // A positive pick from another source satisfies any
                // negative term about this one.
                debug_assert!(!term.positive);
                return assignment.index;
            }
            let combined = match assigned {
                None => assignment.term.clone(),
                Some(previous) => previous
                    .intersect(&assignment.term)
                    .expect("a consistent solution cannot assign an empty term"),
            };
            if combined.satisfies(term) {
                return assignment.index;
            }
            assigned = Some(combined);
        }
        unreachable!("{term} is not satisfied by the partial solution")
    }

    /// Removes every assignment made after `decision_level` and rebuilds
    /// the indexes.
    pub fn backtrack(&mut self, decision_level: usize) {
        self.backtracking = true;
        self.assignments
            .retain(|assignment| assignment.decision_level <= decision_level);

        self.decisions.clear();
        self.positive.clear();
        self.negative.clear();
        let assignments = std::mem::take(&mut self.assignments);
        for (index, mut assignment) in assignments.into_iter().enumerate() {
            assignment.index = index;
            if let AssignmentKind::Decision(package) = &assignment.kind {
                self.decisions
                    .insert(package.name.clone(), package.clone());
            }
            self.assign(assignment);
        }
    }
}
