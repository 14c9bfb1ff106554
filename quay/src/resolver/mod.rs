//! Conflict-driven version solving.
//!
//! The solver keeps a partial solution (an ordered list of decisions and
//! derivations) and a growing set of incompatibilities. Unit propagation
//! derives consequences until a decision is needed; conflicts are resolved
//! by deriving a new, more general incompatibility and backjumping.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use camino::Utf8Path;
use itertools::Itertools;
use semver::Version;
use smol_str::SmolStr;
use tracing::trace;

use crate::core::errors::DataError;
use crate::core::lockfile::LockFile;
use crate::core::manifest::Pubspec;
use crate::core::package::{PackageId, PackageName, PackageRange, PackageRef};
use crate::core::registry::Registry;

mod failure;
mod incompatibility;
mod partial_solution;
mod term;

pub use failure::SolveFailure;
pub use incompatibility::{Cause, Incompatibility};
pub use term::{SetRelation, Term};

use partial_solution::PartialSolution;

/// What kind of resolution was asked for; decides how the previous lock
/// file is interpreted and which end of a range to prefer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SolveType {
    /// Prefer locked versions; pick the newest allowed otherwise.
    Get,
    /// Ignore the lock (except for packages outside the unlock set when one
    /// is given) and pick the newest allowed versions.
    Upgrade,
    /// Like [`SolveType::Upgrade`], but pick the oldest allowed versions.
    Downgrade,
}

/// An extra constraint injected by a caller, with a human-readable reason
/// used when explaining failures. The range names versions that must *not*
/// be selected.
#[derive(Clone, Debug)]
pub struct ConstraintAndCause {
    pub forbidden: PackageRange,
    pub cause: String,
}

/// A successful resolution.
#[derive(Debug)]
pub struct SolveResult {
    /// The selected packages, excluding the root, ordered by name.
    pub packages: Vec<PackageId>,
    /// The manifest of every selected package, the root included.
    pub pubspecs: HashMap<PackageId, Pubspec>,
    /// The versions that were available per package. Truncated to the
    /// locked version for packages that stayed locked throughout.
    pub available_versions: HashMap<PackageName, Vec<Version>>,
    /// How many solutions were attempted before this one was found.
    pub attempted_solutions: u64,
    pub duration: Duration,
}

impl SolveResult {
    /// The lock file pinning this resolution.
    pub fn lock_file(&self, root: &Pubspec) -> LockFile {
        LockFile::from_resolution(
            root,
            self.packages.iter().map(|id| {
                (
                    id,
                    self.pubspecs
                        .get(id)
                        .expect("every selected package has a pubspec"),
                )
            }),
        )
    }
}

/// Resolves the root package's dependencies to concrete versions.
///
/// On an unsatisfiable input the returned error downcasts to
/// [`SolveFailure`], whose rendering explains the conflict.
#[allow(clippy::too_many_arguments)]
pub async fn resolve(
    ty: SolveType,
    registry: &dyn Registry,
    root: &Pubspec,
    root_dir: &Utf8Path,
    lock: &LockFile,
    unlock: &[PackageName],
    extra_constraints: &[ConstraintAndCause],
    sdk_versions: &BTreeMap<SmolStr, Version>,
) -> Result<SolveResult> {
    let started = std::time::Instant::now();

    let root_id = root.root_id(root_dir);
    let mut solver = VersionSolver {
        ty,
        registry,
        root,
        root_id: root_id.clone(),
        lock,
        unlock: unlock.iter().cloned().collect(),
        sdk_versions,
        incompatibilities: HashMap::new(),
        solution: PartialSolution::new(),
        pubspecs: HashMap::new(),
        available_versions: HashMap::new(),
        listings: HashMap::new(),
    };

    for constraint in extra_constraints {
        solver.add_incompatibility(Incompatibility::new(
            vec![Term::positive(constraint.forbidden.clone())],
            Cause::Custom {
                reason: constraint.cause.clone(),
            },
        ));
    }
    solver.add_incompatibility(Incompatibility::new(
        vec![Term::negative(root_id.as_range())],
        Cause::Root,
    ));

    let mut next = Some(root_id.name.clone());
    while let Some(package) = next {
        solver.propagate(package)?;
        next = solver.choose_package_version().await?;
    }

    let packages: Vec<PackageId> = solver
        .solution
        .decisions()
        .filter(|id| !id.is_root())
        .sorted_by(|a, b| a.name.cmp(&b.name))
        .cloned()
        .collect();

    trace!(
        packages = packages.len(),
        attempted = solver.solution.attempted_solutions(),
        "version solving succeeded",
    );

    Ok(SolveResult {
        packages,
        pubspecs: solver.pubspecs,
        available_versions: solver.available_versions,
        attempted_solutions: solver.solution.attempted_solutions(),
        duration: started.elapsed(),
    })
}

enum Propagation {
    /// The incompatibility is fully satisfied; a conflict.
    Conflict,
    /// All terms but one are satisfied; the remainder's inverse was
    /// derived for the named package.
    AlmostSatisfied(PackageName),
    None,
}

enum Candidates {
    Found(Vec<PackageId>),
    NotFound(String),
}

struct VersionSolver<'a> {
    ty: SolveType,
    registry: &'a dyn Registry,
    root: &'a Pubspec,
    root_id: PackageId,
    lock: &'a LockFile,
    unlock: HashSet<PackageName>,
    sdk_versions: &'a BTreeMap<SmolStr, Version>,
    incompatibilities: HashMap<PackageName, Vec<Incompatibility>>,
    solution: PartialSolution,
    pubspecs: HashMap<PackageId, Pubspec>,
    available_versions: HashMap<PackageName, Vec<Version>>,
    listings: HashMap<PackageRef, Vec<PackageId>>,
}

impl<'a> VersionSolver<'a> {
    fn add_incompatibility(&mut self, incompatibility: Incompatibility) {
        trace!("fact: {incompatibility}");
        for name in incompatibility.names().cloned().collect::<Vec<_>>() {
            self.incompatibilities
                .entry(name)
                .or_default()
                .push(incompatibility.clone());
        }
    }

    /// Derives everything that follows from the partial solution for
    /// `package` and any packages affected in turn, resolving conflicts as
    /// they surface.
    fn propagate(&mut self, package: PackageName) -> Result<(), SolveFailure> {
        let mut changed = vec![package];
        while let Some(package) = changed.pop() {
            let incompatibilities = self
                .incompatibilities
                .get(&package)
                .cloned()
                .unwrap_or_default();
            // Most recently added incompatibilities tend to be the most
            // specific; visiting them first finds conflicts sooner.
            for incompatibility in incompatibilities.iter().rev() {
                match self.propagate_incompatibility(incompatibility) {
                    Propagation::Conflict => {
                        let root_cause = self.resolve_conflict(incompatibility.clone())?;
                        changed.clear();
                        if let Propagation::AlmostSatisfied(name) =
                            self.propagate_incompatibility(&root_cause)
                        {
                            changed.push(name);
                        }
                        break;
                    }
                    Propagation::AlmostSatisfied(name) => changed.push(name),
                    Propagation::None => {}
                }
            }
        }
        Ok(())
    }

    fn propagate_incompatibility(&mut self, incompatibility: &Incompatibility) -> Propagation {
        let mut unsatisfied: Option<&Term> = None;
        for term in incompatibility.terms() {
            match self.solution.relation(term) {
                SetRelation::Disjoint => return Propagation::None,
                SetRelation::Overlapping => {
                    if unsatisfied.is_some() {
                        return Propagation::None;
                    }
                    unsatisfied = Some(term);
                }
                SetRelation::Subset => {}
            }
        }

        match unsatisfied {
            None => Propagation::Conflict,
            Some(term) => {
                trace!("derived: {}", term.inverse());
                let name = term.name().clone();
                self.solution
                    .derive(term.package.clone(), !term.positive, incompatibility.clone());
                Propagation::AlmostSatisfied(name)
            }
        }
    }

    /// Works backwards from a satisfied incompatibility to the root cause
    /// of the conflict, backjumps past the offending decision, and returns
    /// the (possibly new) incompatibility that unit propagation should
    /// continue from.
    fn resolve_conflict(
        &mut self,
        mut incompatibility: Incompatibility,
    ) -> Result<Incompatibility, SolveFailure> {
        let mut new_incompatibility = false;
        while !incompatibility.is_failure() {
            let mut most_recent_term: Option<Term> = None;
            let mut most_recent_satisfier: Option<usize> = None;
            let mut difference: Option<Term> = None;
            let mut previous_satisfier_level = 1usize;

            for term in incompatibility.terms() {
                let satisfier_index = self.solution.satisfier_index(term);
                match most_recent_satisfier {
                    None => {
                        most_recent_term = Some(term.clone());
                        most_recent_satisfier = Some(satisfier_index);
                    }
                    Some(previous) if previous < satisfier_index => {
                        previous_satisfier_level = previous_satisfier_level
                            .max(self.solution.assignment(previous).decision_level);
                        most_recent_term = Some(term.clone());
                        most_recent_satisfier = Some(satisfier_index);
                        difference = None;
                    }
                    Some(_) => {
                        previous_satisfier_level = previous_satisfier_level
                            .max(self.solution.assignment(satisfier_index).decision_level);
                    }
                }

                if most_recent_term.as_ref() == Some(term) {
                    // When the satisfier alone does not cover the term,
                    // earlier assignments contributed; account for them.
                    let satisfier = self
                        .solution
                        .assignment(most_recent_satisfier.expect("satisfier was just set"));
                    difference = satisfier.term.difference(term);
                    if let Some(difference) = &difference {
                        let index = self.solution.satisfier_index(&difference.inverse());
                        previous_satisfier_level = previous_satisfier_level
                            .max(self.solution.assignment(index).decision_level);
                    }
                }
            }

            let satisfier_index =
                most_recent_satisfier.expect("a conflicting incompatibility has terms");
            let satisfier = self.solution.assignment(satisfier_index);

            if satisfier.is_decision() || previous_satisfier_level < satisfier.decision_level {
                trace!(
                    level = previous_satisfier_level,
                    "conflict: {incompatibility}; backjumping",
                );
                self.solution.backtrack(previous_satisfier_level);
                if new_incompatibility {
                    self.add_incompatibility(incompatibility.clone());
                }
                return Ok(incompatibility);
            }

            let cause = satisfier
                .cause()
                .expect("non-decision assignments carry a cause")
                .clone();
            let satisfier_package = satisfier.term.package.clone();
            let most_recent = most_recent_term.expect("a conflicting incompatibility has terms");

            let mut new_terms: Vec<Term> = incompatibility
                .terms()
                .iter()
                .filter(|term| **term != most_recent)
                .cloned()
                .collect();
            new_terms.extend(
                cause
                    .terms()
                    .iter()
                    .filter(|term| term.package != satisfier_package)
                    .cloned(),
            );
            if let Some(difference) = &difference {
                new_terms.push(difference.inverse());
            }

            incompatibility = Incompatibility::new(
                new_terms,
                Cause::Conflict {
                    conflict: incompatibility.clone(),
                    other: cause,
                },
            );
            new_incompatibility = true;
        }
        Err(SolveFailure::new(incompatibility))
    }

    /// Picks the next package to decide and tries to select a version for
    /// it. Returns the package name to continue propagation from, or `None`
    /// when the solution is complete.
    async fn choose_package_version(&mut self) -> Result<Option<PackageName>> {
        let unsatisfied = self.solution.unsatisfied();
        if unsatisfied.is_empty() {
            return Ok(None);
        }

        // Prefer the package with the fewest candidate versions: packages
        // with a single candidate first, alphabetical order as tie-break.
        // Conflicts involving tight packages are found with the least
        // backtracking.
        let mut chosen: Option<(usize, PackageRange, Candidates)> = None;
        for package in unsatisfied {
            let candidates = self.candidates(&package).await?;
            let count = match &candidates {
                Candidates::Found(versions) => versions.len(),
                Candidates::NotFound(_) => 0,
            };
            let better = match &chosen {
                None => true,
                Some((best_count, best_package, _)) => {
                    (count, &package.name) < (*best_count, &best_package.name)
                }
            };
            if better {
                chosen = Some((count, package, candidates));
            }
        }
        let (_, package, candidates) = chosen.expect("unsatisfied set is not empty");

        let versions = match candidates {
            Candidates::NotFound(error) => {
                self.add_incompatibility(Incompatibility::new(
                    vec![Term::positive(package.clone())],
                    Cause::NotFound { error },
                ));
                return Ok(Some(package.name.clone()));
            }
            Candidates::Found(versions) if versions.is_empty() => {
                self.add_incompatibility(Incompatibility::new(
                    vec![Term::positive(package.clone())],
                    Cause::NoVersions,
                ));
                return Ok(Some(package.name.clone()));
            }
            Candidates::Found(versions) => versions,
        };

        let version = self.best_candidate(&versions);
        let pubspec = self.describe(&version).await?;
        self.pubspecs.insert(version.clone(), pubspec.clone());

        // An unsatisfiable SDK constraint rules the version out before its
        // dependencies are even considered.
        for (sdk, constraint) in &pubspec.environment {
            let satisfied = self
                .sdk_versions
                .get(sdk)
                .is_some_and(|installed| constraint.allows(installed));
            if !satisfied {
                self.add_incompatibility(Incompatibility::new(
                    vec![Term::positive(version.as_range())],
                    Cause::Sdk {
                        sdk: sdk.clone(),
                        constraint: constraint.clone(),
                    },
                ));
                return Ok(Some(package.name.clone()));
            }
        }

        let dependencies = self.dependencies_of(&version, &pubspec);
        let mut conflict = false;
        for dependency in dependencies {
            if dependency.name == version.name {
                continue;
            }
            let incompatibility = Incompatibility::new(
                vec![
                    Term::positive(version.as_range()),
                    Term::negative(dependency),
                ],
                Cause::Dependency,
            );
            // Selecting this version would immediately conflict if the
            // incompatibility is already satisfied up to the version
            // itself.
            conflict = conflict
                || incompatibility
                    .terms()
                    .iter()
                    .all(|term| term.name() == &version.name || self.solution.satisfies(term));
            self.add_incompatibility(incompatibility);
        }

        if !conflict {
            trace!("selected {version}");
            self.solution.decide(version);
        }
        Ok(Some(package.name.clone()))
    }

    /// The dependency requests of a selected version, with the root's
    /// overrides substituted in.
    fn dependencies_of(&self, version: &PackageId, pubspec: &Pubspec) -> Vec<PackageRange> {
        if version.is_root() {
            return self.root.root_dependencies();
        }
        let mut dependencies = pubspec.propagated_dependencies();
        for dependency in dependencies.iter_mut() {
            if let Some(overridden) = self.root.dependency_overrides.get(&dependency.name) {
                *dependency = overridden.clone();
            }
        }
        dependencies
    }

    async fn describe(&self, id: &PackageId) -> Result<Pubspec> {
        if id.is_root() {
            return Ok(self.root.clone());
        }
        self.registry.describe(id).await
    }

    /// The versions matching a request, cheapest sources first: the locked
    /// version short-circuits the full listing as long as it stays
    /// acceptable.
    async fn candidates(&mut self, package: &PackageRange) -> Result<Candidates> {
        if package.description.is_root() {
            let matches = package.constraint.allows(&self.root_id.version);
            return Ok(Candidates::Found(if matches {
                vec![self.root_id.clone()]
            } else {
                Vec::new()
            }));
        }

        let locked = self.locked_version(&package.name).cloned();
        if let Some(locked) = locked {
            if package.allows_id(&locked) {
                self.available_versions
                    .entry(package.name.clone())
                    .or_insert_with(|| vec![locked.version.clone()]);
                return Ok(Candidates::Found(vec![locked]));
            }
        }

        let listed = if let Some(listed) = self.listings.get(&package.to_ref()) {
            listed.clone()
        } else {
            match self.registry.list_versions(&package.to_ref()).await {
                Ok(mut listed) => {
                    listed.sort_by(|a, b| a.version.cmp(&b.version));
                    self.available_versions.insert(
                        package.name.clone(),
                        listed.iter().map(|id| id.version.clone()).collect(),
                    );
                    self.listings.insert(package.to_ref(), listed.clone());
                    listed
                }
                Err(err) if err.is::<DataError>() => {
                    return Ok(Candidates::NotFound(err.to_string()));
                }
                Err(err) => return Err(err),
            }
        };

        Ok(Candidates::Found(
            listed
                .into_iter()
                .filter(|id| package.constraint.allows(&id.version))
                .collect(),
        ))
    }

    fn best_candidate(&self, versions: &[PackageId]) -> PackageId {
        let best = match self.ty {
            SolveType::Downgrade => versions.iter().min_by_key(|id| id.version.clone()),
            SolveType::Get | SolveType::Upgrade => {
                versions.iter().max_by_key(|id| id.version.clone())
            }
        };
        best.expect("candidate list is not empty").clone()
    }

    /// The lock file entry to prefer for a package, honoring the solve type
    /// and the unlock set.
    fn locked_version(&self, name: &PackageName) -> Option<&PackageId> {
        match self.ty {
            SolveType::Get => {
                if self.unlock.contains(name) {
                    None
                } else {
                    self.lock.locked(name)
                }
            }
            SolveType::Upgrade | SolveType::Downgrade => {
                if self.unlock.is_empty() || self.unlock.contains(name) {
                    None
                } else {
                    self.lock.locked(name)
                }
            }
        }
    }
}
