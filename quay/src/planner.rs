//! The dependency-services planner: classifies possible upgrades by
//! re-running the solver under perturbed inputs and reporting what changed
//! against the lock file.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use camino::Utf8Path;
use semver::Version;
use smol_str::SmolStr;

use crate::core::lockfile::LockFile;
use crate::core::manifest::Pubspec;
use crate::core::package::{DependencyKind, PackageId, PackageName, PackageRange};
use crate::core::registry::Registry;
use crate::core::source::SourceKind;
use crate::resolver::{ConstraintAndCause, SolveResult, SolveType, resolve};
use crate::version::{VersionConstraint, VersionExt, VersionRange};

/// The ways an upgrade can be planned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpgradeType {
    /// Newest versions that satisfy the manifest as written.
    Compatible,
    /// One dependency may break its constraint's upper bound.
    SingleBreaking,
    /// Every direct dependency may break its upper bound.
    MultiBreaking,
    /// The smallest upgrade that escapes a disallowed version.
    SmallestUpdate,
}

/// One package's change in a computed plan. `version: None` records a
/// package that the new resolution removed.
#[derive(Clone, Debug)]
pub struct PackageUpdate {
    pub name: PackageName,
    pub version: Option<Version>,
    pub kind: DependencyKind,
    pub source: Option<SourceKind>,
    /// The constraint to write when the user accepts the new version:
    /// `compatible_with` of the target for breaking upgrades.
    pub constraint_bumped: Option<VersionConstraint>,
    /// The original constraint widened just enough to admit the target.
    pub constraint_widened: Option<VersionConstraint>,
    /// The original constraint when it already admits the target, the
    /// bumped form otherwise.
    pub constraint_bumped_if_needed: Option<VersionConstraint>,
    pub previous_version: Option<Version>,
    pub previous_constraint: Option<VersionConstraint>,
    pub previous_source: Option<SourceKind>,
}

/// Computes upgrade plans for one root package against its lock file.
pub struct DependencyServices<'a> {
    registry: &'a dyn Registry,
    root: &'a Pubspec,
    root_dir: &'a Utf8Path,
    lock: &'a LockFile,
    sdk_versions: &'a BTreeMap<SmolStr, Version>,
}

impl<'a> DependencyServices<'a> {
    pub fn new(
        registry: &'a dyn Registry,
        root: &'a Pubspec,
        root_dir: &'a Utf8Path,
        lock: &'a LockFile,
        sdk_versions: &'a BTreeMap<SmolStr, Version>,
    ) -> Self {
        Self {
            registry,
            root,
            root_dir,
            lock,
            sdk_versions,
        }
    }

    /// Upgrades reachable without touching any constraint.
    pub async fn compatible(&self) -> Result<Vec<PackageUpdate>> {
        let result = resolve(
            SolveType::Upgrade,
            self.registry,
            self.root,
            self.root_dir,
            self.lock,
            &[],
            &[],
            self.sdk_versions,
        )
        .await
        .context("failed to compute the compatible upgrade plan")?;
        Ok(self.diff(UpgradeType::Compatible, &result))
    }

    /// Upgrades reachable when `package`'s upper bound is dropped; every
    /// other package prefers its locked version.
    pub async fn single_breaking(&self, package: &PackageName) -> Result<Vec<PackageUpdate>> {
        let relaxed = self.with_relaxed_constraints(|name, range| {
            (name == package).then(|| strip_upper_bound(&range.constraint))
        });
        let result = resolve(
            SolveType::Get,
            self.registry,
            &relaxed,
            self.root_dir,
            self.lock,
            std::slice::from_ref(package),
            &[],
            self.sdk_versions,
        )
        .await
        .with_context(|| format!("failed to compute the breaking upgrade plan for {package}"))?;
        Ok(self.diff(UpgradeType::SingleBreaking, &result))
    }

    /// Upgrades reachable when every direct dependency's upper bound is
    /// dropped.
    pub async fn multi_breaking(&self) -> Result<Vec<PackageUpdate>> {
        let relaxed =
            self.with_relaxed_constraints(|_, range| Some(strip_upper_bound(&range.constraint)));
        let direct: Vec<PackageName> = self.direct_dependency_names().into_iter().collect();
        let result = resolve(
            SolveType::Get,
            self.registry,
            &relaxed,
            self.root_dir,
            self.lock,
            &direct,
            &[],
            self.sdk_versions,
        )
        .await
        .context("failed to compute the multi-package breaking upgrade plan")?;
        Ok(self.diff(UpgradeType::MultiBreaking, &result))
    }

    /// The smallest upgrade escaping versions forbidden by
    /// `extra_constraints` (typically a version hit by an advisory): every
    /// direct dependency is floored at its locked version and the solver
    /// runs in downgrade mode.
    pub async fn smallest_update(
        &self,
        extra_constraints: &[ConstraintAndCause],
    ) -> Result<Vec<PackageUpdate>> {
        let floored = self.with_relaxed_constraints(|name, _| {
            self.lock.locked(name).map(|locked| {
                VersionConstraint::from_range(VersionRange::new(
                    Some(locked.version.clone()),
                    true,
                    None,
                    false,
                ))
            })
        });
        let result = resolve(
            SolveType::Downgrade,
            self.registry,
            &floored,
            self.root_dir,
            self.lock,
            &[],
            extra_constraints,
            self.sdk_versions,
        )
        .await
        .context("failed to compute the smallest update plan")?;
        Ok(self.diff(UpgradeType::SmallestUpdate, &result))
    }

    fn direct_dependency_names(&self) -> BTreeSet<PackageName> {
        self.root
            .dependencies
            .keys()
            .chain(self.root.dev_dependencies.keys())
            .cloned()
            .collect()
    }

    /// A copy of the root manifest with some direct-dependency constraints
    /// replaced. Overrides are left untouched.
    fn with_relaxed_constraints(
        &self,
        replace: impl Fn(&PackageName, &PackageRange) -> Option<VersionConstraint>,
    ) -> Pubspec {
        let mut root = self.root.clone();
        for dependencies in [&mut root.dependencies, &mut root.dev_dependencies] {
            for (name, range) in dependencies.iter_mut() {
                if let Some(constraint) = replace(name, range) {
                    *range = range.with_constraint(constraint);
                }
            }
        }
        root
    }

    /// Turns a resolution into per-package change records, including
    /// packages the resolution removed.
    fn diff(&self, ty: UpgradeType, result: &SolveResult) -> Vec<PackageUpdate> {
        let new: BTreeMap<&PackageName, &PackageId> =
            result.packages.iter().map(|id| (&id.name, id)).collect();

        let mut names: BTreeSet<&PackageName> = new.keys().copied().collect();
        names.extend(self.lock.packages.keys());

        let mut updates = Vec::new();
        for name in names {
            let current = new.get(name).copied();
            let previous = self.lock.locked(name);
            let unchanged = match (current, previous) {
                (Some(current), Some(previous)) => current.same_resolution(previous),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }

            let original = self.root.constraint_of(name);
            let (constraint_bumped, constraint_widened, constraint_bumped_if_needed) =
                match (current, original) {
                    (Some(current), Some(original)) => {
                        let bumped = match ty {
                            UpgradeType::Compatible => {
                                // A compatible upgrade stays inside the
                                // written constraint; a target outside it
                                // would be a solver bug.
                                debug_assert!(original.allows(&current.version));
                                if original.allows(&current.version) {
                                    original.clone()
                                } else {
                                    VersionConstraint::compatible_with(&current.version)
                                }
                            }
                            _ => VersionConstraint::compatible_with(&current.version),
                        };
                        let widened = widen_constraint(original, &current.version);
                        let if_needed = if original.allows(&current.version) {
                            original.clone()
                        } else {
                            bumped.clone()
                        };
                        (Some(bumped), Some(widened), Some(if_needed))
                    }
                    _ => (None, None, None),
                };

            updates.push(PackageUpdate {
                name: name.clone(),
                version: current.map(|id| id.version.clone()),
                kind: self.root.dependency_kind(name),
                source: current.map(|id| id.kind()),
                constraint_bumped,
                constraint_widened,
                constraint_bumped_if_needed,
                previous_version: previous.map(|id| id.version.clone()),
                previous_constraint: original.cloned(),
                previous_source: previous.map(|id| id.kind()),
            });
        }
        updates
    }
}

/// Drops the upper bound of a constraint, keeping its floor.
fn strip_upper_bound(constraint: &VersionConstraint) -> VersionConstraint {
    match constraint.ranges().first() {
        Some(range) => VersionConstraint::from_range(VersionRange::new(
            range.min.clone(),
            range.include_min,
            None,
            false,
        )),
        None => VersionConstraint::any(),
    }
}

/// Widens `original` just enough to admit `version`: the nearest bound is
/// pushed past the version (up to its next breaking release when widening
/// upward).
pub fn widen_constraint(original: &VersionConstraint, version: &Version) -> VersionConstraint {
    if original.allows(version) {
        return original.clone();
    }
    let Some(first) = original.ranges().first() else {
        return VersionConstraint::compatible_with(version);
    };
    let last = original.ranges().last().expect("non-empty constraint");

    let above = match &last.max {
        Some(max) => version >= max,
        None => false,
    };
    if above {
        return VersionConstraint::from_range(VersionRange::new(
            first.min.clone(),
            first.include_min,
            Some(version.next_breaking().first_pre_release()),
            false,
        ));
    }

    let below = match &first.min {
        Some(min) => version <= min,
        None => false,
    };
    if below {
        return VersionConstraint::from_range(VersionRange::new(
            Some(version.clone()),
            true,
            last.max.clone(),
            last.include_max,
        ));
    }

    // The version falls into a gap of a union; admit its compatible window.
    original.union(&VersionConstraint::compatible_with(version))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use semver::Version;
    use smol_str::SmolStr;
    use test_case::test_case;
    use tokio::runtime::Builder;

    use super::{DependencyServices, PackageUpdate, widen_constraint};
    use crate::core::lockfile::LockFile;
    use crate::core::manifest::Pubspec;
    use crate::core::package::{DependencyKind, PackageName, PackageRange};
    use crate::core::registry::mock::{MockRegistry, dep, deps, pkgs, registry};
    use crate::resolver::ConstraintAndCause;
    use crate::version::VersionConstraint;

    #[test_case("^1.0.0", "1.5.0" => ">=1.0.0 <2.0.0-0"; "already allowed")]
    #[test_case("^1.0.0", "2.3.0" => ">=1.0.0 <3.0.0-0"; "widen upward")]
    #[test_case(">=0.9.0 <2.0.0", "0.5.0" => ">=0.5.0 <2.0.0"; "widen downward")]
    #[test_case("^2.0.0", "1.0.0" => ">=1.0.0 <3.0.0-0"; "downward keeps upper")]
    #[test_case("^0.4.0", "0.6.1" => ">=0.4.0 <0.7.0-0"; "pre 1.0 widens by minor")]
    fn widen(original: &str, version: &str) -> String {
        widen_constraint(
            &VersionConstraint::parse(original).unwrap(),
            &Version::parse(version).unwrap(),
        )
        .to_string()
    }

    fn root_pubspec(dependencies: Vec<PackageRange>) -> Pubspec {
        Pubspec {
            name: PackageName::new("myapp"),
            version: Some(Version::new(0, 0, 0)),
            dependencies: dependencies
                .into_iter()
                .map(|range| (range.name.clone(), range))
                .collect(),
            dev_dependencies: BTreeMap::new(),
            dependency_overrides: BTreeMap::new(),
            environment: BTreeMap::new(),
        }
    }

    fn sdks() -> BTreeMap<SmolStr, Version> {
        BTreeMap::from([(SmolStr::new("dart"), Version::new(3, 0, 0))])
    }

    fn lock_with(entries: Vec<crate::core::package::PackageId>) -> LockFile {
        let mut lock = LockFile::empty();
        for id in entries {
            lock.packages.insert(id.name.clone(), id);
        }
        lock
    }

    fn run<F, Fut>(f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future,
    {
        Builder::new_current_thread().build().unwrap().block_on(f())
    }

    fn upgrade_registry() -> MockRegistry {
        registry![
            ("foo 1.0.0", []),
            ("foo 1.2.0", []),
            ("foo 2.0.0", []),
            ("bar 1.0.0", []),
            ("bar 1.1.0", []),
        ]
    }

    fn find<'u>(updates: &'u [PackageUpdate], name: &str) -> &'u PackageUpdate {
        updates
            .iter()
            .find(|update| update.name == PackageName::new(name))
            .unwrap_or_else(|| panic!("no update for {name}: {updates:?}"))
    }

    #[test]
    fn compatible_stays_inside_constraints() {
        let registry = upgrade_registry();
        let root = root_pubspec(deps!["foo ^1.0.0", "bar ^1.0.0"]);
        let lock = lock_with(pkgs!["foo 1.0.0", "bar 1.1.0"]);
        let sdks = sdks();
        let services = DependencyServices::new(&registry, &root, "/myapp".into(), &lock, &sdks);

        let updates = run(|| services.compatible()).unwrap();
        // bar is already at its newest compatible version.
        assert_eq!(updates.len(), 1);
        let foo = find(&updates, "foo");
        assert_eq!(foo.version, Some(Version::new(1, 2, 0)));
        assert_eq!(foo.previous_version, Some(Version::new(1, 0, 0)));
        assert_eq!(foo.kind, DependencyKind::DirectMain);
        // The constraint as written already admits the target.
        assert_eq!(
            foo.constraint_bumped.as_ref().unwrap().to_string(),
            ">=1.0.0 <2.0.0-0"
        );
    }

    #[test]
    fn single_breaking_crosses_the_major_boundary() {
        let registry = upgrade_registry();
        let root = root_pubspec(deps!["foo ^1.0.0", "bar ^1.0.0"]);
        let lock = lock_with(pkgs!["foo 1.2.0", "bar 1.0.0"]);
        let sdks = sdks();
        let services = DependencyServices::new(&registry, &root, "/myapp".into(), &lock, &sdks);

        let foo_name = PackageName::new("foo");
        let updates = run(|| services.single_breaking(&foo_name)).unwrap();
        let foo = find(&updates, "foo");
        assert_eq!(foo.version, Some(Version::new(2, 0, 0)));
        assert_eq!(
            foo.constraint_bumped.as_ref().unwrap().to_string(),
            ">=2.0.0 <3.0.0-0"
        );
        assert_eq!(
            foo.constraint_widened.as_ref().unwrap().to_string(),
            ">=1.0.0 <3.0.0-0"
        );
        assert_eq!(
            foo.constraint_bumped_if_needed.as_ref().unwrap().to_string(),
            ">=2.0.0 <3.0.0-0"
        );
        // bar stays locked.
        assert!(updates.iter().all(|u| u.name != PackageName::new("bar")));
    }

    #[test]
    fn multi_breaking_frees_every_direct_dependency() {
        let registry = upgrade_registry();
        let root = root_pubspec(deps!["foo ^1.0.0", "bar ^1.0.0"]);
        let lock = lock_with(pkgs!["foo 1.0.0", "bar 1.0.0"]);
        let sdks = sdks();
        let services = DependencyServices::new(&registry, &root, "/myapp".into(), &lock, &sdks);

        let updates = run(|| services.multi_breaking()).unwrap();
        assert_eq!(find(&updates, "foo").version, Some(Version::new(2, 0, 0)));
        assert_eq!(find(&updates, "bar").version, Some(Version::new(1, 1, 0)));
    }

    #[test]
    fn smallest_update_escapes_an_advisory() {
        let registry = registry![
            ("foo 1.0.0", []),
            ("foo 1.0.1", []),
            ("foo 1.2.0", []),
        ];
        let root = root_pubspec(deps!["foo ^1.0.0"]);
        let lock = lock_with(pkgs!["foo 1.0.0"]);
        let sdks = sdks();
        let services = DependencyServices::new(&registry, &root, "/myapp".into(), &lock, &sdks);

        let constraints = [ConstraintAndCause {
            forbidden: dep("foo =1.0.0"),
            cause: "foo 1.0.0 is affected by a security advisory".into(),
        }];
        let updates = run(|| services.smallest_update(&constraints)).unwrap();
        let foo = find(&updates, "foo");
        // The smallest escape, not the newest version.
        assert_eq!(foo.version, Some(Version::new(1, 0, 1)));
    }

    #[test]
    fn removed_packages_are_reported() {
        let registry = registry![
            ("foo 1.0.0", ["bar ^1.0.0"]),
            ("foo 2.0.0", []),
            ("bar 1.0.0", []),
        ];
        let root = root_pubspec(deps!["foo ^1.0.0"]);
        let lock = lock_with(pkgs!["foo 1.0.0", "bar 1.0.0"]);
        let sdks = sdks();
        let services = DependencyServices::new(&registry, &root, "/myapp".into(), &lock, &sdks);

        let foo_name = PackageName::new("foo");
        let updates = run(|| services.single_breaking(&foo_name)).unwrap();
        let bar = find(&updates, "bar");
        assert_eq!(bar.version, None);
        assert_eq!(bar.previous_version, Some(Version::new(1, 0, 0)));
        assert_eq!(bar.source, None);
        assert_eq!(
            bar.previous_source,
            Some(crate::core::source::SourceKind::Hosted)
        );
    }
}
