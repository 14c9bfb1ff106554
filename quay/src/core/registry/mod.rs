use anyhow::Result;
use async_trait::async_trait;

use crate::core::manifest::Pubspec;
use crate::core::package::{PackageId, PackageRef};

/// What the version solver needs from the world of packages.
///
/// Implementations are expected to be idempotent: repeated queries return
/// the same answers, and callers may cache aggressively.
#[async_trait(?Send)]
pub trait Registry {
    /// All non-retracted concrete versions known for a package. The order
    /// is unspecified; callers sort according to their own preference.
    async fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>>;

    /// The manifest of one concrete version.
    async fn describe(&self, id: &PackageId) -> Result<Pubspec>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{BTreeMap, HashMap};

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use semver::Version;
    use smol_str::SmolStr;
    use url::Url;

    use crate::core::manifest::Pubspec;
    use crate::core::package::{PackageId, PackageName, PackageRange, PackageRef};
    use crate::core::registry::Registry;
    use crate::core::source::{Description, HostedDescription, ResolvedDescription};
    use crate::version::VersionConstraint;

    pub const TEST_HOSTED_URL: &str = "https://pub.test";

    pub fn hosted_description(name: &str) -> Description {
        Description::Hosted(HostedDescription::new(
            PackageName::new(name),
            Url::parse(TEST_HOSTED_URL).unwrap(),
        ))
    }

    /// Parses `"name version"` into a hosted [`PackageId`] on the test
    /// repository.
    pub fn pkg(text: &str) -> PackageId {
        let (name, version) = text
            .split_once(' ')
            .unwrap_or_else(|| panic!("malformed package: {text}"));
        PackageId::new(
            PackageName::new(name),
            Version::parse(version).unwrap(),
            ResolvedDescription::Hosted {
                description: HostedDescription::new(
                    PackageName::new(name),
                    Url::parse(TEST_HOSTED_URL).unwrap(),
                ),
                sha256: None,
            },
        )
    }

    /// Parses `"name constraint"` into a hosted dependency request.
    pub fn dep(text: &str) -> PackageRange {
        let (name, constraint) = text
            .split_once(' ')
            .unwrap_or_else(|| panic!("malformed dependency: {text}"));
        PackageRange::builder()
            .name(PackageName::new(name))
            .description(hosted_description(name))
            .constraint(VersionConstraint::parse(constraint).unwrap())
            .build()
    }

    #[derive(Debug, Default)]
    pub struct MockRegistry {
        index: HashMap<PackageRef, Vec<PackageId>>,
        pubspecs: HashMap<PackageId, Pubspec>,
    }

    impl MockRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&mut self, id: PackageId, dependencies: Vec<PackageRange>) {
            self.put_with_env(id, dependencies, &[]);
        }

        pub fn put_with_env(
            &mut self,
            id: PackageId,
            dependencies: Vec<PackageRange>,
            environment: &[(&str, &str)],
        ) {
            assert!(
                !self.pubspecs.contains_key(&id),
                "package {id} is already in registry"
            );

            let pubspec = Pubspec {
                name: id.name.clone(),
                version: Some(id.version.clone()),
                dependencies: dependencies
                    .into_iter()
                    .map(|range| (range.name.clone(), range))
                    .collect(),
                dev_dependencies: BTreeMap::new(),
                dependency_overrides: BTreeMap::new(),
                environment: environment
                    .iter()
                    .map(|(sdk, constraint)| {
                        (
                            SmolStr::new(sdk),
                            VersionConstraint::parse(constraint).unwrap(),
                        )
                    })
                    .collect(),
            };

            self.index.entry(id.to_ref()).or_default().push(id.clone());
            self.pubspecs.insert(id, pubspec);
        }
    }

    #[async_trait(?Send)]
    impl Registry for MockRegistry {
        async fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
            Ok(self.index.get(package).cloned().unwrap_or_default())
        }

        async fn describe(&self, id: &PackageId) -> Result<Pubspec> {
            self.pubspecs
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow!("MockRegistry/describe: unknown package {id}"))
        }
    }

    macro_rules! registry {
        [$($x:tt),* $(,)?] => {{
            #[allow(unused_imports)]
            use $crate::core::registry::mock;
            #[allow(unused_mut)]
            let mut registry = mock::MockRegistry::new();
            $({
                let (id, deps) = mock::registry_entry!($x);
                registry.put(id, deps);
            })*
            registry
        }};
    }

    pub(crate) use registry;

    macro_rules! registry_entry {
        (($p:literal, [ $($d:literal),* $(,)? ] $(,)?)) => {{
            #[allow(unused_imports)]
            use $crate::core::registry::mock;
            (mock::pkg($p), vec![$(mock::dep($d)),*])
        }};
    }

    pub(crate) use registry_entry;

    macro_rules! deps {
        [$($d:literal),* $(,)?] => {
            vec![$($crate::core::registry::mock::dep($d)),*]
        };
    }

    pub(crate) use deps;

    macro_rules! pkgs {
        [$($p:literal),* $(,)?] => {
            vec![$($crate::core::registry::mock::pkg($p)),*]
        };
    }

    pub(crate) use pkgs;
}
