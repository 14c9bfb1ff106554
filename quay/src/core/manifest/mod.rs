//! The pubspec: a package's declarative manifest.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use serde_yaml::{Mapping, Value};
use smol_str::SmolStr;
use url::Url;

use crate::core::errors::ManifestFormatError;
use crate::core::package::{DependencyKind, PackageId, PackageName, PackageRange};
use crate::core::source::{
    Description, GitDescription, GitReference, HostedDescription, PathDescription,
    ResolvedDescription, RootDescription, SdkDescription,
};
use crate::internal::{fsx, serdex};
use crate::version::VersionConstraint;
use crate::{DEFAULT_SDK_NAME, MANIFEST_FILE_NAME};

/// A parsed `pubspec.yaml`. Immutable once loaded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pubspec {
    pub name: PackageName,
    pub version: Option<Version>,
    pub dependencies: BTreeMap<PackageName, PackageRange>,
    pub dev_dependencies: BTreeMap<PackageName, PackageRange>,
    pub dependency_overrides: BTreeMap<PackageName, PackageRange>,
    /// SDK constraints, keyed by SDK identifier. The `sdk` shorthand in the
    /// manifest's `environment` section names the default SDK.
    pub environment: BTreeMap<SmolStr, VersionConstraint>,
}

impl Pubspec {
    pub fn load(dir: &Utf8Path, default_hosted_url: &Url) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let content = fsx::read_to_string(&path)?;
        Self::parse(&content, path.as_str(), Some(dir), default_hosted_url)
            .with_context(|| format!("failed to load package manifest at {path}"))
    }

    pub fn parse(
        content: &str,
        file: &str,
        containing_dir: Option<&Utf8Path>,
        default_hosted_url: &Url,
    ) -> Result<Self> {
        let document: Value = serde_yaml::from_str(content)
            .map_err(|err| ManifestFormatError::new(file, "", err.to_string()))?;
        let document = serdex::expect_mapping(&document, file, "")?;

        let name = serdex::require_str(document, "name", file, "")?;
        let name = PackageName::try_new(name)
            .map_err(|err| ManifestFormatError::new(file, "name", err.to_string()))?;

        let version = serdex::get_str(document, "version", file, "")?
            .map(|text| {
                Version::parse(text)
                    .map_err(|err| ManifestFormatError::new(file, "version", err.to_string()))
            })
            .transpose()?;

        let dependencies =
            parse_dependency_map(document, "dependencies", file, containing_dir, default_hosted_url)?;
        let dev_dependencies = parse_dependency_map(
            document,
            "dev_dependencies",
            file,
            containing_dir,
            default_hosted_url,
        )?;
        let dependency_overrides = parse_dependency_map(
            document,
            "dependency_overrides",
            file,
            containing_dir,
            default_hosted_url,
        )?;

        for name in dependencies.keys() {
            if dev_dependencies.contains_key(name) {
                return Err(ManifestFormatError::new(
                    file,
                    format!("dev_dependencies.{name}"),
                    format!("`{name}` appears in both `dependencies` and `dev_dependencies`"),
                )
                .into());
            }
        }

        let environment = parse_environment(document, file)?;

        Ok(Self {
            name,
            version,
            dependencies,
            dev_dependencies,
            dependency_overrides,
            environment,
        })
    }

    /// The version this package carries, or `0.0.0` when it does not declare
    /// one.
    pub fn version_or_default(&self) -> Version {
        self.version.clone().unwrap_or_else(|| Version::new(0, 0, 0))
    }

    /// Identity of this package when it is the resolution root.
    pub fn root_id(&self, root_dir: &Utf8Path) -> PackageId {
        PackageId::new(
            self.name.clone(),
            self.version_or_default(),
            ResolvedDescription::Root(RootDescription {
                path: root_dir.to_path_buf(),
            }),
        )
    }

    /// Direct dependencies as the solver sees them from the root package:
    /// main and dev dependencies, with overrides shadowing both.
    pub fn root_dependencies(&self) -> Vec<PackageRange> {
        let mut combined: BTreeMap<PackageName, PackageRange> = self.dependencies.clone();
        for (name, range) in &self.dev_dependencies {
            combined.insert(name.clone(), range.clone());
        }
        for (name, range) in &self.dependency_overrides {
            combined.insert(name.clone(), range.clone());
        }
        combined.into_values().collect()
    }

    /// Dependencies seen from this package when it is *not* the root: dev
    /// dependencies do not propagate.
    pub fn propagated_dependencies(&self) -> Vec<PackageRange> {
        self.dependencies.values().cloned().collect()
    }

    pub fn dependency_kind(&self, name: &PackageName) -> DependencyKind {
        if self.dependency_overrides.contains_key(name) {
            DependencyKind::DirectOverridden
        } else if self.dependencies.contains_key(name) {
            DependencyKind::DirectMain
        } else if self.dev_dependencies.contains_key(name) {
            DependencyKind::DirectDev
        } else {
            DependencyKind::Transitive
        }
    }

    /// The declared constraint for a direct dependency, if any.
    pub fn constraint_of(&self, name: &PackageName) -> Option<&VersionConstraint> {
        self.dependencies
            .get(name)
            .or_else(|| self.dev_dependencies.get(name))
            .map(|range| &range.constraint)
    }

    /// The language version this package is written against, derived from
    /// the lower bound of its default-SDK constraint.
    pub fn language_version(&self) -> Option<String> {
        let constraint = self.environment.get(DEFAULT_SDK_NAME)?;
        let range = constraint.ranges().first()?;
        let min = range.min.as_ref()?;
        Some(format!("{}.{}", min.major, min.minor))
    }
}

fn parse_environment(
    document: &Mapping,
    file: &str,
) -> Result<BTreeMap<SmolStr, VersionConstraint>, ManifestFormatError> {
    let mut environment = BTreeMap::new();
    let Some(value) = serdex::get(document, "environment") else {
        return Ok(environment);
    };
    let mapping = serdex::expect_mapping(value, file, "environment")?;
    for (key, value) in mapping {
        let key = serdex::expect_str(key, file, "environment")?;
        let sdk = if key == "sdk" { DEFAULT_SDK_NAME } else { key };
        let field = format!("environment.{key}");
        let text = serdex::expect_str(value, file, &field)?;
        let constraint = VersionConstraint::parse(text)
            .map_err(|err| ManifestFormatError::new(file, &field, err.to_string()))?;
        environment.insert(SmolStr::new(sdk), constraint);
    }
    Ok(environment)
}

fn parse_dependency_map(
    document: &Mapping,
    key: &str,
    file: &str,
    containing_dir: Option<&Utf8Path>,
    default_hosted_url: &Url,
) -> Result<BTreeMap<PackageName, PackageRange>, ManifestFormatError> {
    let mut dependencies = BTreeMap::new();
    let Some(value) = serdex::get(document, key) else {
        return Ok(dependencies);
    };
    if value.is_null() {
        return Ok(dependencies);
    }
    let mapping = serdex::expect_mapping(value, file, key)?;
    for (name, spec) in mapping {
        let name = serdex::expect_str(name, file, key)?;
        let field = format!("{key}.{name}");
        let name = PackageName::try_new(name)
            .map_err(|err| ManifestFormatError::new(file, &field, err.to_string()))?;
        let range = parse_dependency(&name, spec, file, &field, containing_dir, default_hosted_url)?;
        dependencies.insert(name, range);
    }
    Ok(dependencies)
}

fn parse_dependency(
    name: &PackageName,
    spec: &Value,
    file: &str,
    field: &str,
    containing_dir: Option<&Utf8Path>,
    default_hosted_url: &Url,
) -> Result<PackageRange, ManifestFormatError> {
    let default_hosted = || {
        Description::Hosted(HostedDescription::new(
            name.clone(),
            default_hosted_url.clone(),
        ))
    };

    let (description, constraint) = match spec {
        // `foo:` pins nothing and means the default hosted source.
        Value::Null => (default_hosted(), VersionConstraint::any()),
        Value::String(constraint) => {
            let constraint = VersionConstraint::parse(constraint)
                .map_err(|err| ManifestFormatError::new(file, field, err.to_string()))?;
            (default_hosted(), constraint)
        }
        Value::Mapping(map) => {
            let constraint = match serdex::get_str(map, "version", file, field)? {
                Some(text) => VersionConstraint::parse(text).map_err(|err| {
                    ManifestFormatError::new(file, format!("{field}.version"), err.to_string())
                })?,
                None => VersionConstraint::any(),
            };
            let description =
                parse_dependency_source(name, map, file, field, containing_dir, default_hosted_url)?
                    .unwrap_or_else(default_hosted);
            (description, constraint)
        }
        _ => {
            return Err(ManifestFormatError::new(
                file,
                field,
                "expected a version constraint or a source map",
            ));
        }
    };

    Ok(PackageRange::builder()
        .name(name.clone())
        .description(description)
        .constraint(constraint)
        .build())
}

fn parse_dependency_source(
    name: &PackageName,
    map: &Mapping,
    file: &str,
    field: &str,
    containing_dir: Option<&Utf8Path>,
    default_hosted_url: &Url,
) -> Result<Option<Description>, ManifestFormatError> {
    let mut found: Option<Description> = None;
    let mut check = |description: Description| {
        if found.is_some() {
            return Err(ManifestFormatError::new(
                file,
                field,
                "a dependency may specify at most one of `hosted`, `git`, `path` and `sdk`",
            ));
        }
        found = Some(description);
        Ok(())
    };

    if let Some(hosted) = serdex::get(map, "hosted") {
        let description = match hosted {
            Value::String(url_or_name) => {
                // A bare string is a URL; hosted package names that differ
                // from the dependency name use the map form.
                let url = Url::parse(url_or_name).map_err(|err| {
                    ManifestFormatError::new(file, format!("{field}.hosted"), err.to_string())
                })?;
                HostedDescription::new(name.clone(), url)
            }
            Value::Mapping(hosted) => {
                let hosted_field = format!("{field}.hosted");
                let server_name = match serdex::get_str(hosted, "name", file, &hosted_field)? {
                    Some(text) => PackageName::try_new(text).map_err(|err| {
                        ManifestFormatError::new(
                            file,
                            format!("{hosted_field}.name"),
                            err.to_string(),
                        )
                    })?,
                    None => name.clone(),
                };
                let url = match serdex::get_str(hosted, "url", file, &hosted_field)? {
                    Some(url) => Url::parse(url).map_err(|err| {
                        ManifestFormatError::new(
                            file,
                            format!("{hosted_field}.url"),
                            err.to_string(),
                        )
                    })?,
                    None => default_hosted_url.clone(),
                };
                HostedDescription::new(server_name, url)
            }
            _ => {
                return Err(ManifestFormatError::new(
                    file,
                    format!("{field}.hosted"),
                    "expected a URL or a map",
                ));
            }
        };
        check(Description::Hosted(description))?;
    }

    if let Some(git) = serdex::get(map, "git") {
        let description = match git {
            Value::String(url) => GitDescription::new(url.clone(), GitReference::DefaultBranch),
            Value::Mapping(git) => {
                let git_field = format!("{field}.git");
                let url = serdex::require_str(git, "url", file, &git_field)?;
                let reference = match serdex::get_str(git, "ref", file, &git_field)? {
                    Some(reference) => GitReference::Rev(reference.into()),
                    None => GitReference::DefaultBranch,
                };
                let mut description = GitDescription::new(url, reference);
                if let Some(path) = serdex::get_str(git, "path", file, &git_field)? {
                    description.path = path.into();
                }
                description
            }
            _ => {
                return Err(ManifestFormatError::new(
                    file,
                    format!("{field}.git"),
                    "expected a URL or a map",
                ));
            }
        };
        check(Description::Git(description))?;
    }

    if let Some(path) = serdex::get(map, "path") {
        let path = serdex::expect_str(path, file, &format!("{field}.path"))?;
        let path = Utf8PathBuf::from(path);
        let relative = path.is_relative();
        let path = match (relative, containing_dir) {
            (true, Some(dir)) => dir.join(path),
            _ => path,
        };
        check(Description::Path(PathDescription::new(path, relative)))?;
    }

    if let Some(sdk) = serdex::get(map, "sdk") {
        let sdk = serdex::expect_str(sdk, file, &format!("{field}.sdk"))?;
        check(Description::Sdk(SdkDescription::new(sdk)))?;
    }

    Ok(found)
}
