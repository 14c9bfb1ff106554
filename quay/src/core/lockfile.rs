//! The lock file: a concrete pinning of every transitive dependency.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use camino::Utf8Path;
use semver::Version;
use serde_yaml::{Mapping, Value};
use smol_str::SmolStr;

use crate::DEFAULT_SDK_NAME;
use crate::core::checksum::Checksum;
use crate::core::errors::{HashMismatchError, ManifestFormatError};
use crate::core::manifest::Pubspec;
use crate::core::package::{DependencyKind, PackageId, PackageName};
use crate::core::source::{ResolvedDescription, SourceKind};
use crate::internal::{fsx, serdex};
use crate::version::VersionConstraint;

const HEADER: &str = "# Generated by quay. Do not edit this file by hand.";

/// A parsed lock file. The root package never appears in it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LockFile {
    pub packages: BTreeMap<PackageName, PackageId>,
    /// SDK constraints: the intersection of the constraints declared by
    /// every locked package.
    pub sdks: BTreeMap<SmolStr, VersionConstraint>,
    pub main_dependencies: BTreeSet<PackageName>,
    pub dev_dependencies: BTreeSet<PackageName>,
    pub overridden_dependencies: BTreeSet<PackageName>,
}

impl LockFile {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the lock file for a fresh resolution. `packages` pairs each
    /// selected package with its resolved pubspec; the root package is
    /// skipped.
    pub fn from_resolution<'a>(
        root: &Pubspec,
        packages: impl IntoIterator<Item = (&'a PackageId, &'a Pubspec)>,
    ) -> Self {
        let mut sdks: BTreeMap<SmolStr, VersionConstraint> = BTreeMap::new();
        sdks.insert(SmolStr::new(DEFAULT_SDK_NAME), VersionConstraint::any());
        for (sdk, constraint) in &root.environment {
            let entry = sdks
                .entry(sdk.clone())
                .or_insert_with(VersionConstraint::any);
            *entry = entry.intersect(constraint);
        }

        let mut lock = Self::empty();
        for (id, pubspec) in packages {
            if id.is_root() {
                continue;
            }
            for (sdk, constraint) in &pubspec.environment {
                let entry = sdks
                    .entry(sdk.clone())
                    .or_insert_with(VersionConstraint::any);
                *entry = entry.intersect(constraint);
            }
            match root.dependency_kind(&id.name) {
                DependencyKind::DirectMain => {
                    lock.main_dependencies.insert(id.name.clone());
                }
                DependencyKind::DirectDev => {
                    lock.dev_dependencies.insert(id.name.clone());
                }
                DependencyKind::DirectOverridden => {
                    lock.overridden_dependencies.insert(id.name.clone());
                }
                DependencyKind::Transitive => {}
            }
            lock.packages.insert(id.name.clone(), id.clone());
        }
        lock.sdks = sdks;
        lock
    }

    pub fn from_path(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(Self::empty());
        }
        let content = fsx::read_to_string(path)?;
        Self::parse(&content, path.as_str(), path.parent())
            .with_context(|| format!("failed to parse lock file at {path}"))
    }

    pub fn parse(content: &str, file: &str, dir: Option<&Utf8Path>) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::empty());
        }

        let document: Value = serde_yaml::from_str(content)
            .map_err(|err| ManifestFormatError::new(file, "", err.to_string()))?;
        let document = serdex::expect_mapping(&document, file, "")?;

        let mut lock = Self::empty();

        if let Some(sdks) = serdex::get(document, "sdks") {
            let sdks = serdex::expect_mapping(sdks, file, "sdks")?;
            for (sdk, constraint) in sdks {
                let sdk = serdex::expect_str(sdk, file, "sdks")?;
                let field = format!("sdks.{sdk}");
                let text = serdex::expect_str(constraint, file, &field)?;
                let constraint = VersionConstraint::parse(text)
                    .map_err(|err| ManifestFormatError::new(file, &field, err.to_string()))?;
                lock.sdks.insert(SmolStr::new(sdk), constraint);
            }
        } else if let Some(legacy) = serdex::get_str(document, "sdk", file, "")? {
            // Ancient lock files carried a single `sdk` key for the default
            // SDK.
            let constraint = VersionConstraint::parse(legacy)
                .map_err(|err| ManifestFormatError::new(file, "sdk", err.to_string()))?;
            lock.sdks.insert(SmolStr::new(DEFAULT_SDK_NAME), constraint);
        }

        if let Some(packages) = serdex::get(document, "packages") {
            if !packages.is_null() {
                let packages = serdex::expect_mapping(packages, file, "packages")?;
                for (name, entry) in packages {
                    let name = serdex::expect_str(name, file, "packages")?;
                    let field = format!("packages.{name}");
                    let name = PackageName::try_new(name)
                        .map_err(|err| ManifestFormatError::new(file, &field, err.to_string()))?;
                    let id = parse_package_entry(&name, entry, file, &field, dir)?;
                    match serdex::get_str(
                        serdex::expect_mapping(entry, file, &field)?,
                        "dependency",
                        file,
                        &field,
                    )? {
                        Some(kind) => {
                            let kind = DependencyKind::from_str(kind).map_err(|err| {
                                ManifestFormatError::new(
                                    file,
                                    format!("{field}.dependency"),
                                    err.to_string(),
                                )
                            })?;
                            match kind {
                                DependencyKind::DirectMain => {
                                    lock.main_dependencies.insert(name.clone());
                                }
                                DependencyKind::DirectDev => {
                                    lock.dev_dependencies.insert(name.clone());
                                }
                                DependencyKind::DirectOverridden => {
                                    lock.overridden_dependencies.insert(name.clone());
                                }
                                DependencyKind::Transitive => {}
                            }
                        }
                        None => {}
                    }
                    lock.packages.insert(name, id);
                }
            }
        }

        Ok(lock)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn locked(&self, name: &PackageName) -> Option<&PackageId> {
        self.packages.get(name)
    }

    pub fn dependency_kind(&self, name: &PackageName) -> DependencyKind {
        if self.overridden_dependencies.contains(name) {
            DependencyKind::DirectOverridden
        } else if self.main_dependencies.contains(name) {
            DependencyKind::DirectMain
        } else if self.dev_dependencies.contains(name) {
            DependencyKind::DirectDev
        } else {
            DependencyKind::Transitive
        }
    }

    /// Whether both lock files pin the same package set, ignoring content
    /// hashes learned after the fact.
    pub fn packages_equal(&self, other: &LockFile) -> bool {
        self.packages.len() == other.packages.len()
            && self.packages.iter().all(|(name, id)| {
                other
                    .packages
                    .get(name)
                    .is_some_and(|other_id| id.same_resolution(other_id))
            })
    }

    /// Serializes this lock file.
    ///
    /// `sha256_from_cache` supplies the cache's recorded archive hash for
    /// hosted packages; a cached hash that disagrees with the locked one is
    /// a [`HashMismatchError`], unless the lock previously carried no hash.
    pub fn render(
        &self,
        dir: Option<&Utf8Path>,
        sha256_from_cache: impl Fn(&PackageId) -> Option<Checksum>,
    ) -> Result<String> {
        let mut doc = Mapping::new();

        let mut packages = Mapping::new();
        for (name, id) in &self.packages {
            let id = self.enforce_hash(id, &sha256_from_cache)?;
            let mut entry = Mapping::new();
            entry.insert(
                "dependency".into(),
                self.dependency_kind(name).as_str().into(),
            );
            entry.insert("description".into(), id.description.to_lock_value(dir));
            entry.insert("source".into(), id.kind().as_str().into());
            entry.insert("version".into(), id.version.to_string().into());
            packages.insert(name.as_str().into(), Value::Mapping(entry));
        }
        doc.insert("packages".into(), Value::Mapping(packages));

        let mut sdks = Mapping::new();
        for (sdk, constraint) in &self.sdks {
            sdks.insert(sdk.as_str().into(), constraint.to_string().into());
        }
        doc.insert("sdks".into(), Value::Mapping(sdks));

        let body = serde_yaml::to_string(&Value::Mapping(doc))?;
        Ok(format!("{HEADER}\n{body}"))
    }

    /// Like [`Self::render`], but preserves the newline convention of the
    /// file previously on disk: when CRLF is the majority line ending there,
    /// the output uses CRLF too.
    pub fn render_like(
        &self,
        existing: Option<&str>,
        dir: Option<&Utf8Path>,
        sha256_from_cache: impl Fn(&PackageId) -> Option<Checksum>,
    ) -> Result<String> {
        let rendered = self.render(dir, sha256_from_cache)?;
        if existing.is_some_and(majority_crlf) {
            Ok(rendered.replace('\n', "\r\n"))
        } else {
            Ok(rendered)
        }
    }

    fn enforce_hash(
        &self,
        id: &PackageId,
        sha256_from_cache: &impl Fn(&PackageId) -> Option<Checksum>,
    ) -> Result<PackageId> {
        if id.kind() != SourceKind::Hosted {
            return Ok(id.clone());
        }
        match (id.description.sha256().copied(), sha256_from_cache(id)) {
            (Some(locked), Some(cached)) if locked != cached => Err(HashMismatchError {
                package: format!("{} {}", id.name, id.version),
                locked,
                cached,
            }
            .into()),
            (None, Some(cached)) => Ok(id.with_sha256(cached)),
            _ => Ok(id.clone()),
        }
    }
}

fn parse_package_entry(
    name: &PackageName,
    entry: &Value,
    file: &str,
    field: &str,
    dir: Option<&Utf8Path>,
) -> Result<PackageId, ManifestFormatError> {
    let entry = serdex::expect_mapping(entry, file, field)?;

    let version = serdex::require_str(entry, "version", file, field)?;
    let version = Version::parse(version).map_err(|err| {
        ManifestFormatError::new(file, format!("{field}.version"), err.to_string())
    })?;

    let source = serdex::require_str(entry, "source", file, field)?;
    let source = SourceKind::from_str(source).map_err(|err| {
        ManifestFormatError::new(file, format!("{field}.source"), err.to_string())
    })?;

    let description = serdex::get(entry, "description").ok_or_else(|| {
        ManifestFormatError::new(file, field, "missing required key `description`")
    })?;
    let description = ResolvedDescription::parse_lock_value(
        source,
        name,
        description,
        file,
        &format!("{field}.description"),
        dir,
    )?;

    Ok(PackageId::new(name.clone(), version, description))
}

fn majority_crlf(content: &str) -> bool {
    let crlf = content.matches("\r\n").count();
    let lf = content.matches('\n').count() - crlf;
    crlf > lf
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use semver::Version;
    use url::Url;

    use super::LockFile;
    use crate::core::checksum::Checksum;
    use crate::core::package::{DependencyKind, PackageId, PackageName};
    use crate::core::source::{HostedDescription, PathDescription, ResolvedDescription};

    fn no_cache(_: &PackageId) -> Option<Checksum> {
        None
    }

    fn sha(text: &str) -> Checksum {
        text.parse().unwrap()
    }

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn hosted(name: &str, version: &str, sha256: Option<&str>) -> PackageId {
        PackageId::new(
            PackageName::new(name),
            Version::parse(version).unwrap(),
            ResolvedDescription::Hosted {
                description: HostedDescription::new(
                    PackageName::new(name),
                    Url::parse("https://pub.dev").unwrap(),
                ),
                sha256: sha256.map(sha),
            },
        )
    }

    fn simple_lock() -> LockFile {
        let mut lock = LockFile::empty();
        lock.packages
            .insert(PackageName::new("foo"), hosted("foo", "1.2.3", Some(SHA_A)));
        lock.packages.insert(
            PackageName::new("bar"),
            PackageId::new(
                PackageName::new("bar"),
                Version::new(2, 0, 0),
                ResolvedDescription::Path(PathDescription::new("../bar", true)),
            ),
        );
        lock.main_dependencies.insert(PackageName::new("foo"));
        lock.overridden_dependencies.insert(PackageName::new("bar"));
        lock.sdks
            .insert("dart".into(), ">=2.12.0 <3.0.0".parse().unwrap());
        lock
    }

    #[test]
    fn render_parse_roundtrip() {
        let lock = simple_lock();
        let rendered = lock.render(None, no_cache).unwrap();
        let parsed = LockFile::parse(&rendered, "pubspec.lock", None).unwrap();
        assert_eq!(parsed, lock);
    }

    #[test]
    fn renders_alphabetically_with_header() {
        let rendered = simple_lock().render(None, no_cache).unwrap();
        assert_eq!(
            rendered,
            indoc! {r#"
                # Generated by quay. Do not edit this file by hand.
                packages:
                  bar:
                    dependency: direct overridden
                    description:
                      path: ../bar
                      relative: true
                    source: path
                    version: 2.0.0
                  foo:
                    dependency: direct main
                    description:
                      name: foo
                      sha256: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
                      url: https://pub.dev/
                    source: hosted
                    version: 1.2.3
                sdks:
                  dart: '>=2.12.0 <3.0.0'
            "#}
        );
    }

    #[test]
    fn empty_lock_serializes_default_shape() {
        let rendered = LockFile::empty().render(None, no_cache).unwrap();
        let parsed = LockFile::parse(&rendered, "pubspec.lock", None).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn legacy_sdk_key_means_default_sdk() {
        let lock = LockFile::parse("sdk: '>=2.0.0 <3.0.0'\n", "pubspec.lock", None).unwrap();
        assert_eq!(
            lock.sdks.get("dart").unwrap().to_string(),
            ">=2.0.0 <3.0.0"
        );
    }

    #[test]
    fn missing_version_is_positional_error() {
        let err = LockFile::parse(
            indoc! {r#"
                packages:
                  foo:
                    source: hosted
                    description: https://pub.dev
            "#},
            "pubspec.lock",
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("`packages.foo`"));
        assert!(err.to_string().contains("missing required key `version`"));
    }

    #[test]
    fn hash_is_promoted_from_cache() {
        let mut lock = LockFile::empty();
        lock.packages
            .insert(PackageName::new("foo"), hosted("foo", "1.2.3", None));
        let rendered = lock.render(None, |_| Some(sha(SHA_A))).unwrap();
        assert!(rendered.contains(SHA_A));
    }

    #[test]
    fn hash_mismatch_fails() {
        let mut lock = LockFile::empty();
        lock.packages
            .insert(PackageName::new("foo"), hosted("foo", "1.2.3", Some(SHA_A)));
        let err = lock.render(None, |_| Some(sha(SHA_B))).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn crlf_majority_is_preserved() {
        let lock = simple_lock();
        let existing = "packages: {}\r\nsdks: {}\r\n";
        let rendered = lock.render_like(Some(existing), None, no_cache).unwrap();
        assert!(rendered.contains("\r\n"));
        assert_eq!(rendered.matches('\n').count(), rendered.matches("\r\n").count());

        let rendered = lock.render_like(Some("packages: {}\n"), None, no_cache).unwrap();
        assert!(!rendered.contains("\r\n"));
    }

    #[test]
    fn dependency_kinds_roundtrip() {
        let lock = simple_lock();
        let rendered = lock.render(None, no_cache).unwrap();
        let parsed = LockFile::parse(&rendered, "pubspec.lock", None).unwrap();
        assert_eq!(
            parsed.dependency_kind(&PackageName::new("foo")),
            DependencyKind::DirectMain
        );
        assert_eq!(
            parsed.dependency_kind(&PackageName::new("bar")),
            DependencyKind::DirectOverridden
        );
        assert_eq!(
            parsed.dependency_kind(&PackageName::new("quux")),
            DependencyKind::Transitive
        );
    }

    #[test]
    fn packages_equal_ignores_hash() {
        let mut a = LockFile::empty();
        a.packages
            .insert(PackageName::new("foo"), hosted("foo", "1.2.3", None));
        let mut b = LockFile::empty();
        b.packages
            .insert(PackageName::new("foo"), hosted("foo", "1.2.3", Some(SHA_A)));
        assert!(a.packages_equal(&b));

        b.packages
            .insert(PackageName::new("bar"), hosted("bar", "1.0.0", None));
        assert!(!a.packages_equal(&b));
    }
}
