use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use semver::Version;

use crate::core::PackageName;
use crate::core::checksum::Checksum;
use crate::core::package::{PackageRange, PackageRef};
use crate::core::source::{ResolvedDescription, SourceKind};
use crate::version::VersionConstraint;

/// A package pinned to a concrete version and resolved source.
///
/// See [`PackageIdInner`] for public fields reference.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PackageId(Arc<PackageIdInner>);

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub struct PackageIdInner {
    pub name: PackageName,
    pub version: Version,
    pub description: ResolvedDescription,
}

impl PackageId {
    pub fn new(name: PackageName, version: Version, description: ResolvedDescription) -> Self {
        Self(Arc::new(PackageIdInner {
            name,
            version,
            description,
        }))
    }

    pub fn kind(&self) -> SourceKind {
        self.description.kind()
    }

    pub fn is_root(&self) -> bool {
        self.kind() == SourceKind::Root
    }

    pub fn to_ref(&self) -> PackageRef {
        PackageRef {
            name: self.name.clone(),
            description: self.description.description(),
        }
    }

    /// This package as a range matching exactly this version.
    pub fn as_range(&self) -> PackageRange {
        PackageRange::builder()
            .name(self.name.clone())
            .description(self.description.description())
            .constraint(VersionConstraint::exact(&self.version))
            .build()
    }

    pub fn with_sha256(&self, checksum: Checksum) -> Self {
        Self::new(
            self.name.clone(),
            self.version.clone(),
            self.description.with_sha256(checksum),
        )
    }

    /// Whether `other` pins the same package to the same version, ignoring
    /// resolution artifacts such as the archive hash.
    pub fn same_resolution(&self, other: &PackageId) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.description.description() == other.description.description()
    }
}

impl Deref for PackageId {
    type Target = PackageIdInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)?;
        match self.kind() {
            SourceKind::Hosted | SourceKind::Root => Ok(()),
            _ => write!(f, " ({})", self.description.description()),
        }
    }
}

impl fmt::Debug for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PackageId({} {} {})",
            self.name,
            self.version,
            self.description.description()
        )
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;
    use url::Url;

    use crate::core::PackageName;
    use crate::core::package::PackageId;
    use crate::core::source::{
        GitDescription, GitReference, HostedDescription, ResolvedDescription,
    };

    fn hosted(name: &str, version: &str) -> PackageId {
        PackageId::new(
            PackageName::new(name),
            Version::parse(version).unwrap(),
            ResolvedDescription::Hosted {
                description: HostedDescription::new(
                    PackageName::new(name),
                    Url::parse("https://pub.dev").unwrap(),
                ),
                sha256: None,
            },
        )
    }

    #[test]
    fn display_omits_hosted_source() {
        assert_eq!(hosted("foo", "1.2.3").to_string(), "foo 1.2.3");
    }

    #[test]
    fn display_shows_git_source() {
        let id = PackageId::new(
            PackageName::new("foo"),
            Version::new(1, 0, 0),
            ResolvedDescription::Git {
                description: GitDescription::new(
                    "https://example.com/foo.git",
                    GitReference::DefaultBranch,
                ),
                commit: "deadbeef".into(),
            },
        );
        assert_eq!(id.to_string(), "foo 1.0.0 (git+https://example.com/foo.git)");
    }

    #[test]
    fn same_resolution_ignores_hash() {
        let plain = hosted("foo", "1.2.3");
        let hashed = plain.with_sha256(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                .parse()
                .unwrap(),
        );
        assert_ne!(plain, hashed);
        assert!(plain.same_resolution(&hashed));
    }
}
