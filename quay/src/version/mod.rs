//! Semantic versions and the constraint algebra built on top of them.

use semver::{BuildMetadata, Prerelease, Version};

mod constraint;

pub use constraint::{VersionConstraint, VersionRange};

/// Extensions over [`semver::Version`] used throughout version solving.
pub trait VersionExt {
    /// The smallest version that is not backwards compatible with `self`.
    ///
    /// For versions past `1.0.0` this is the next major version. Before
    /// `1.0.0` the minor (or, for `0.0.x`, the patch) component is the
    /// breaking one.
    fn next_breaking(&self) -> Version;

    /// The first possible pre-release of this version, i.e. `x.y.z-0`.
    ///
    /// Sorts before every other pre-release of the same version core, which
    /// makes it a useful exclusive upper bound.
    fn first_pre_release(&self) -> Version;

    fn is_pre_release(&self) -> bool;

    /// The `(major, minor, patch)` core, ignoring pre-release and build.
    fn core(&self) -> (u64, u64, u64);
}

impl VersionExt for Version {
    fn next_breaking(&self) -> Version {
        if self.major > 0 {
            Version::new(self.major + 1, 0, 0)
        } else if self.minor > 0 {
            Version::new(0, self.minor + 1, 0)
        } else {
            Version::new(0, 0, self.patch + 1)
        }
    }

    fn first_pre_release(&self) -> Version {
        Version {
            major: self.major,
            minor: self.minor,
            patch: self.patch,
            pre: Prerelease::new("0").unwrap(),
            build: BuildMetadata::EMPTY,
        }
    }

    fn is_pre_release(&self) -> bool {
        !self.pre.is_empty()
    }

    fn core(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;
    use test_case::test_case;

    use super::VersionExt;

    #[test_case("1.2.3", "2.0.0")]
    #[test_case("1.0.0", "2.0.0")]
    #[test_case("0.2.3", "0.3.0")]
    #[test_case("0.0.3", "0.0.4")]
    #[test_case("2.0.0-dev.1", "3.0.0")]
    fn next_breaking(version: &str, expected: &str) {
        let version = Version::parse(version).unwrap();
        assert_eq!(version.next_breaking(), Version::parse(expected).unwrap());
    }

    #[test]
    fn first_pre_release_sorts_before_other_pre_releases() {
        let version = Version::parse("2.0.0").unwrap();
        let first = version.first_pre_release();
        assert_eq!(first.to_string(), "2.0.0-0");
        assert!(first < Version::parse("2.0.0-alpha").unwrap());
        assert!(first < version);
    }
}
