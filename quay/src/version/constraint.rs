use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::version::VersionExt;

/// A contiguous interval of versions, with optional bounds on either side.
///
/// Pre-release versions inside the interval are special: they are only
/// matched by [`VersionRange::allows`] when the lower bound is itself a
/// pre-release of the same version core, or when
/// `always_include_pre_release` is set. Ranges produced by set operations
/// set that flag, so the exclusion only applies to ranges as users wrote
/// them.
#[derive(Clone, Debug)]
pub struct VersionRange {
    pub min: Option<Version>,
    pub include_min: bool,
    pub max: Option<Version>,
    pub include_max: bool,
    pub always_include_pre_release: bool,
}

impl VersionRange {
    pub fn new(
        min: Option<Version>,
        include_min: bool,
        max: Option<Version>,
        include_max: bool,
    ) -> Self {
        Self {
            min,
            include_min,
            max,
            include_max,
            always_include_pre_release: false,
        }
    }

    fn full() -> Self {
        Self::new(None, false, None, false)
    }

    fn exact(version: &Version) -> Self {
        Self::new(Some(version.clone()), true, Some(version.clone()), true)
    }

    pub fn is_exact(&self) -> bool {
        self.include_min
            && self.include_max
            && self.min.is_some()
            && self.min == self.max
    }

    fn is_empty(&self) -> bool {
        !bounds_nonempty(
            self.min.as_ref(),
            self.include_min,
            self.max.as_ref(),
            self.include_max,
        )
    }

    pub fn allows(&self, version: &Version) -> bool {
        if let Some(min) = &self.min {
            match version.cmp(min) {
                Ordering::Less => return false,
                Ordering::Equal if !self.include_min => return false,
                _ => {}
            }
        }
        if let Some(max) = &self.max {
            match version.cmp(max) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.include_max => return false,
                _ => {}
            }
        }
        if version.is_pre_release() && !self.always_include_pre_release {
            let exempt = self
                .min
                .as_ref()
                .is_some_and(|min| min.is_pre_release() && min.core() == version.core());
            if !exempt {
                return false;
            }
        }
        true
    }

    fn intersect(&self, other: &Self) -> Option<Self> {
        let (min, include_min) = match cmp_lower(
            self.min.as_ref(),
            self.include_min,
            other.min.as_ref(),
            other.include_min,
        ) {
            Ordering::Less => (other.min.clone(), other.include_min),
            _ => (self.min.clone(), self.include_min),
        };
        let (max, include_max) = match cmp_upper(
            self.max.as_ref(),
            self.include_max,
            other.max.as_ref(),
            other.include_max,
        ) {
            Ordering::Greater => (other.max.clone(), other.include_max),
            _ => (self.max.clone(), self.include_max),
        };
        if !bounds_nonempty(min.as_ref(), include_min, max.as_ref(), include_max) {
            return None;
        }
        Some(Self {
            min,
            include_min,
            max,
            include_max,
            always_include_pre_release: true,
        })
    }

    /// Whether `self` and `other` overlap, or sit flush next to each other
    /// so that their union is still one contiguous range.
    fn touches(&self, other: &Self) -> bool {
        let (left, right) =
            if cmp_lower(
                self.min.as_ref(),
                self.include_min,
                other.min.as_ref(),
                other.include_min,
            ) != Ordering::Greater
            {
                (self, other)
            } else {
                (other, self)
            };
        match (&left.max, &right.min) {
            (None, _) | (_, None) => true,
            (Some(max), Some(min)) => match max.cmp(min) {
                Ordering::Greater => true,
                Ordering::Equal => left.include_max || right.include_min,
                Ordering::Less => false,
            },
        }
    }

    fn merge(&self, other: &Self) -> Self {
        let (min, include_min) = match cmp_lower(
            self.min.as_ref(),
            self.include_min,
            other.min.as_ref(),
            other.include_min,
        ) {
            Ordering::Greater => (other.min.clone(), other.include_min),
            _ => (self.min.clone(), self.include_min),
        };
        let (max, include_max) = match cmp_upper(
            self.max.as_ref(),
            self.include_max,
            other.max.as_ref(),
            other.include_max,
        ) {
            Ordering::Less => (other.max.clone(), other.include_max),
            _ => (self.max.clone(), self.include_max),
        };
        Self {
            min,
            include_min,
            max,
            include_max,
            always_include_pre_release: self.always_include_pre_release
                || other.always_include_pre_release,
        }
    }
}

// The pre-release flag is a matching detail, not part of range identity.
impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.min == other.min
            && self.include_min == other.include_min
            && self.max == other.max
            && self.include_max == other.include_max
    }
}

impl Eq for VersionRange {}

impl Hash for VersionRange {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.min.hash(state);
        self.include_min.hash(state);
        self.max.hash(state);
        self.include_max.hash(state);
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_exact() {
            return write!(f, "{}", self.min.as_ref().unwrap());
        }
        let mut wrote = false;
        if let Some(min) = &self.min {
            write!(f, "{}{min}", if self.include_min { ">=" } else { ">" })?;
            wrote = true;
        }
        if let Some(max) = &self.max {
            if wrote {
                f.write_str(" ")?;
            }
            write!(f, "{}{max}", if self.include_max { "<=" } else { "<" })?;
            wrote = true;
        }
        if !wrote {
            f.write_str("any")?;
        }
        Ok(())
    }
}

/// Compare two lower bounds. `None` is negative infinity; at equal versions
/// an inclusive bound lies lower than an exclusive one.
fn cmp_lower(
    a: Option<&Version>,
    a_inclusive: bool,
    b: Option<&Version>,
    b_inclusive: bool,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b).then(match (a_inclusive, b_inclusive) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => Ordering::Equal,
        }),
    }
}

/// Compare two upper bounds. `None` is positive infinity; at equal versions
/// an exclusive bound lies lower than an inclusive one.
fn cmp_upper(
    a: Option<&Version>,
    a_inclusive: bool,
    b: Option<&Version>,
    b_inclusive: bool,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b).then(match (a_inclusive, b_inclusive) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => Ordering::Equal,
        }),
    }
}

fn bounds_nonempty(
    min: Option<&Version>,
    include_min: bool,
    max: Option<&Version>,
    include_max: bool,
) -> bool {
    match (min, max) {
        (Some(min), Some(max)) => match min.cmp(max) {
            Ordering::Less => true,
            Ordering::Equal => include_min && include_max,
            Ordering::Greater => false,
        },
        _ => true,
    }
}

/// A set of versions: a union of disjoint [`VersionRange`]s, kept sorted
/// and merged. The empty union allows nothing; a single unbounded range
/// allows everything.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VersionConstraint {
    ranges: Vec<VersionRange>,
}

impl VersionConstraint {
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn any() -> Self {
        Self {
            ranges: vec![VersionRange::full()],
        }
    }

    pub fn exact(version: &Version) -> Self {
        Self {
            ranges: vec![VersionRange::exact(version)],
        }
    }

    /// All versions backwards compatible with `version`:
    /// `[version, version.next_breaking().first_pre_release())`.
    pub fn compatible_with(version: &Version) -> Self {
        Self::from_range(VersionRange::new(
            Some(version.clone()),
            true,
            Some(version.next_breaking().first_pre_release()),
            false,
        ))
    }

    pub fn from_range(range: VersionRange) -> Self {
        if range.is_empty() {
            Self::empty()
        } else {
            Self {
                ranges: vec![range],
            }
        }
    }

    fn normalize(mut ranges: Vec<VersionRange>) -> Self {
        ranges.retain(|r| !r.is_empty());
        ranges.sort_by(|a, b| {
            cmp_lower(
                a.min.as_ref(),
                a.include_min,
                b.min.as_ref(),
                b.include_min,
            )
        });
        let mut merged: Vec<VersionRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.touches(&range) => *last = last.merge(&range),
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_any(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].min.is_none() && self.ranges[0].max.is_none()
    }

    pub fn ranges(&self) -> &[VersionRange] {
        &self.ranges
    }

    pub fn as_single_range(&self) -> Option<&VersionRange> {
        match self.ranges.as_slice() {
            [range] => Some(range),
            _ => None,
        }
    }

    /// The single version matched by this constraint, if it is exact.
    pub fn as_exact(&self) -> Option<&Version> {
        self.as_single_range()
            .filter(|r| r.is_exact())
            .and_then(|r| r.min.as_ref())
    }

    pub fn allows(&self, version: &Version) -> bool {
        self.ranges.iter().any(|range| range.allows(version))
    }

    /// Whether every version matched by `other` is matched by `self`.
    pub fn allows_all(&self, other: &Self) -> bool {
        other.difference(self).is_empty()
    }

    /// Whether `self` and `other` share at least one version.
    pub fn allows_any(&self, other: &Self) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut ranges = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                if let Some(overlap) = a.intersect(b) {
                    ranges.push(overlap);
                }
            }
        }
        Self::normalize(ranges)
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().cloned());
        Self::normalize(ranges)
    }

    pub fn difference(&self, other: &Self) -> Self {
        self.intersect(&other.complement())
    }

    /// Every version not matched by `self`.
    pub fn complement(&self) -> Self {
        let mut gaps = Vec::new();
        let mut cursor: Option<(Version, bool)> = None;
        let mut open_ended = false;
        for range in &self.ranges {
            if let Some(min) = &range.min {
                let (gap_min, gap_include_min) = match cursor.take() {
                    Some((v, inclusive)) => (Some(v), inclusive),
                    None => (None, false),
                };
                let gap = VersionRange {
                    min: gap_min,
                    include_min: gap_include_min,
                    max: Some(min.clone()),
                    include_max: !range.include_min,
                    always_include_pre_release: true,
                };
                if !gap.is_empty() {
                    gaps.push(gap);
                }
            }
            match &range.max {
                Some(max) => cursor = Some((max.clone(), !range.include_max)),
                None => {
                    open_ended = true;
                    break;
                }
            }
        }
        if !open_ended {
            let (gap_min, gap_include_min) = match cursor {
                Some((v, inclusive)) => (Some(v), inclusive),
                None => (None, false),
            };
            gaps.push(VersionRange {
                min: gap_min,
                include_min: gap_include_min,
                max: None,
                include_max: false,
                always_include_pre_release: true,
            });
        }
        Self::normalize(gaps)
    }

    pub fn parse(text: &str) -> Result<Self> {
        return inner(text).with_context(|| format!("cannot parse version constraint: `{text}`"));

        fn inner(text: &str) -> Result<VersionConstraint> {
            let text = text.trim();
            if text == "any" {
                return Ok(VersionConstraint::any());
            }
            if let Some(rest) = text.strip_prefix('^') {
                let version = Version::parse(rest.trim())?;
                return Ok(VersionConstraint::compatible_with(&version));
            }

            let mut constraint = VersionConstraint::any();
            for word in text.split_whitespace() {
                let range = if let Some(rest) = word.strip_prefix(">=") {
                    VersionRange::new(Some(Version::parse(rest)?), true, None, false)
                } else if let Some(rest) = word.strip_prefix('>') {
                    VersionRange::new(Some(Version::parse(rest)?), false, None, false)
                } else if let Some(rest) = word.strip_prefix("<=") {
                    VersionRange::new(None, false, Some(Version::parse(rest)?), true)
                } else if let Some(rest) = word.strip_prefix('<') {
                    VersionRange::new(None, false, Some(Version::parse(rest)?), false)
                } else {
                    let rest = word.strip_prefix('=').unwrap_or(word);
                    VersionRange::exact(&Version::parse(rest)?)
                };
                constraint = constraint.intersect(&VersionConstraint::from_range(range));
            }
            if constraint.is_any() {
                bail!("expected a version constraint");
            }
            // Constraints as written exclude pre-releases unless a bound
            // opts in; set operations above marked the ranges otherwise.
            for range in &mut constraint.ranges {
                range.always_include_pre_release = false;
            }
            Ok(constraint)
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        if self.is_any() {
            return f.write_str("any");
        }
        let mut first = true;
        for range in &self.ranges {
            if !first {
                f.write_str(" or ")?;
            }
            write!(f, "{range}")?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionConstraint({self})")
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let string = String::deserialize(d)?;
        VersionConstraint::parse(&string).map_err(Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;
    use test_case::test_case;

    use super::VersionConstraint;
    use crate::version::VersionExt;

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    fn c(text: &str) -> VersionConstraint {
        VersionConstraint::parse(text).unwrap()
    }

    #[test_case("any", "any")]
    #[test_case("^1.2.3", ">=1.2.3 <2.0.0-0")]
    #[test_case("^0.2.3", ">=0.2.3 <0.3.0-0")]
    #[test_case(">=1.0.0 <2.0.0", ">=1.0.0 <2.0.0")]
    #[test_case("1.2.3", "1.2.3" ; "bare_exact")]
    #[test_case("=1.2.3", "1.2.3" ; "explicit_exact")]
    #[test_case(">1.0.0", ">1.0.0")]
    #[test_case("<=3.0.0", "<=3.0.0")]
    fn parse_display(input: &str, expected: &str) {
        assert_eq!(c(input).to_string(), expected);
    }

    #[test_case("")]
    #[test_case("nonsense")]
    #[test_case("^x.y.z")]
    fn parse_errors(input: &str) {
        assert!(VersionConstraint::parse(input).is_err());
    }

    #[test]
    fn compatible_with_allows_self_but_not_next_breaking() {
        for version in ["1.2.3", "0.4.2", "0.0.7", "2.0.0"] {
            let version = v(version);
            let compatible = VersionConstraint::compatible_with(&version);
            assert!(compatible.allows(&version), "{version}");
            assert!(
                !compatible.allows(&version.next_breaking()),
                "{version}"
            );
        }
    }

    #[test]
    fn pre_releases_are_excluded_by_default() {
        let caret = c("^1.2.0");
        assert!(caret.allows(&v("1.2.1")));
        assert!(!caret.allows(&v("1.5.0-beta")));
        assert!(!caret.allows(&v("2.0.0-pre")));
    }

    #[test]
    fn pre_release_lower_bound_admits_same_core_pre_releases() {
        let constraint = c(">=1.0.0-alpha <2.0.0");
        assert!(constraint.allows(&v("1.0.0-beta")));
        assert!(constraint.allows(&v("1.0.0")));
        assert!(!constraint.allows(&v("1.5.0-beta")));
    }

    #[test]
    fn intersect_bounds() {
        let a = c(">=1.0.0 <3.0.0");
        let b = c(">=2.0.0 <4.0.0");
        assert_eq!(a.intersect(&b).to_string(), ">=2.0.0 <3.0.0");
        assert!(a.intersect(&c(">=3.0.0")).is_empty());
    }

    #[test]
    fn union_merges_touching_ranges() {
        let a = c(">=1.0.0 <2.0.0");
        let b = c(">=2.0.0 <3.0.0");
        assert_eq!(a.union(&b).to_string(), ">=1.0.0 <3.0.0");

        let disjoint = a.union(&c(">=4.0.0"));
        assert_eq!(disjoint.to_string(), ">=1.0.0 <2.0.0 or >=4.0.0");
    }

    #[test]
    fn difference_punches_holes() {
        let a = c(">=1.0.0 <3.0.0");
        let hole = VersionConstraint::exact(&v("2.0.0"));
        let result = a.difference(&hole);
        assert!(!result.allows(&v("2.0.0")));
        assert!(result.allows(&v("1.5.0")));
        assert!(result.allows(&v("2.0.1")));
    }

    #[test]
    fn intersect_with_difference_of_version_never_allows_it() {
        for constraint in ["any", "^1.0.0", ">=1.0.0 <3.0.0"] {
            let constraint = c(constraint);
            let version = v("1.2.3");
            let diff = constraint.difference(&VersionConstraint::exact(&version));
            assert!(
                !constraint.intersect(&diff).allows(&version),
                "{constraint}"
            );
        }
    }

    #[test]
    fn allows_all_and_allows_any() {
        let outer = c(">=1.0.0 <4.0.0");
        let inner = c(">=2.0.0 <3.0.0");
        assert!(outer.allows_all(&inner));
        assert!(!inner.allows_all(&outer));
        assert!(outer.allows_any(&inner));
        assert!(!inner.allows_any(&c(">=3.0.0")));
    }

    #[test]
    fn complement_round_trip() {
        let constraint = c(">=1.0.0 <2.0.0");
        let complement = constraint.complement();
        assert!(complement.allows(&v("0.5.0")));
        assert!(complement.allows(&v("2.0.0")));
        assert!(!complement.allows(&v("1.5.0")));
        assert_eq!(complement.complement(), constraint);
    }

    #[test]
    fn empty_and_any() {
        assert!(VersionConstraint::empty().is_empty());
        assert!(VersionConstraint::any().is_any());
        assert_eq!(VersionConstraint::any().complement().to_string(), "<empty>");
        assert_eq!(VersionConstraint::empty().complement().to_string(), "any");
    }
}
