use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, bail};
use smol_str::SmolStr;
use typed_builder::TypedBuilder;

use crate::core::source::{Description, SourceKind};
use crate::version::VersionConstraint;

mod id;
mod name;

pub use id::{PackageId, PackageIdInner};
pub use name::PackageName;

/// A package name plus the source it comes from, without any version
/// information.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PackageRef {
    pub name: PackageName,
    pub description: Description,
}

impl PackageRef {
    pub fn new(name: PackageName, description: Description) -> Self {
        Self { name, description }
    }

    pub fn kind(&self) -> SourceKind {
        self.description.kind()
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        match self.kind() {
            SourceKind::Hosted | SourceKind::Root => Ok(()),
            _ => write!(f, " ({})", self.description),
        }
    }
}

/// A dependency request: a [`PackageRef`] constrained to a set of versions.
///
/// See [`PackageRangeInner`] for public fields reference.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PackageRange(Arc<PackageRangeInner>);

#[derive(TypedBuilder, Clone, Eq, PartialEq, Hash)]
#[builder(builder_type(name = PackageRangeBuilder))]
#[builder(builder_method(vis = ""))]
#[builder(build_method(into = PackageRange))]
pub struct PackageRangeInner {
    pub name: PackageName,
    pub description: Description,
    #[builder(default = VersionConstraint::any())]
    pub constraint: VersionConstraint,
    #[builder(default)]
    pub features: BTreeSet<SmolStr>,
}

impl Deref for PackageRange {
    type Target = PackageRangeInner;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

#[doc(hidden)]
impl From<PackageRangeInner> for PackageRange {
    fn from(data: PackageRangeInner) -> Self {
        Self(Arc::new(data))
    }
}

impl PackageRange {
    pub fn builder() -> PackageRangeBuilder {
        PackageRangeInner::builder()
    }

    pub fn to_ref(&self) -> PackageRef {
        PackageRef {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.description.kind()
    }

    /// The same request with a different version constraint.
    pub fn with_constraint(&self, constraint: VersionConstraint) -> Self {
        Self::builder()
            .name(self.name.clone())
            .description(self.description.clone())
            .constraint(constraint)
            .features(self.features.clone())
            .build()
    }

    /// Whether `id` satisfies this request: same name, same source, and an
    /// allowed version.
    pub fn allows_id(&self, id: &PackageId) -> bool {
        self.name == id.name
            && self.description == id.description.description()
            && self.constraint.allows(&id.version)
    }
}

impl fmt::Display for PackageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.constraint)?;
        match self.kind() {
            SourceKind::Hosted | SourceKind::Root => Ok(()),
            _ => write!(f, " ({})", self.description),
        }
    }
}

impl fmt::Debug for PackageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageRange({self})")
    }
}

/// How a locked package relates to the root package.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DependencyKind {
    DirectMain,
    DirectDev,
    DirectOverridden,
    Transitive,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::DirectMain => "direct main",
            DependencyKind::DirectDev => "direct dev",
            DependencyKind::DirectOverridden => "direct overridden",
            DependencyKind::Transitive => "transitive",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct main" => Ok(DependencyKind::DirectMain),
            "direct dev" => Ok(DependencyKind::DirectDev),
            "direct overridden" => Ok(DependencyKind::DirectOverridden),
            "transitive" => Ok(DependencyKind::Transitive),
            _ => bail!("unsupported dependency kind: {s}"),
        }
    }
}
