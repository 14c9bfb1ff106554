pub mod checksum;
pub mod config;
pub mod errors;
pub mod lockfile;
pub mod manifest;
pub mod package;
pub mod package_config;
pub mod registry;
pub mod source;

pub use checksum::{Checksum, Crc32c, Digest};
pub use config::Config;
pub use manifest::Pubspec;
pub use package::{
    DependencyKind, PackageId, PackageIdInner, PackageName, PackageRange, PackageRef,
};
pub use source::{
    Description, GitDescription, GitReference, HostedDescription, PathDescription,
    ResolvedDescription, RootDescription, SdkDescription, SourceKind,
};
