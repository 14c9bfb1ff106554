//! The path source: packages that live in a directory on disk.

use anyhow::{Result, bail};
use camino::Utf8PathBuf;
use url::Url;

use crate::core::manifest::Pubspec;
use crate::core::package::{PackageId, PackageRef};
use crate::core::source::{Description, ResolvedDescription};

pub struct PathSource {
    default_hosted_url: Url,
}

impl PathSource {
    pub fn new(default_hosted_url: Url) -> Self {
        Self { default_hosted_url }
    }

    pub fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let Description::Path(description) = &package.description else {
            bail!("not a path package: {package}");
        };
        let pubspec = Pubspec::load(&description.path, &self.default_hosted_url)?;
        if pubspec.name != package.name {
            bail!(
                "the directory {} contains package `{}`, not `{}`",
                description.path,
                pubspec.name,
                package.name
            );
        }
        Ok(vec![PackageId::new(
            package.name.clone(),
            pubspec.version_or_default(),
            ResolvedDescription::Path(description.clone()),
        )])
    }

    pub fn describe(&self, id: &PackageId) -> Result<Pubspec> {
        let ResolvedDescription::Path(description) = &id.description else {
            bail!("not a path package: {id}");
        };
        Pubspec::load(&description.path, &self.default_hosted_url)
    }

    /// Path packages are used in place; nothing to fetch.
    pub fn download(&self, id: &PackageId) -> Result<Utf8PathBuf> {
        let ResolvedDescription::Path(description) = &id.description else {
            bail!("not a path package: {id}");
        };
        Ok(description.path.clone())
    }
}
