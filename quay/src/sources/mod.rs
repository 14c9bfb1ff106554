//! Per-kind source drivers and the registry that dispatches between them.

use std::cell::RefCell;
use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::cache::SystemCache;
use crate::core::manifest::Pubspec;
use crate::core::package::{PackageId, PackageRef};
use crate::core::registry::Registry;
use crate::core::source::SourceKind;
use crate::core::Config;
use crate::http::HttpClient;

mod git;
mod hosted;
mod path;
mod sdk;

pub use git::GitSource;
pub use hosted::HostedSource;
pub use path::PathSource;
pub use sdk::SdkSource;

/// Dispatches registry queries and downloads to the driver for each source
/// kind, memoizing pubspec lookups.
pub struct SourceRegistry<'c> {
    hosted: HostedSource<'c>,
    git: GitSource<'c>,
    path: PathSource,
    sdk: SdkSource<'c>,
    pubspecs: RefCell<HashMap<PackageId, Pubspec>>,
}

impl<'c> SourceRegistry<'c> {
    pub fn new(config: &'c Config, cache: &'c SystemCache, http: &'c HttpClient) -> Self {
        Self {
            hosted: HostedSource::new(cache, http),
            git: GitSource::new(config, cache),
            path: PathSource::new(config.hosted_url.clone()),
            sdk: SdkSource::new(config),
            pubspecs: RefCell::new(HashMap::new()),
        }
    }

    /// Makes sure the package contents are available locally, returning the
    /// directory they live in. Root packages are already on disk and yield
    /// `None`.
    pub async fn download(&self, id: &PackageId) -> Result<Option<Utf8PathBuf>> {
        match id.kind() {
            SourceKind::Hosted => Ok(Some(self.hosted.download(id).await?)),
            SourceKind::Git => Ok(Some(self.git.download(id)?)),
            SourceKind::Path => Ok(Some(self.path.download(id)?)),
            SourceKind::Sdk => Ok(Some(self.sdk.download(id)?)),
            SourceKind::Root => Ok(None),
        }
    }

    /// Downloads a hosted archive and returns the id with the archive hash
    /// attached.
    pub async fn download_with_hash(&self, id: &PackageId) -> Result<PackageId> {
        match id.kind() {
            SourceKind::Hosted => self.hosted.download_package(id).await,
            _ => {
                self.download(id).await?;
                Ok(id.clone())
            }
        }
    }
}

#[async_trait(?Send)]
impl<'c> Registry for SourceRegistry<'c> {
    async fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        match package.kind() {
            SourceKind::Hosted => self.hosted.list_versions(package).await,
            SourceKind::Git => self.git.list_versions(package),
            SourceKind::Path => self.path.list_versions(package),
            SourceKind::Sdk => self.sdk.list_versions(package),
            SourceKind::Root => bail!("the root package is not served by any source"),
        }
    }

    async fn describe(&self, id: &PackageId) -> Result<Pubspec> {
        if let Some(pubspec) = self.pubspecs.borrow().get(id) {
            return Ok(pubspec.clone());
        }
        let pubspec = match id.kind() {
            SourceKind::Hosted => self.hosted.describe(id).await?,
            SourceKind::Git => self.git.describe(id)?,
            SourceKind::Path => self.path.describe(id)?,
            SourceKind::Sdk => self.sdk.describe(id)?,
            SourceKind::Root => bail!("the root package is not served by any source"),
        };
        self.pubspecs
            .borrow_mut()
            .insert(id.clone(), pubspec.clone());
        Ok(pubspec)
    }
}
