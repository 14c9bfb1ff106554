//! The system cache: content-addressed on-disk storage of unpacked package
//! archives and their content hashes.

use std::fs::OpenOptions;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs4::FileExt;
use rand::Rng;
use semver::Version;
use tracing::trace;

use crate::core::checksum::Checksum;
use crate::core::package::{PackageId, PackageName};
use crate::core::source::{HostedDescription, SourceKind};
use crate::internal::fsx;

/// Layout under the cache root:
///
/// ```text
/// hosted/<host>/<name>-<version>/      unpacked package
/// hosted/<host>/<name>-<version>.sha256
/// git/cache/<ident>/                   bare repository clones
/// git/checkouts/<ident>/<commit>/      per-commit working trees
/// _temp/                               staging area, renamed into place
/// ```
#[derive(Debug)]
pub struct SystemCache {
    root: Utf8PathBuf,
}

impl SystemCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn hosted_package_dir(
        &self,
        hosted: &HostedDescription,
        name: &PackageName,
        version: &Version,
    ) -> Utf8PathBuf {
        self.root
            .join("hosted")
            .join(hosted.cache_ident())
            .join(format!("{name}-{version}"))
    }

    fn hosted_hash_path(
        &self,
        hosted: &HostedDescription,
        name: &PackageName,
        version: &Version,
    ) -> Utf8PathBuf {
        self.root
            .join("hosted")
            .join(hosted.cache_ident())
            .join(format!("{name}-{version}.sha256"))
    }

    /// Whether the unpacked package for `id` is present.
    pub fn contains(&self, id: &PackageId) -> bool {
        self.package_dir(id).is_some_and(|dir| dir.is_dir())
    }

    /// The cache directory for `id`, when its source kind is cached here.
    pub fn package_dir(&self, id: &PackageId) -> Option<Utf8PathBuf> {
        match id.kind() {
            SourceKind::Hosted => {
                let hosted = id.description.description();
                let hosted = hosted.as_hosted().expect("hosted id has hosted description");
                Some(self.hosted_package_dir(hosted, &id.name, &id.version))
            }
            _ => None,
        }
    }

    /// The recorded archive hash for a hosted package, if the archive has
    /// been downloaded before.
    pub fn sha256_from_cache(&self, id: &PackageId) -> Option<Checksum> {
        if id.kind() != SourceKind::Hosted {
            return None;
        }
        let description = id.description.description();
        let hosted = description.as_hosted()?;
        let path = self.hosted_hash_path(hosted, &id.name, &id.version);
        let text = std::fs::read_to_string(path).ok()?;
        Checksum::parse(text.trim()).ok()
    }

    pub fn record_sha256(&self, id: &PackageId, checksum: &Checksum) -> Result<()> {
        let description = id.description.description();
        let hosted = description
            .as_hosted()
            .context("only hosted packages carry archive hashes")?;
        let path = self.hosted_hash_path(hosted, &id.name, &id.version);
        fsx::write_atomic(path, format!("{checksum}\n"))
    }

    /// A scratch path under the cache root, on the same filesystem as the
    /// final location so renames stay atomic.
    pub fn scratch_path(&self, prefix: &str) -> Result<Utf8PathBuf> {
        let temp_dir = self.root.join("_temp");
        fsx::create_dir_all(&temp_dir)?;
        let nonce: u64 = rand::thread_rng().r#gen();
        Ok(temp_dir.join(format!("{prefix}-{nonce:016x}")))
    }

    /// Moves a fully staged directory into its final cache location.
    /// An existing directory is replaced.
    pub fn commit_staged(&self, staged: &Utf8Path, target: &Utf8Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fsx::create_dir_all(parent)?;
        }
        if target.exists() {
            fsx::remove_dir_all(target)?;
        }
        fsx::rename(staged, target)?;
        trace!(target = %target, "committed cache entry");
        Ok(())
    }

    /// Takes the cross-process download lock for `key`, so concurrent
    /// invocations do not race on the same cache entry.
    pub fn lock_download(&self, key: &str) -> Result<DownloadLock> {
        let locks_dir = self.root.join("_locks");
        fsx::create_dir_all(&locks_dir)?;
        let path = locks_dir.join(format!("{key}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open download lock at {path}"))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to take download lock at {path}"))?;
        Ok(DownloadLock { _file: file })
    }

    pub fn git_db_dir(&self, ident: &str) -> Utf8PathBuf {
        self.root.join("git").join("cache").join(ident)
    }

    pub fn git_checkout_dir(&self, ident: &str, commit: &str) -> Utf8PathBuf {
        let short = &commit[..commit.len().min(12)];
        self.root
            .join("git")
            .join("checkouts")
            .join(ident)
            .join(short)
    }
}

/// Held for the duration of a download; the advisory lock is released when
/// the file handle drops.
pub struct DownloadLock {
    _file: std::fs::File,
}

#[cfg(test)]
mod tests {
    use semver::Version;
    use url::Url;

    use super::SystemCache;
    use crate::core::PackageName;
    use crate::core::package::PackageId;
    use crate::core::source::{HostedDescription, ResolvedDescription};
    use crate::internal::fsx;

    fn hosted_id(cache_url: &str, name: &str, version: &str) -> PackageId {
        PackageId::new(
            PackageName::new(name),
            Version::parse(version).unwrap(),
            ResolvedDescription::Hosted {
                description: HostedDescription::new(
                    PackageName::new(name),
                    Url::parse(cache_url).unwrap(),
                ),
                sha256: None,
            },
        )
    }

    #[test]
    fn layout_includes_host_and_port() {
        let cache = SystemCache::new("/cache");
        let id = hosted_id("http://localhost:8080", "foo", "1.2.3");
        let description = id.description.description();
        let hosted = description.as_hosted().unwrap();
        assert_eq!(
            cache
                .hosted_package_dir(hosted, &id.name, &id.version)
                .as_str(),
            "/cache/hosted/localhost%3A8080/foo-1.2.3"
        );
    }

    #[test]
    fn sha256_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SystemCache::new(dir.path().to_str().unwrap());
        let id = hosted_id("https://pub.dev", "foo", "1.2.3");

        assert!(cache.sha256_from_cache(&id).is_none());

        let checksum = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
            .parse()
            .unwrap();
        cache.record_sha256(&id, &checksum).unwrap();
        assert_eq!(cache.sha256_from_cache(&id), Some(checksum));
    }

    #[test]
    fn commit_staged_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SystemCache::new(dir.path().to_str().unwrap());
        let id = hosted_id("https://pub.dev", "foo", "1.2.3");
        let target = cache.package_dir(&id).unwrap();

        let staged = cache.scratch_path("foo").unwrap();
        fsx::create_dir_all(&staged).unwrap();
        fsx::write(staged.join("pubspec.yaml"), "name: foo\n").unwrap();
        cache.commit_staged(&staged, &target).unwrap();
        assert!(cache.contains(&id));

        let staged = cache.scratch_path("foo").unwrap();
        fsx::create_dir_all(&staged).unwrap();
        fsx::write(staged.join("pubspec.yaml"), "name: foo # v2\n").unwrap();
        cache.commit_staged(&staged, &target).unwrap();
        let content = fsx::read_to_string(target.join("pubspec.yaml")).unwrap();
        assert!(content.contains("v2"));
    }

    #[test]
    fn download_lock_is_reentrant_across_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SystemCache::new(dir.path().to_str().unwrap());
        let _a = cache.lock_download("foo-1.2.3").unwrap();
        let _b = cache.lock_download("bar-1.0.0").unwrap();
    }
}
