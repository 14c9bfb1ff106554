use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;
use semver::Version;
use smol_str::SmolStr;
use tracing::{debug, info};
use url::Url;

use crate::cache::SystemCache;
use crate::core::Config;
use crate::core::errors::{DataError, ResolutionFailure};
use crate::core::lockfile::LockFile;
use crate::core::manifest::Pubspec;
use crate::core::package_config::{PackageConfig, PackageConfigEntry};
use crate::http::HttpClient;
use crate::internal::fsx;
use crate::ops::lockfile::{read_lockfile, write_lockfile};
use crate::resolver::{SolveFailure, SolveResult, SolveType, resolve};
use crate::sources::SourceRegistry;
use crate::{MANIFEST_FILE_NAME, PACKAGE_CONFIG_DIR_NAME, PACKAGE_CONFIG_FILE_NAME};

#[derive(Debug)]
pub enum EnsureOutcome {
    /// The lock file already matches the manifest; nothing was touched.
    UpToDate,
    /// A fresh resolution was computed and persisted.
    Resolved { packages: usize, attempted: u64 },
}

/// Brings a project directory to a consistent state: when the lock file is
/// missing or stale, resolves the manifest with [`SolveType::Get`], fetches
/// the selected archives, and persists the lock file plus the generated
/// package-configuration file.
pub async fn ensure_up_to_date(
    root_dir: &Utf8Path,
    config: &Config,
    cache: &SystemCache,
    http: &HttpClient,
) -> Result<EnsureOutcome> {
    if !root_dir.join(MANIFEST_FILE_NAME).is_file() {
        return Err(DataError(format!(
            "could not find a {MANIFEST_FILE_NAME} in {root_dir}"
        ))
        .into());
    }
    let root = Pubspec::load(root_dir, &config.hosted_url)?;
    let lock = read_lockfile(root_dir)?;
    let sdk_versions = sdk_versions(config);

    if lock_is_fresh(root_dir, &root, &lock, &sdk_versions) {
        debug!("lock file is up to date");
        return Ok(EnsureOutcome::UpToDate);
    }

    let registry = SourceRegistry::new(config, cache, http);
    let result = resolve(
        SolveType::Get,
        &registry,
        &root,
        root_dir,
        &lock,
        &[],
        &[],
        &sdk_versions,
    )
    .await
    .map_err(|err| match err.downcast::<SolveFailure>() {
        Ok(failure) => ResolutionFailure {
            explanation: failure.to_string(),
        }
        .into(),
        Err(other) => other,
    })?;

    // Fetch every archive up front; the ids come back with the hash
    // learned from the downloaded bytes, which the lock file pins.
    let downloads = result
        .packages
        .iter()
        .map(|id| registry.download_with_hash(id));
    let downloaded = futures::future::try_join_all(downloads).await?;

    let new_lock = LockFile::from_resolution(
        &root,
        result
            .packages
            .iter()
            .zip(&downloaded)
            .map(|(selected, downloaded)| {
                let pubspec = result
                    .pubspecs
                    .get(selected)
                    .expect("every selected package has a pubspec");
                (downloaded, pubspec)
            }),
    );
    write_lockfile(root_dir, &new_lock, cache)?;
    write_package_config(root_dir, &root, &registry, &result).await?;

    info!(
        packages = result.packages.len(),
        attempted = result.attempted_solutions,
        duration_ms = result.duration.as_millis() as u64,
        "resolved dependencies",
    );
    Ok(EnsureOutcome::Resolved {
        packages: result.packages.len(),
        attempted: result.attempted_solutions,
    })
}

fn sdk_versions(config: &Config) -> BTreeMap<SmolStr, Version> {
    config
        .sdks
        .iter()
        .map(|(name, info)| (name.clone(), info.version.clone()))
        .collect()
}

/// Whether the existing lock file still satisfies the manifest, making a
/// fresh resolution unnecessary.
fn lock_is_fresh(
    root_dir: &Utf8Path,
    root: &Pubspec,
    lock: &LockFile,
    sdk_versions: &BTreeMap<SmolStr, Version>,
) -> bool {
    let lock_path = root_dir.join(crate::LOCK_FILE_NAME);
    let package_config_path = root_dir
        .join(PACKAGE_CONFIG_DIR_NAME)
        .join(PACKAGE_CONFIG_FILE_NAME);
    if !lock_path.is_file() || !package_config_path.is_file() {
        return false;
    }

    // A manifest edited after the last resolution wins over the lock.
    let newer_than_lock = match (
        modified_time(&root_dir.join(MANIFEST_FILE_NAME)),
        modified_time(&lock_path),
    ) {
        (Some(pubspec), Some(lock)) => pubspec > lock,
        _ => true,
    };
    if newer_than_lock {
        return false;
    }

    lock_satisfies(root, lock, sdk_versions)
}

fn modified_time(path: &Utf8Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Whether every direct dependency of the manifest is pinned by the lock
/// file to an acceptable version, and the lock's SDK constraints still hold.
fn lock_satisfies(
    root: &Pubspec,
    lock: &LockFile,
    sdk_versions: &BTreeMap<SmolStr, Version>,
) -> bool {
    for dependency in root.root_dependencies() {
        match lock.locked(&dependency.name) {
            Some(id) if dependency.allows_id(id) => {}
            _ => return false,
        }
    }
    for (sdk, constraint) in &lock.sdks {
        if constraint.is_any() {
            continue;
        }
        match sdk_versions.get(sdk) {
            Some(version) if constraint.allows(version) => {}
            _ => return false,
        }
    }
    true
}

async fn write_package_config(
    root_dir: &Utf8Path,
    root: &Pubspec,
    registry: &SourceRegistry<'_>,
    result: &SolveResult,
) -> Result<()> {
    let mut entries = vec![PackageConfigEntry {
        name: root.name.to_string(),
        root_uri: "../".into(),
        package_uri: Some("lib/".into()),
        language_version: root.language_version(),
    }];

    for id in &result.packages {
        let Some(dir) = registry.download(id).await? else {
            continue;
        };
        let root_uri = Url::from_directory_path(dir.as_std_path())
            .map_err(|_| DataError(format!("package directory is not absolute: {dir}")))?
            .to_string();
        let language_version = result
            .pubspecs
            .get(id)
            .and_then(|pubspec| pubspec.language_version());
        entries.push(PackageConfigEntry {
            name: id.name.to_string(),
            root_uri,
            package_uri: Some("lib/".into()),
            language_version,
        });
    }

    let package_config = PackageConfig::new(entries);
    let path = root_dir
        .join(PACKAGE_CONFIG_DIR_NAME)
        .join(PACKAGE_CONFIG_FILE_NAME);
    fsx::write_atomic(
        &path,
        package_config
            .render()
            .with_context(|| format!("failed to serialize {path}"))?,
    )
}
