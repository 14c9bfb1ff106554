use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::LOCK_FILE_NAME;
use crate::cache::SystemCache;
use crate::core::lockfile::LockFile;
use crate::internal::fsx;

pub fn read_lockfile(root_dir: &Utf8Path) -> Result<LockFile> {
    LockFile::from_path(root_dir.join(LOCK_FILE_NAME))
}

/// Serializes the lock file next to the manifest, promoting archive hashes
/// from the cache and preserving the newline convention of any previous
/// file. The write is atomic.
pub fn write_lockfile(root_dir: &Utf8Path, lock: &LockFile, cache: &SystemCache) -> Result<()> {
    let path = root_dir.join(LOCK_FILE_NAME);
    let existing = if path.is_file() {
        Some(fsx::read_to_string(&path)?)
    } else {
        None
    };
    let rendered = lock
        .render_like(existing.as_deref(), Some(root_dir), |id| {
            cache.sha256_from_cache(id)
        })
        .with_context(|| format!("failed to serialize lock file for {root_dir}"))?;
    fsx::write_atomic(&path, rendered)
}
