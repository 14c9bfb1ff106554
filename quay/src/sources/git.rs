//! The git source. Clones and fetches are delegated to the git CLI; we keep
//! one bare mirror per repository and one working tree per resolved commit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use camino::Utf8PathBuf;
use smol_str::SmolStr;

use crate::cache::SystemCache;
use crate::core::Config;
use crate::core::manifest::Pubspec;
use crate::core::package::{PackageId, PackageRef};
use crate::core::source::{Description, GitDescription, GitReference, ResolvedDescription};
use crate::internal::fsx;
use crate::process::exec;

pub struct GitSource<'c> {
    config: &'c Config,
    cache: &'c SystemCache,
    resolved_refs: RefCell<HashMap<GitDescription, SmolStr>>,
}

impl<'c> GitSource<'c> {
    pub fn new(config: &'c Config, cache: &'c SystemCache) -> Self {
        Self {
            config,
            cache,
            resolved_refs: RefCell::new(HashMap::new()),
        }
    }

    pub fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let Description::Git(description) = &package.description else {
            bail!("not a git package: {package}");
        };
        let commit = self.resolve_commit(description)?;
        let pubspec = self.load_pubspec(description, &commit)?;
        if pubspec.name != package.name {
            bail!(
                "the repository at {} contains package `{}`, not `{}`",
                description.url,
                pubspec.name,
                package.name
            );
        }
        Ok(vec![PackageId::new(
            package.name.clone(),
            pubspec.version_or_default(),
            ResolvedDescription::Git {
                description: description.clone(),
                commit,
            },
        )])
    }

    pub fn describe(&self, id: &PackageId) -> Result<Pubspec> {
        let ResolvedDescription::Git {
            description,
            commit,
        } = &id.description
        else {
            bail!("not a git package: {id}");
        };
        self.load_pubspec(description, commit)
    }

    pub fn download(&self, id: &PackageId) -> Result<Utf8PathBuf> {
        let ResolvedDescription::Git {
            description,
            commit,
        } = &id.description
        else {
            bail!("not a git package: {id}");
        };
        let checkout = self.ensure_checkout(description, commit)?;
        Ok(checkout.join(&description.path))
    }

    /// Resolves the description's reference to a concrete commit, asking
    /// the remote once per session.
    fn resolve_commit(&self, description: &GitDescription) -> Result<SmolStr> {
        if let Some(commit) = self.resolved_refs.borrow().get(description) {
            return Ok(commit.clone());
        }

        let commit = match &description.reference {
            GitReference::Rev(rev) if is_commit_hash(rev) => rev.clone(),
            reference => {
                let target = match reference {
                    GitReference::DefaultBranch => "HEAD",
                    other => other.as_ref_str(),
                };
                let output = exec(
                    Command::new("git")
                        .arg("ls-remote")
                        .arg(&description.url)
                        .arg(target),
                )
                .with_context(|| format!("failed to contact repository {}", description.url))?;
                let commit = output
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().next())
                    .ok_or_else(|| {
                        anyhow!(
                            "repository {} has no reference named `{target}`",
                            description.url
                        )
                    })?;
                SmolStr::new(commit)
            }
        };

        self.resolved_refs
            .borrow_mut()
            .insert(description.clone(), commit.clone());
        Ok(commit)
    }

    fn load_pubspec(&self, description: &GitDescription, commit: &str) -> Result<Pubspec> {
        let checkout = self.ensure_checkout(description, commit)?;
        Pubspec::load(&checkout.join(&description.path), &self.config.hosted_url)
    }

    fn ensure_checkout(&self, description: &GitDescription, commit: &str) -> Result<Utf8PathBuf> {
        let ident = repository_ident(&description.url);
        let checkout = self.cache.git_checkout_dir(&ident, commit);
        if checkout.is_dir() {
            return Ok(checkout);
        }

        let _lock = self.cache.lock_download(&format!("git-{ident}"))?;
        if checkout.is_dir() {
            return Ok(checkout);
        }

        let db = self.ensure_db(description, commit)?;

        let staging = self.cache.scratch_path("git")?;
        fsx::create_dir_all(&staging)?;
        exec(
            Command::new("git")
                .arg("clone")
                .arg("--no-checkout")
                .arg(db.as_str())
                .arg(staging.as_str()),
        )?;
        exec(
            Command::new("git")
                .arg("-C")
                .arg(staging.as_str())
                .arg("checkout")
                .arg("--quiet")
                .arg(commit),
        )
        .with_context(|| format!("failed to check out {commit} from {}", description.url))?;
        self.cache.commit_staged(&staging, &checkout)?;
        Ok(checkout)
    }

    fn ensure_db(&self, description: &GitDescription, commit: &str) -> Result<Utf8PathBuf> {
        let ident = repository_ident(&description.url);
        let db = self.cache.git_db_dir(&ident);
        if !db.is_dir() {
            if let Some(parent) = db.parent() {
                fsx::create_dir_all(parent)?;
            }
            exec(
                Command::new("git")
                    .arg("clone")
                    .arg("--mirror")
                    .arg(&description.url)
                    .arg(db.as_str()),
            )
            .with_context(|| format!("failed to clone repository {}", description.url))?;
            return Ok(db);
        }

        let present = Command::new("git")
            .arg("-C")
            .arg(db.as_str())
            .arg("cat-file")
            .arg("-e")
            .arg(format!("{commit}^{{commit}}"))
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if !present {
            exec(Command::new("git").arg("-C").arg(db.as_str()).arg("fetch"))
                .with_context(|| format!("failed to refresh repository {}", description.url))?;
        }
        Ok(db)
    }
}

fn is_commit_hash(text: &str) -> bool {
    text.len() == 40 && text.chars().all(|c| c.is_ascii_hexdigit())
}

/// Directory name for a repository inside the cache: the last path segment
/// plus a digest of the whole URL.
fn repository_ident(url: &str) -> String {
    use sha2::Digest as _;
    let stem = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(32)
        .collect();
    let digest = sha2::Sha256::digest(url.as_bytes());
    format!("{stem}-{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3])
}
