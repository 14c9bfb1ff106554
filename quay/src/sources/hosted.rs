//! The hosted source: packages served by a pub-protocol repository over
//! HTTP as tar.gz archives.

use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use semver::Version;
use serde::Deserialize;
use url::Url;

use crate::cache::SystemCache;
use crate::core::checksum::{Checksum, Digest};
use crate::core::errors::{DataError, FetchError, FetchErrorKind, FetchErrorWithResponse};
use crate::core::manifest::Pubspec;
use crate::core::package::{PackageId, PackageName, PackageRef};
use crate::core::source::{Description, ResolvedDescription};
use crate::http::{FetchRequest, HttpClient};
use crate::internal::fsx;
use crate::internal::single_flight::SingleFlightCache;

type ListingKey = (PackageName, Url);
type ListingCache<'c> = SingleFlightCache<'c, ListingKey, Listing, &'c HttpClient>;

/// One repository's version listing for a single package, as returned by
/// `GET /api/packages/<name>`. A package the repository has never heard of
/// is remembered as such, so the solver can report it as missing rather
/// than failing outright.
#[derive(Clone)]
pub enum Listing {
    Found(Rc<Vec<ListingVersion>>),
    NotFound,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListingVersion {
    pub version: Version,
    pub archive_url: String,
    #[serde(default)]
    pub archive_sha256: Option<Checksum>,
    #[serde(default)]
    pub retracted: bool,
    pub pubspec: serde_json::Value,
}

#[derive(Deserialize)]
struct ListingDocument {
    versions: Vec<ListingVersion>,
}

impl Listing {
    fn found(&self, package: &PackageName, repository: &Url) -> Result<&[ListingVersion]> {
        match self {
            Listing::Found(versions) => Ok(versions.as_slice()),
            Listing::NotFound => Err(DataError(format!(
                "package {package} does not exist on {repository}"
            ))
            .into()),
        }
    }

    fn entry<'l>(
        &'l self,
        package: &PackageName,
        repository: &Url,
        version: &Version,
    ) -> Result<&'l ListingVersion> {
        self.found(package, repository)?
            .iter()
            .find(|entry| entry.version == *version)
            .ok_or_else(|| anyhow!("{repository} no longer lists {package} {version}"))
    }
}

#[derive(Clone)]
struct DownloadContext<'c> {
    cache: &'c SystemCache,
    http: &'c HttpClient,
    listings: Rc<ListingCache<'c>>,
}

pub struct HostedSource<'c> {
    cache: &'c SystemCache,
    http: &'c HttpClient,
    listings: Rc<ListingCache<'c>>,
    downloads: SingleFlightCache<'c, PackageId, Utf8PathBuf, DownloadContext<'c>>,
}

impl<'c> HostedSource<'c> {
    pub fn new(cache: &'c SystemCache, http: &'c HttpClient) -> Self {
        let listings = Rc::new(SingleFlightCache::new(
            http,
            |key: ListingKey, http: &'c HttpClient| {
                async move { fetch_listing(http, key).await.map_err(Arc::new) }.boxed_local()
            },
        ));
        let downloads = SingleFlightCache::new(
            DownloadContext {
                cache,
                http,
                listings: listings.clone(),
            },
            |id: PackageId, ctx: DownloadContext<'c>| {
                async move { download_archive(ctx, id).await.map_err(Arc::new) }.boxed_local()
            },
        );
        Self {
            cache,
            http,
            listings,
            downloads,
        }
    }

    pub async fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let Description::Hosted(hosted) = &package.description else {
            bail!("not a hosted package: {package}");
        };
        let listing = self
            .listings
            .load((hosted.name.clone(), hosted.url.clone()))
            .await
            .with_context(|| format!("failed to list versions of {package}"))?;
        Ok(listing
            .found(&package.name, &hosted.url)?
            .iter()
            .filter(|entry| !entry.retracted)
            .map(|entry| {
                PackageId::new(
                    package.name.clone(),
                    entry.version.clone(),
                    ResolvedDescription::Hosted {
                        description: hosted.clone(),
                        sha256: entry.archive_sha256,
                    },
                )
            })
            .collect())
    }

    pub async fn describe(&self, id: &PackageId) -> Result<Pubspec> {
        let description = id.description.description();
        let hosted = description
            .as_hosted()
            .ok_or_else(|| anyhow!("not a hosted package: {id}"))?;
        let listing = self
            .listings
            .load((hosted.name.clone(), hosted.url.clone()))
            .await?;
        let entry = listing.entry(&id.name, &hosted.url, &id.version)?;
        let text = serde_json::to_string(&entry.pubspec)?;
        // YAML is a superset of JSON, so the embedded pubspec object parses
        // with the regular manifest parser.
        Pubspec::parse(
            &text,
            &format!("pubspec of {id}"),
            None,
            &self.http.config().hosted_url,
        )
    }

    /// Downloads and unpacks the archive, returning the cache directory.
    /// Concurrent calls for the same id share one download.
    pub async fn download(&self, id: &PackageId) -> Result<Utf8PathBuf> {
        self.downloads.load(id.clone()).await
    }

    /// Downloads the archive and returns the id with the archive hash
    /// learned from the bytes themselves.
    pub async fn download_package(&self, id: &PackageId) -> Result<PackageId> {
        self.download(id).await?;
        match self.cache.sha256_from_cache(id) {
            Some(checksum) => Ok(id.with_sha256(checksum)),
            None => Ok(id.clone()),
        }
    }

    /// All package names the repository advertises.
    pub async fn package_names(&self, repository: &Url) -> Result<Vec<PackageName>> {
        #[derive(Deserialize)]
        struct Names {
            packages: Vec<PackageName>,
        }
        let mut url = api_url(repository, &["api", "packages"])?;
        url.set_query(Some("compact=1"));
        let names: Names = self.http.get_json(FetchRequest::get(url).pub_api()).await?;
        Ok(names.packages)
    }
}

fn api_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("invalid hosted repository URL: {base}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn fetch_listing(http: &HttpClient, (name, repository): ListingKey) -> Result<Listing> {
    let url = api_url(&repository, &["api", "packages", name.as_str()])?;
    match http
        .get_json::<ListingDocument>(FetchRequest::get(url).pub_api())
        .await
    {
        Ok(document) => Ok(Listing::Found(Rc::new(document.versions))),
        Err(err)
            if err
                .downcast_ref::<FetchErrorWithResponse>()
                .is_some_and(|response| response.status == 404) =>
        {
            Ok(Listing::NotFound)
        }
        Err(err) => Err(err).with_context(|| {
            format!("failed to fetch version listing for {name} from {repository}")
        }),
    }
}

async fn download_archive(ctx: DownloadContext<'_>, id: PackageId) -> Result<Utf8PathBuf> {
    let description = id.description.description();
    let hosted = description
        .as_hosted()
        .ok_or_else(|| anyhow!("not a hosted package: {id}"))?
        .clone();
    let target = ctx.cache.hosted_package_dir(&hosted, &id.name, &id.version);
    if target.is_dir() && ctx.cache.sha256_from_cache(&id).is_some() {
        return Ok(target);
    }

    let listing = ctx
        .listings
        .load((hosted.name.clone(), hosted.url.clone()))
        .await?;
    let entry = listing.entry(&id.name, &hosted.url, &id.version)?;
    let archive_url = match Url::parse(&entry.archive_url) {
        Ok(url) => url,
        Err(_) => hosted.url.join(&entry.archive_url)?,
    };
    let expected = entry.archive_sha256;

    let cache = ctx.cache;
    let request_url = archive_url.clone();
    let (archive_path, checksum) = ctx
        .http
        .fetch(FetchRequest::get(archive_url), move |_head, mut body| {
            let url = request_url.clone();
            async move {
                let path = cache.scratch_path("archive")?;
                let mut file = std::fs::File::create(&path)
                    .with_context(|| format!("failed to create scratch file at {path}"))?;
                let mut digest = Digest::new();
                while let Some(chunk) = body.next_chunk().await? {
                    digest.update(&chunk);
                    file.write_all(&chunk)
                        .context("failed to save archive chunk on disk")?;
                }
                let checksum = digest.finish();
                if let Some(expected) = expected {
                    if expected != checksum {
                        // The server advertised different bytes; retry in
                        // case a mirror or proxy served a stale archive.
                        return Err(FetchError::new(url, FetchErrorKind::ChecksumMismatch)
                            .with_cause(anyhow!(
                                "expected sha256 {expected}, computed {checksum}"
                            ))
                            .into());
                    }
                }
                Ok((path, checksum))
            }
        })
        .await
        .with_context(|| format!("failed to download {id}"))?;

    let lock_key = format!("hosted-{}-{}-{}", hosted.cache_ident(), id.name, id.version);
    let _lock = cache.lock_download(&lock_key)?;
    if !(target.is_dir() && cache.sha256_from_cache(&id).is_some()) {
        let staging = cache.scratch_path("unpack")?;
        extract_tar_gz(&archive_path, &staging)
            .with_context(|| format!("failed to extract archive of {id}"))?;
        cache.commit_staged(&staging, &target)?;
        cache.record_sha256(&id, &checksum)?;
    }
    let _ = std::fs::remove_file(&archive_path);

    Ok(target)
}

fn extract_tar_gz(archive: &Utf8Path, target: &Utf8Path) -> Result<()> {
    fsx::create_dir_all(target)?;
    let file = std::fs::File::open(archive)
        .with_context(|| format!("failed to open archive at {archive}"))?;
    let mut tarball = tar::Archive::new(flate2::read::GzDecoder::new(file));
    tarball
        .unpack(target)
        .with_context(|| format!("failed to unpack archive into {target}"))?;
    Ok(())
}
