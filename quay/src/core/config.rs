use std::collections::BTreeMap;
use std::env;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use serde::Deserialize;
use smol_str::SmolStr;
use tracing::trace;
use url::Url;

use crate::internal::fsx;
use crate::{DEFAULT_HOSTED_URL, PUB_HOSTED_URL_ENV};

/// Application-wide state threaded through every operation: where the
/// system cache lives, which repository is the default hosted source, which
/// SDKs are installed, and which credentials we may attach.
#[derive(Debug)]
pub struct Config {
    pub cache_root: Utf8PathBuf,
    pub hosted_url: Url,
    pub sdks: BTreeMap<SmolStr, SdkInfo>,
    pub tokens: TokenStore,
}

#[derive(Clone, Debug)]
pub struct SdkInfo {
    pub version: Version,
    /// Directory holding the packages vendored with this SDK, when any.
    pub packages_root: Option<Utf8PathBuf>,
}

impl Config {
    pub fn init(cache_root: Utf8PathBuf) -> Result<Self> {
        let hosted_url = match env::var(PUB_HOSTED_URL_ENV) {
            Ok(url) => Url::parse(&url)
                .with_context(|| format!("invalid ${PUB_HOSTED_URL_ENV}: {url}"))?,
            Err(_) => Url::parse(DEFAULT_HOSTED_URL).unwrap(),
        };
        trace!(cache_root = %cache_root, hosted_url = %hosted_url);
        Ok(Self {
            cache_root,
            hosted_url,
            sdks: BTreeMap::new(),
            tokens: TokenStore::default(),
        })
    }

    pub fn with_sdk(mut self, name: impl AsRef<str>, info: SdkInfo) -> Self {
        self.sdks.insert(SmolStr::new(name), info);
        self
    }

    pub fn sdk_version(&self, sdk: &str) -> Option<&Version> {
        self.sdks.get(sdk).map(|info| &info.version)
    }
}

/// Credentials for hosted repositories, read from the token store file.
/// The file itself is managed by an external collaborator; we only consume
/// it.
#[derive(Debug, Default)]
pub struct TokenStore {
    hosted: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenStoreFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    hosted: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    url: String,
    token: String,
}

impl TokenStore {
    pub fn load(path: &Utf8Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = fsx::read_to_string(path)?;
        let file: TokenStoreFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse token store at {path}"))?;
        Ok(Self {
            hosted: file.hosted,
        })
    }

    /// The bearer token recorded for the given hosted origin, if any.
    pub fn token_for(&self, url: &Url) -> Option<&str> {
        self.hosted
            .iter()
            .find(|entry| {
                Url::parse(&entry.url)
                    .map(|entry_url| entry_url.origin() == url.origin())
                    .unwrap_or(false)
            })
            .map(|entry| entry.token.as_str())
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::TokenStore;

    #[test]
    fn token_lookup_matches_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pub-tokens.json");
        std::fs::write(
            &path,
            r#"{"version": 1, "hosted": [{"url": "https://private.example.com", "token": "s3cret"}]}"#,
        )
        .unwrap();
        let store =
            TokenStore::load(camino::Utf8Path::from_path(&path).unwrap()).unwrap();

        let origin = Url::parse("https://private.example.com/api/packages/foo").unwrap();
        assert_eq!(store.token_for(&origin), Some("s3cret"));

        let other = Url::parse("https://pub.dev/api/packages/foo").unwrap();
        assert_eq!(store.token_for(&other), None);
    }

    #[test]
    fn missing_token_store_is_empty() {
        let store = TokenStore::load("/definitely/not/there/pub-tokens.json".into()).unwrap();
        assert!(store.hosted.is_empty());
    }
}
