//! The SDK source: packages vendored with an installed SDK.

use anyhow::{Result, bail};
use camino::Utf8PathBuf;

use crate::core::Config;
use crate::core::errors::DataError;
use crate::core::manifest::Pubspec;
use crate::core::package::{PackageId, PackageRef};
use crate::core::source::{Description, ResolvedDescription, SdkDescription};

pub struct SdkSource<'c> {
    config: &'c Config,
}

impl<'c> SdkSource<'c> {
    pub fn new(config: &'c Config) -> Self {
        Self { config }
    }

    fn package_dir(&self, sdk: &SdkDescription, package: &PackageRef) -> Result<Utf8PathBuf> {
        let Some(info) = self.config.sdks.get(sdk.sdk.as_str()) else {
            return Err(DataError(format!(
                "{} requires the {} SDK, which is not installed",
                package.name, sdk.sdk
            ))
            .into());
        };
        let Some(packages_root) = &info.packages_root else {
            return Err(DataError(format!(
                "the {} SDK does not vendor packages, but {} expects to come from it",
                sdk.sdk, package.name
            ))
            .into());
        };
        Ok(packages_root.join(package.name.as_str()))
    }

    pub fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let Description::Sdk(sdk) = &package.description else {
            bail!("not an SDK package: {package}");
        };
        let dir = self.package_dir(sdk, package)?;
        if !dir.is_dir() {
            return Err(DataError(format!(
                "could not find package {} in the {} SDK",
                package.name, sdk.sdk
            ))
            .into());
        }
        let pubspec = Pubspec::load(&dir, &self.config.hosted_url)?;
        Ok(vec![PackageId::new(
            package.name.clone(),
            pubspec.version_or_default(),
            ResolvedDescription::Sdk(sdk.clone()),
        )])
    }

    pub fn describe(&self, id: &PackageId) -> Result<Pubspec> {
        let dir = self.download(id)?;
        Pubspec::load(&dir, &self.config.hosted_url)
    }

    pub fn download(&self, id: &PackageId) -> Result<Utf8PathBuf> {
        let ResolvedDescription::Sdk(sdk) = &id.description else {
            bail!("not an SDK package: {id}");
        };
        self.package_dir(sdk, &id.to_ref())
    }
}

#[cfg(test)]
mod tests {
    use camino::{Utf8Path, Utf8PathBuf};
    use semver::Version;

    use super::*;
    use crate::core::config::SdkInfo;
    use crate::core::{Config, PackageName};

    fn config_with_sdk(packages_root: Option<Utf8PathBuf>) -> Config {
        Config::init("/tmp/quay-cache".into()).unwrap().with_sdk(
            "flutter",
            SdkInfo {
                version: Version::new(3, 10, 0),
                packages_root,
            },
        )
    }

    #[test]
    fn lists_vendored_package() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("flutter_web")).unwrap();
        std::fs::write(
            root.join("flutter_web").join("pubspec.yaml"),
            "name: flutter_web\nversion: 0.0.0\n",
        )
        .unwrap();

        let config = config_with_sdk(Some(root.to_path_buf()));
        let source = SdkSource::new(&config);
        let package = PackageRef::new(
            PackageName::new("flutter_web"),
            Description::Sdk(SdkDescription::new("flutter")),
        );
        let versions = source.list_versions(&package).unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn unknown_sdk_is_a_data_error() {
        let config = Config::init("/tmp/quay-cache".into()).unwrap();
        let source = SdkSource::new(&config);
        let package = PackageRef::new(
            PackageName::new("flutter_web"),
            Description::Sdk(SdkDescription::new("flutter")),
        );
        let err = source.list_versions(&package).unwrap_err();
        assert!(err.is::<DataError>());
    }
}
