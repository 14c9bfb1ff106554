//! The generated package-configuration document consumed by downstream
//! tooling (version 2 of the `package_config.json` format).

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(rename = "configVersion")]
    pub config_version: u32,
    pub packages: Vec<PackageConfigEntry>,
    pub generated: String,
    pub generator: String,
    #[serde(rename = "generatorVersion")]
    pub generator_version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageConfigEntry {
    pub name: String,
    #[serde(rename = "rootUri")]
    pub root_uri: String,
    #[serde(rename = "packageUri", skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    #[serde(rename = "languageVersion", skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
}

impl PackageConfig {
    pub fn new(mut packages: Vec<PackageConfigEntry>) -> Self {
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            config_version: 2,
            packages,
            generated: chrono::Utc::now().to_rfc3339(),
            generator: "quay".into(),
            generator_version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }
}
