//! CLI-level configuration file: the [`cloud_core::config::EngineConfig`]
//! plus the process-config image catalogue and the traefik web entrypoints,
//! loaded from a single TOML file.

use std::path::Path;

use anyhow::{Context, Result};
use cloud_core::catalogue::ImageCatalogue;
use cloud_core::config::EngineConfig;
use cloud_core::model::{Image, InstanceKind};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CatalogueEntry {
    kind: InstanceKind,
    #[serde(flatten)]
    image: Image,
}

#[derive(Debug, Deserialize)]
struct RawFileConfig {
    engine: EngineConfig,
    #[serde(default)]
    images: Vec<CatalogueEntry>,
    #[serde(default = "default_web_entrypoints")]
    web_entrypoints: Vec<String>,
}

fn default_web_entrypoints() -> Vec<String> {
    vec!["web".to_string(), "websecure".to_string()]
}

pub struct CliConfig {
    pub engine: EngineConfig,
    pub catalogue: ImageCatalogue,
    pub web_entrypoints: Vec<String>,
}

pub fn load(path: &Path) -> Result<CliConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let parsed: RawFileConfig =
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;

    let mut catalogue = ImageCatalogue::new();
    for entry in parsed.images {
        catalogue.insert(entry.kind, entry.image);
    }

    Ok(CliConfig { engine: parsed.engine, catalogue, web_entrypoints: parsed.web_entrypoints })
}
