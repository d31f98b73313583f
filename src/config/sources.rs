// src/config/sources.rs
//! Source list loading (the config store the registry reads at (re)load time).
//!
//! Accepted formats:
//! - TOML: `[[sources]]` tables
//! - JSON: an array of source objects
//! - JSON: legacy `{ "api_site": { "<key>": { "name", "api", "disabled" } } }`

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CatalogError, CatalogResult};
use crate::registry::Source;

pub const ENV_SOURCES_PATH: &str = "SOURCES_CONFIG_PATH";

/// Anything that can hand the registry a fresh source list.
pub trait SourceLoader: Send + Sync {
    fn load_sources(&self) -> CatalogResult<Vec<Source>>;
}

/// Reads the source list from a file on every call.
#[derive(Debug, Clone)]
pub struct FileSourceLoader {
    path: PathBuf,
}

impl FileSourceLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceLoader for FileSourceLoader {
    fn load_sources(&self) -> CatalogResult<Vec<Source>> {
        load_sources_from(&self.path).map_err(|e| CatalogError::Config(format!("{e:#}")))
    }
}

/// Fixed in-memory list, handy for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticSourceLoader(pub Vec<Source>);

impl SourceLoader for StaticSourceLoader {
    fn load_sources(&self) -> CatalogResult<Vec<Source>> {
        Ok(self.0.clone())
    }
}

/// Load sources from an explicit path. Format is picked by extension, then sniffed.
pub fn load_sources_from(path: &Path) -> Result<Vec<Source>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_sources(&content, ext.as_str())
}

/// Resolve the source list path:
/// 1) $SOURCES_CONFIG_PATH
/// 2) config/sources.toml
/// 3) config/sources.json
pub fn default_sources_path() -> Result<Option<PathBuf>> {
    if let Ok(p) = std::env::var(ENV_SOURCES_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(Some(pb));
        }
        return Err(anyhow!("SOURCES_CONFIG_PATH points to non-existent path"));
    }
    for candidate in ["config/sources.toml", "config/sources.json"] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return Ok(Some(pb));
        }
    }
    Ok(None)
}

pub fn parse_sources(s: &str, hint_ext: &str) -> Result<Vec<Source>> {
    let raw = if hint_ext == "toml" {
        parse_toml(s)?
    } else if hint_ext == "json" {
        parse_json(s)?
    } else {
        parse_json(s).or_else(|_| parse_toml(s))?
    };
    clean(raw)
}

#[derive(Deserialize)]
struct RawSource {
    #[serde(default)]
    key: String,
    #[serde(default)]
    name: String,
    #[serde(alias = "endpoint")]
    api: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    disabled: bool,
}

fn parse_toml(s: &str) -> Result<Vec<RawSource>> {
    #[derive(Deserialize)]
    struct TomlSources {
        sources: Vec<RawSource>,
    }
    let v: TomlSources = toml::from_str(s).context("parsing sources toml")?;
    Ok(v.sources)
}

fn parse_json(s: &str) -> Result<Vec<RawSource>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum JsonSources {
        List(Vec<RawSource>),
        Sources { sources: Vec<RawSource> },
        Legacy { api_site: BTreeMap<String, RawSource> },
    }
    let v: JsonSources = serde_json::from_str(s).context("parsing sources json")?;
    Ok(match v {
        JsonSources::List(l) | JsonSources::Sources { sources: l } => l,
        JsonSources::Legacy { api_site } => api_site
            .into_iter()
            .map(|(k, mut r)| {
                if r.key.trim().is_empty() {
                    r.key = k;
                }
                r
            })
            .collect(),
    })
}

fn clean(raw: Vec<RawSource>) -> Result<Vec<Source>> {
    let mut out = Vec::with_capacity(raw.len());
    for (i, r) in raw.into_iter().enumerate() {
        let key = r.key.trim().to_string();
        if key.is_empty() {
            return Err(anyhow!("source #{i} has no key"));
        }
        let endpoint = r.api.trim().to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("source '{key}' has no api endpoint"));
        }
        let name = match r.name.trim() {
            "" => key.clone(),
            n => n.to_string(),
        };
        out.push(Source {
            key,
            name,
            endpoint,
            headers: r.headers,
            disabled: r.disabled,
        });
    }
    Ok(out)
}
