// src/registry.rs
//! Source registry: an immutable, ordered snapshot of configured catalog sources.
//!
//! Readers clone an `Arc` to the current snapshot and work against it for the whole
//! operation. `reload` builds a fresh snapshot and swaps the pointer under a write lock,
//! so a reader observes either the old registry or the new one, never a mix.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::sources::SourceLoader;
use crate::error::{CatalogError, CatalogResult};

/// One independently operated catalog API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub key: String,
    pub name: String,
    /// Base endpoint; operation parameters are appended as query pairs.
    #[serde(alias = "api")]
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
}

impl Source {
    pub fn new(key: &str, name: &str, endpoint: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            headers: BTreeMap::new(),
            disabled: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Frozen view of the registry at one point in time.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    sources: Vec<Arc<Source>>,
    index: HashMap<String, usize>,
}

impl RegistrySnapshot {
    fn build(sources: Vec<Source>) -> CatalogResult<Self> {
        let mut index = HashMap::with_capacity(sources.len());
        let mut out = Vec::with_capacity(sources.len());
        for (pos, src) in sources.into_iter().enumerate() {
            if src.key.trim().is_empty() {
                return Err(CatalogError::Config(format!(
                    "source #{pos} has an empty key"
                )));
            }
            if index.insert(src.key.clone(), pos).is_some() {
                return Err(CatalogError::Config(format!(
                    "duplicate source key '{}'",
                    src.key
                )));
            }
            out.push(Arc::new(src));
        }
        Ok(Self {
            sources: out,
            index,
        })
    }

    /// All sources in configuration order.
    pub fn list(&self) -> &[Arc<Source>] {
        &self.sources
    }

    pub fn get(&self, key: &str) -> CatalogResult<Arc<Source>> {
        self.index
            .get(key)
            .map(|&i| Arc::clone(&self.sources[i]))
            .ok_or_else(|| CatalogError::NotFound(format!("source '{key}'")))
    }

    pub fn enabled(&self) -> Vec<Arc<Source>> {
        self.sources
            .iter()
            .filter(|s| !s.disabled)
            .cloned()
            .collect()
    }

    /// Registry position of `key`, used to order merged results.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Resolve requested keys against the snapshot: registry order, no duplicates,
    /// unknown keys dropped.
    pub fn select(&self, keys: &[String], include_disabled: bool) -> Vec<Arc<Source>> {
        let mut wanted: Vec<usize> = keys
            .iter()
            .filter_map(|k| {
                let pos = self.position(k.trim());
                if pos.is_none() {
                    warn!(target: "registry", key = %k, "requested source is not registered");
                }
                pos
            })
            .collect();
        wanted.sort_unstable();
        wanted.dedup();
        wanted
            .into_iter()
            .map(|i| Arc::clone(&self.sources[i]))
            .filter(|s| include_disabled || !s.disabled)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Shared handle to the current snapshot.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    inner: Arc<RwLock<Arc<RegistrySnapshot>>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>) -> CatalogResult<Self> {
        let snap = RegistrySnapshot::build(sources)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(snap))),
        })
    }

    pub fn from_loader(loader: &dyn SourceLoader) -> CatalogResult<Self> {
        Self::new(loader.load_sources()?)
    }

    /// Current snapshot. Hold on to it for the duration of one operation.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.inner.read() {
            Ok(g) => Arc::clone(&g),
            Err(poison) => Arc::clone(&poison.into_inner()),
        }
    }

    pub fn list(&self) -> Vec<Arc<Source>> {
        self.snapshot().list().to_vec()
    }

    pub fn get(&self, key: &str) -> CatalogResult<Arc<Source>> {
        self.snapshot().get(key)
    }

    pub fn enabled(&self) -> Vec<Arc<Source>> {
        self.snapshot().enabled()
    }

    /// Validate `sources` into a new snapshot and swap it in. On validation failure
    /// the current snapshot stays untouched.
    pub fn reload(&self, sources: Vec<Source>) -> CatalogResult<usize> {
        let snap = Arc::new(RegistrySnapshot::build(sources)?);
        let n = snap.len();
        match self.inner.write() {
            Ok(mut w) => *w = snap,
            Err(poison) => *poison.into_inner() = snap,
        }
        info!(target: "registry", sources = n, "registry reloaded");
        Ok(n)
    }

    pub fn reload_from(&self, loader: &dyn SourceLoader) -> CatalogResult<usize> {
        self.reload(loader.load_sources()?)
    }
}

/// Poll `path` for mtime changes and reload the registry when it changes.
/// Bad files are logged and skipped; the previous snapshot keeps serving.
pub fn spawn_hot_reload(
    registry: SourceRegistry,
    loader: Arc<dyn SourceLoader>,
    path: PathBuf,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime: Option<SystemTime> = None;
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!(target: "registry", error = %e, path = %path.display(), "hot reload: stat failed");
                    continue;
                }
            };
            if last_mtime.is_none() {
                last_mtime = Some(mtime);
                continue;
            }
            if last_mtime == Some(mtime) {
                continue;
            }
            last_mtime = Some(mtime);
            match registry.reload_from(loader.as_ref()) {
                Ok(n) => info!(target: "registry", sources = n, "hot reload applied"),
                Err(e) => warn!(target: "registry", error = %e, "hot reload rejected"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Vec<Source> {
        vec![
            Source::new("a", "Alpha", "http://a.test/api"),
            Source::new("b", "Beta", "http://b.test/api").disabled(),
            Source::new("c", "Gamma", "http://c.test/api"),
        ]
    }

    #[test]
    fn list_get_enabled() {
        let reg = SourceRegistry::new(three()).unwrap();
        let keys: Vec<_> = reg.list().iter().map(|s| s.key.clone()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(reg.get("c").unwrap().name, "Gamma");
        assert!(matches!(reg.get("zzz"), Err(CatalogError::NotFound(_))));
        let en: Vec<_> = reg.enabled().iter().map(|s| s.key.clone()).collect();
        assert_eq!(en, vec!["a", "c"]);
    }

    #[test]
    fn duplicate_keys_rejected_and_old_snapshot_kept() {
        let reg = SourceRegistry::new(three()).unwrap();
        let bad = vec![
            Source::new("x", "X", "http://x"),
            Source::new("x", "X2", "http://x2"),
        ];
        assert!(matches!(reg.reload(bad), Err(CatalogError::Config(_))));
        assert_eq!(reg.list().len(), 3);
    }

    #[test]
    fn snapshot_held_across_reload_is_unchanged() {
        let reg = SourceRegistry::new(three()).unwrap();
        let before = reg.snapshot();
        reg.reload(vec![Source::new("z", "Zed", "http://z")]).unwrap();
        assert_eq!(before.len(), 3);
        assert_eq!(reg.snapshot().len(), 1);
        assert!(reg.get("a").is_err());
    }

    #[test]
    fn select_orders_by_registry_and_dedups() {
        let reg = SourceRegistry::new(three()).unwrap();
        let snap = reg.snapshot();
        let keys = vec!["c".to_string(), "a".into(), "c".into(), "nope".into()];
        let sel: Vec<_> = snap.select(&keys, false).iter().map(|s| s.key.clone()).collect();
        assert_eq!(sel, vec!["a", "c"]);

        let with_disabled: Vec<_> = snap
            .select(&["b".to_string()], true)
            .iter()
            .map(|s| s.key.clone())
            .collect();
        assert_eq!(with_disabled, vec!["b"]);
        assert!(snap.select(&["b".to_string()], false).is_empty());
    }
}
