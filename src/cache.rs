// src/cache.rs
//! TTL cache with single-flight loading.
//!
//! Values go through a [`KvStore`] as JSON so the store can live in-process
//! ([`MemoryStore`]) or elsewhere. Concurrent callers that miss on the same key share
//! one in-flight load; only the first one (the leader) runs the loader.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{CatalogError, CatalogResult};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("cache_hits_total", "Lookups served from the cache store.");
        describe_counter!("cache_misses_total", "Lookups that ran the loader.");
        describe_counter!(
            "cache_coalesced_total",
            "Lookups that joined another caller's in-flight load."
        );
    });
}

/// Backing store. `get` must never return an entry past its TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration);
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Bounded in-process store. When full, expired entries go first, then the entry
/// closest to expiry.
pub struct MemoryStore {
    capacity: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(e) if Instant::now() < e.expires_at => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            entries.retain(|_, e| now < e.expires_at);
            if entries.len() >= self.capacity {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(k) = victim {
                    entries.remove(&k);
                }
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store.
    Hit,
    /// This caller ran the loader.
    Miss,
    /// Joined another caller's load.
    Shared,
}

impl CacheStatus {
    pub fn as_header(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Shared => "SHARED",
        }
    }
}

/// `(value, loaded_now)`
type Flight = Shared<BoxFuture<'static, Result<(Value, bool), CatalogError>>>;

#[derive(Clone)]
pub struct SingleFlightCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    inflight: Arc<Mutex<HashMap<String, Flight>>>,
}

impl SingleFlightCache {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        ensure_metrics_described();
        Self {
            store,
            ttl,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key`, or run `load` once for all concurrent callers.
    /// Errors are shared with the callers waiting on the same load but never stored.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, load: F) -> CatalogResult<(T, CacheStatus)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatalogResult<T>> + Send + 'static,
    {
        let (flight, leader) = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(key) {
                Some(f) => (f.clone(), false),
                None => {
                    let flight = self.start_flight(key, load());
                    inflight.insert(key.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };

        let (value, loaded_now) = flight.await?;
        let status = match (leader, loaded_now) {
            (_, false) => CacheStatus::Hit,
            (true, true) => CacheStatus::Miss,
            (false, true) => CacheStatus::Shared,
        };
        match status {
            CacheStatus::Hit => counter!("cache_hits_total").increment(1),
            CacheStatus::Miss => counter!("cache_misses_total").increment(1),
            CacheStatus::Shared => counter!("cache_coalesced_total").increment(1),
        }
        tracing::debug!(target: "cache", key, status = status.as_header(), "cache lookup");
        Ok((serde_json::from_value(value)?, status))
    }

    fn start_flight<T, Fut>(&self, key: &str, loader: Fut) -> Flight
    where
        T: Serialize,
        Fut: Future<Output = CatalogResult<T>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let inflight = Arc::clone(&self.inflight);
        let ttl = self.ttl;
        let key = key.to_string();
        async move {
            let result: CatalogResult<(Value, bool)> = async {
                if let Some(v) = store.get(&key).await {
                    return Ok((v, false));
                }
                let v = serde_json::to_value(loader.await?)?;
                store.set_with_ttl(&key, v.clone(), ttl).await;
                Ok((v, true))
            }
            .await;
            lock(&inflight).remove(&key);
            result
        }
        .boxed()
        .shared()
    }
}

/// Stable key for an operation and its parameters.
pub fn cache_key<P: Serialize>(operation: &str, params: &P) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(params).unwrap_or_default());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(operation.len() + 33);
    out.push_str(operation);
    out.push(':');
    for b in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
