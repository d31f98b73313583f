// src/service.rs
//! Catalog operations: the glue between registry, dispatcher, aggregator, cache and
//! resolver. Callers are expected to have passed the auth gate already.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::{aggregate, append_page, AggregatedResult, Filters, SortRule};
use crate::cache::{cache_key, CacheStatus, KvStore, MemoryStore, SingleFlightCache};
use crate::config::sources::SourceLoader;
use crate::config::{clamp_timeout, AppConfig};
use crate::dispatch::{DispatchOutcome, Dispatcher, FailureKind, Operation};
use crate::error::{CatalogError, CatalogResult};
use crate::health::{classify, order_by_latency, SourceOutcome};
use crate::normalize::{normalize, normalize_categories, Category};
use crate::pagination::{drive, AutoFill, FillReport, Paged};
use crate::registry::{RegistrySnapshot, Source, SourceRegistry};
use crate::resolve::{HttpResolverBackend, IdentifierResolver, ResolveInput, ResolvedId, ResolverBackend};
use crate::transport::Transport;

/// A search or browse request. Also the cache identity of its first page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub operation: Operation,
    /// `None` targets every enabled source (search only).
    #[serde(default)]
    pub source_keys: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub sort: SortRule,
    #[serde(default)]
    pub filters: Filters,
}

impl CatalogQuery {
    pub fn search(keyword: &str) -> Self {
        Self::new(Operation::Search {
            keyword: keyword.trim().to_string(),
            page: 1,
        })
    }

    pub fn browse(source_key: &str, category_id: &str, page: u32) -> Self {
        let mut q = Self::new(Operation::Category {
            category_id: category_id.trim().to_string(),
            page: page.max(1),
        });
        q.source_keys = Some(vec![source_key.trim().to_string()]);
        q
    }

    fn new(operation: Operation) -> Self {
        Self {
            operation,
            source_keys: None,
            timeout_ms: None,
            sort: SortRule::Default,
            filters: Filters::default(),
        }
    }

    pub fn sources(mut self, keys: Vec<String>) -> Self {
        self.source_keys = Some(keys);
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.operation = at_page(&self.operation, page.max(1));
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn sort(mut self, sort: SortRule) -> Self {
        self.sort = sort;
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    fn validate(&self) -> CatalogResult<()> {
        match &self.operation {
            Operation::Search { keyword, .. } if keyword.trim().is_empty() => {
                Err(CatalogError::InvalidQuery("keyword is empty".into()))
            }
            Operation::Category { category_id, .. } if category_id.trim().is_empty() => {
                Err(CatalogError::InvalidQuery("category id is empty".into()))
            }
            Operation::Categories => Err(CatalogError::InvalidQuery(
                "category lists are not paged results".into(),
            )),
            _ => Ok(()),
        }
    }
}

fn at_page(op: &Operation, page: u32) -> Operation {
    match op {
        Operation::Search { keyword, .. } => Operation::Search {
            keyword: keyword.clone(),
            page,
        },
        Operation::Category { category_id, .. } => Operation::Category {
            category_id: category_id.clone(),
            page,
        },
        Operation::Categories => Operation::Categories,
    }
}

/// Public registry view; headers stay server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceInfo {
    pub key: String,
    pub name: String,
    pub endpoint: String,
    pub disabled: bool,
}

impl From<&Source> for SourceInfo {
    fn from(s: &Source) -> Self {
        Self {
            key: s.key.clone(),
            name: s.name.clone(),
            endpoint: s.endpoint.clone(),
            disabled: s.disabled,
        }
    }
}

pub struct CatalogService {
    config: AppConfig,
    registry: SourceRegistry,
    loader: Option<Arc<dyn SourceLoader>>,
    dispatcher: Dispatcher,
    cache: SingleFlightCache,
    resolver: IdentifierResolver,
}

impl CatalogService {
    /// In-memory cache and the HTTP resolver backend, both sized from `config`.
    pub fn new(config: AppConfig, registry: SourceRegistry, transport: Arc<dyn Transport>) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(config.cache_capacity));
        let backend: Arc<dyn ResolverBackend> = Arc::new(HttpResolverBackend::new(
            Arc::clone(&transport),
            &config.resolver_api_base,
            &config.resolver_comment_base,
            config.resolve_timeout,
        ));
        Self {
            cache: SingleFlightCache::new(store, config.cache_ttl),
            resolver: IdentifierResolver::new(backend),
            dispatcher: Dispatcher::new(transport),
            loader: None,
            registry,
            config,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn SourceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.cache = SingleFlightCache::new(store, self.config.cache_ttl);
        self
    }

    pub fn with_resolver_backend(mut self, backend: Arc<dyn ResolverBackend>) -> Self {
        self.resolver = IdentifierResolver::new(backend);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn list_sources(&self) -> Vec<SourceInfo> {
        self.registry
            .list()
            .iter()
            .map(|s| SourceInfo::from(s.as_ref()))
            .collect()
    }

    /// Fan out a keyword search. Per-source failures are recorded, never returned.
    pub async fn search(&self, query: CatalogQuery) -> CatalogResult<(AggregatedResult, CacheStatus)> {
        if !matches!(query.operation, Operation::Search { .. }) {
            return Err(CatalogError::InvalidQuery("not a search query".into()));
        }
        self.execute(query).await
    }

    /// Single-source category listing.
    pub async fn browse_category(
        &self,
        source_key: &str,
        category_id: &str,
        page: u32,
    ) -> CatalogResult<(AggregatedResult, CacheStatus)> {
        self.execute(CatalogQuery::browse(source_key, category_id, page))
            .await
    }

    /// Run a search or browse query through the cache.
    pub async fn execute(&self, query: CatalogQuery) -> CatalogResult<(AggregatedResult, CacheStatus)> {
        query.validate()?;
        let snap = self.registry.snapshot();
        let targets = self.targets(&snap, &query)?;
        let budget = self.budget(&query);
        let key = cache_key(
            "aggregate",
            &(
                &query.operation,
                upstream_identity(&targets),
                budget.as_millis() as u64,
                query.sort,
                &query.filters,
            ),
        );

        let dispatcher = self.dispatcher.clone();
        let op = query.operation.clone();
        let (sort, filters) = (query.sort, query.filters.clone());
        tracing::info!(op = ?query.operation, sources = targets.len(), "aggregate query");
        self.cache
            .get_or_load(&key, move || async move {
                let outcomes = dispatcher.dispatch(&op, &targets, budget).await;
                Ok::<_, CatalogError>(aggregate(&outcomes, sort, &filters))
            })
            .await
    }

    /// Fetch the page after `previous` and append it. Uncached.
    pub async fn load_more(
        &self,
        query: &CatalogQuery,
        previous: AggregatedResult,
    ) -> CatalogResult<AggregatedResult> {
        query.validate()?;
        if !previous.has_more() {
            return Ok(previous);
        }
        let snap = self.registry.snapshot();
        let targets = self.targets(&snap, query)?;
        let op = at_page(&query.operation, previous.page + 1);
        let outcomes = self
            .dispatcher
            .dispatch(&op, &targets, self.budget(query))
            .await;
        Ok(append_page(previous, &outcomes))
    }

    /// Keep appending pages while `near_end` holds, within the auto-fill policy.
    /// `fill` carries the per-list state; call `fill.user_trigger()` on user input.
    pub async fn auto_fill<N>(
        &self,
        query: &CatalogQuery,
        previous: AggregatedResult,
        fill: &mut AutoFill,
        near_end: N,
    ) -> (AggregatedResult, FillReport)
    where
        N: FnMut(&AggregatedResult) -> bool,
    {
        drive(fill, previous, near_end, |prev: AggregatedResult| async move {
            match self.load_more(query, prev.clone()).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(error = %e, "auto-fill page failed");
                    prev
                }
            }
        })
        .await
    }

    pub fn auto_fill_state(&self) -> AutoFill {
        AutoFill::new(self.config.autofill)
    }

    /// Probe sources with a keyword search. Live, never cached. Named disabled sources
    /// are tested too; no names means every enabled source.
    pub async fn test_sources(
        &self,
        source_keys: &[String],
        keyword: &str,
        timeout_ms: Option<u64>,
    ) -> CatalogResult<Vec<SourceOutcome>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(CatalogError::InvalidQuery("keyword is empty".into()));
        }
        let snap = self.registry.snapshot();
        let targets = if source_keys.is_empty() {
            snap.enabled()
        } else {
            snap.select(source_keys, true)
        };
        if targets.is_empty() {
            return Err(CatalogError::InvalidQuery("no resolvable sources".into()));
        }
        let budget = timeout_ms
            .map(clamp_timeout)
            .unwrap_or(self.config.search_timeout);
        let op = Operation::Search {
            keyword: keyword.to_string(),
            page: 1,
        };
        let outcomes = self.dispatcher.dispatch(&op, &targets, budget).await;

        let mut report: Vec<SourceOutcome> = outcomes
            .iter()
            .zip(targets.iter())
            .map(|(o, src)| {
                let items = o
                    .raw_payload
                    .as_ref()
                    .map(|p| normalize(p, &o.source_key))
                    .unwrap_or_default();
                classify(o, items.len())
                    .with_name(&src.name, src.disabled)
                    .with_matches(keyword, &items)
            })
            .collect();
        order_by_latency(&mut report);
        Ok(report)
    }

    /// Category list of one source, cached.
    pub async fn list_categories(&self, source_key: &str) -> CatalogResult<(Vec<Category>, CacheStatus)> {
        let src = self
            .registry
            .get(source_key.trim())
            .map_err(|_| CatalogError::InvalidQuery(format!("unknown source '{source_key}'")))?;
        let key = cache_key("categories", &upstream_identity(std::slice::from_ref(&src)));
        let dispatcher = self.dispatcher.clone();
        let budget = self.config.browse_timeout;
        self.cache
            .get_or_load(&key, move || async move {
                let outcomes = dispatcher.dispatch(&Operation::Categories, &[src], budget).await;
                let outcome = outcomes
                    .into_iter()
                    .next()
                    .ok_or_else(|| CatalogError::InvalidQuery("no resolvable sources".into()))?;
                match outcome.raw_payload.as_ref() {
                    Some(p) if outcome.is_success() => Ok(normalize_categories(p)),
                    _ => Err(outcome_error(&outcome)),
                }
            })
            .await
    }

    /// Resolve a link or id fields to a canonical id. Successful resolutions are cached.
    pub async fn resolve_identifier(&self, input: &ResolveInput) -> CatalogResult<(ResolvedId, CacheStatus)> {
        let key = cache_key("resolve", input);
        let resolver = self.resolver.clone();
        let input = input.clone();
        self.cache
            .get_or_load(&key, move || async move { resolver.resolve(&input).await })
            .await
    }

    /// Resolve, then fetch the comment feed of the resolved id.
    pub async fn fetch_comment_feed(&self, input: &ResolveInput) -> CatalogResult<(ResolvedId, String)> {
        self.resolver.comment_feed(input).await
    }

    /// Re-read the config store and swap the registry snapshot.
    pub fn reload_sources(&self) -> CatalogResult<usize> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| CatalogError::Config("no source loader configured".into()))?;
        self.registry.reload_from(loader.as_ref())
    }

    fn targets(&self, snap: &RegistrySnapshot, query: &CatalogQuery) -> CatalogResult<Vec<Arc<Source>>> {
        let targets = match (&query.operation, &query.source_keys) {
            (Operation::Search { .. }, None) => snap.enabled(),
            (Operation::Search { .. }, Some(keys)) => snap.select(keys, false),
            (_, Some(keys)) => snap.select(keys, true),
            (_, None) => {
                return Err(CatalogError::InvalidQuery(
                    "browsing needs a source key".into(),
                ))
            }
        };
        if targets.is_empty() {
            return Err(CatalogError::InvalidQuery("no resolvable sources".into()));
        }
        Ok(targets)
    }

    fn budget(&self, query: &CatalogQuery) -> Duration {
        query.timeout_ms.map(clamp_timeout).unwrap_or(match query.operation {
            Operation::Search { .. } => self.config.search_timeout,
            _ => self.config.browse_timeout,
        })
    }
}

/// Everything about the targets that shapes the upstream requests. Keys alone are not
/// enough: a reload may move a source or change its headers under the same key.
fn upstream_identity(targets: &[Arc<Source>]) -> Vec<(&str, &str, &BTreeMap<String, String>)> {
    targets
        .iter()
        .map(|s| (s.key.as_str(), s.endpoint.as_str(), &s.headers))
        .collect()
}

/// Error equivalent of a failed single-source outcome.
fn outcome_error(o: &DispatchOutcome) -> CatalogError {
    let detail = o.error.clone().unwrap_or_default();
    match o.failure_kind {
        FailureKind::Timeout => CatalogError::Timeout(o.latency_ms),
        FailureKind::Http => CatalogError::Http {
            status: o.http_status.unwrap_or(502),
            detail,
        },
        FailureKind::Malformed => CatalogError::Malformed(detail),
        FailureKind::Network | FailureKind::None => CatalogError::Network(detail),
    }
}
