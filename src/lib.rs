// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod normalize;
pub mod pagination;
pub mod registry;
pub mod resolve;
pub mod service;
pub mod transport;

// ---- Re-exports for a stable public API ----
pub use crate::aggregate::{AggregatedResult, Filters, SortRule};
pub use crate::api::router;
pub use crate::error::{CatalogError, CatalogResult};
pub use crate::service::{CatalogQuery, CatalogService};

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{AuthGate, OpenGate, TokenGate};
use crate::config::sources::{default_sources_path, FileSourceLoader, SourceLoader};
use crate::config::AppConfig;
use crate::registry::{spawn_hot_reload, SourceRegistry};
use crate::transport::ReqwestTransport;

/// Build the full application from env: sources, HTTP transport, cache, auth gate,
/// Prometheus recorder. Starts the source hot-reload task when enabled.
pub async fn app() -> anyhow::Result<Router> {
    let config = AppConfig::from_env();

    let path = default_sources_path()?;
    let (registry, loader) = match &path {
        Some(p) => {
            let loader: Arc<dyn SourceLoader> = Arc::new(FileSourceLoader::new(p));
            let registry = SourceRegistry::from_loader(loader.as_ref())
                .with_context(|| format!("loading sources from {}", p.display()))?;
            info!(path = %p.display(), sources = registry.list().len(), "sources loaded");
            (registry, Some(loader))
        }
        None => {
            warn!("no source list found; starting with an empty registry");
            (SourceRegistry::default(), None)
        }
    };

    if let (Some(p), Some(l)) = (&path, &loader) {
        if !config.sources_reload_every.is_zero() {
            spawn_hot_reload(
                registry.clone(),
                Arc::clone(l),
                p.clone(),
                config.sources_reload_every,
            );
        }
    }

    let transport = Arc::new(ReqwestTransport::new().context("building HTTP client")?);
    let metrics = metrics::Metrics::init(config.cache_ttl.as_secs());
    let mut service = CatalogService::new(config, registry, transport);
    if let Some(l) = loader {
        service = service.with_loader(l);
    }

    let gate: Arc<dyn AuthGate> = if std::env::var("AUTH_DISABLED").is_ok_and(|v| v == "1") {
        warn!("AUTH_DISABLED=1: every request is treated as owner");
        Arc::new(OpenGate)
    } else {
        Arc::new(TokenGate::from_env())
    };

    let state = api::AppState {
        service: Arc::new(service),
        gate,
    };
    Ok(api::router(state, Some(metrics)))
}
