// src/config/mod.rs
//! Runtime configuration. Every knob has a default and can be overridden by env.

pub mod sources;

use std::time::Duration;

use crate::pagination::AutoFillPolicy;

pub const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BROWSE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_CACHE_CAPACITY: usize = 512;
pub const DEFAULT_AUTOFILL_MIN_INTERVAL_MS: u64 = 400;
pub const DEFAULT_AUTOFILL_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_RESOLVER_API_BASE: &str = "https://api.bilibili.com";
pub const DEFAULT_RESOLVER_COMMENT_BASE: &str = "https://comment.bilibili.com";

/// Upper bound accepted for caller-supplied timeouts.
pub const MAX_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub search_timeout: Duration,
    pub browse_timeout: Duration,
    pub resolve_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub autofill: AutoFillPolicy,
    pub resolver_api_base: String,
    pub resolver_comment_base: String,
    /// Zero disables hot reload of the source list.
    pub sources_reload_every: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_millis(DEFAULT_SEARCH_TIMEOUT_MS),
            browse_timeout: Duration::from_millis(DEFAULT_BROWSE_TIMEOUT_MS),
            resolve_timeout: Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            autofill: AutoFillPolicy {
                min_interval: Duration::from_millis(DEFAULT_AUTOFILL_MIN_INTERVAL_MS),
                max_consecutive_iterations: DEFAULT_AUTOFILL_MAX_ITERATIONS,
            },
            resolver_api_base: DEFAULT_RESOLVER_API_BASE.to_string(),
            resolver_comment_base: DEFAULT_RESOLVER_COMMENT_BASE.to_string(),
            sources_reload_every: Duration::ZERO,
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with whatever env provides. Unparseable values fall back to
    /// the default (and are logged) rather than aborting startup.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            search_timeout: env_ms("SEARCH_TIMEOUT_MS").unwrap_or(d.search_timeout),
            browse_timeout: env_ms("BROWSE_TIMEOUT_MS").unwrap_or(d.browse_timeout),
            resolve_timeout: env_ms("RESOLVE_TIMEOUT_MS").unwrap_or(d.resolve_timeout),
            cache_ttl: env_u64("CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.cache_ttl),
            cache_capacity: env_u64("CACHE_CAPACITY")
                .map(|v| v.max(1) as usize)
                .unwrap_or(d.cache_capacity),
            autofill: AutoFillPolicy {
                min_interval: env_ms("AUTOFILL_MIN_INTERVAL_MS")
                    .unwrap_or(d.autofill.min_interval),
                max_consecutive_iterations: env_u64("AUTOFILL_MAX_ITERATIONS")
                    .map(|v| v.min(u32::MAX as u64) as u32)
                    .unwrap_or(d.autofill.max_consecutive_iterations),
            },
            resolver_api_base: env_str("RESOLVER_API_BASE").unwrap_or(d.resolver_api_base),
            resolver_comment_base: env_str("RESOLVER_COMMENT_BASE")
                .unwrap_or(d.resolver_comment_base),
            sources_reload_every: env_u64("SOURCES_RELOAD_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.sources_reload_every),
        }
    }
}

/// Clamp a caller-supplied timeout into `1..=MAX_TIMEOUT_MS`.
pub fn clamp_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(1, MAX_TIMEOUT_MS))
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable env value");
            None
        }
    }
}

fn env_ms(name: &str) -> Option<Duration> {
    env_u64(name).map(Duration::from_millis)
}
