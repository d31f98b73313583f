// src/dispatch.rs
//! Fan-out / fan-in over catalog sources.
//!
//! One call per target source, all in flight at once. Each call carries its own
//! deadline; expiry drops only that call's transport future. The dispatcher waits for
//! every call to settle and returns exactly one [`DispatchOutcome`] per target, in
//! target order. Nothing here retries.

use futures_util::future::join_all;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::error::{CatalogError, CatalogResult};
use crate::normalize::{validate_envelope, ListKind};
use crate::registry::Source;
use crate::transport::Transport;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("dispatch_calls_total", "Upstream calls issued to sources.");
        describe_counter!(
            "dispatch_failures_total",
            "Upstream calls that settled with a failure, by kind."
        );
        describe_histogram!(
            "dispatch_latency_ms",
            "Per-source latency from issuance to settlement in milliseconds."
        );
    });
}

/// How a single source call failed, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    None,
    Network,
    Http,
    Timeout,
    Malformed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::None => "none",
            FailureKind::Network => "network",
            FailureKind::Http => "http",
            FailureKind::Timeout => "timeout",
            FailureKind::Malformed => "malformed",
        }
    }

    pub fn of(e: &CatalogError) -> Self {
        match e {
            CatalogError::Timeout(_) => FailureKind::Timeout,
            CatalogError::Http { .. } => FailureKind::Http,
            CatalogError::Malformed(_) => FailureKind::Malformed,
            _ => FailureKind::Network,
        }
    }
}

/// Result of one call to one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchOutcome {
    pub source_key: String,
    /// Parsed payload; present only when the call succeeded.
    #[serde(skip)]
    pub raw_payload: Option<Value>,
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub failure_kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failure_kind == FailureKind::None
    }

    fn failed(source_key: &str, status: Option<u16>, latency_ms: u64, e: &CatalogError) -> Self {
        Self {
            source_key: source_key.to_string(),
            raw_payload: None,
            http_status: status,
            latency_ms,
            failure_kind: FailureKind::of(e),
            error: Some(e.to_string()),
        }
    }
}

/// What is being asked of every targeted source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Search { keyword: String, page: u32 },
    Category { category_id: String, page: u32 },
    Categories,
}

impl Operation {
    /// Request URL for `endpoint` (vendor query conventions: `ac`, `wd`, `t`, `pg`).
    pub fn url(&self, endpoint: &str) -> CatalogResult<String> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| CatalogError::Network(format!("invalid endpoint '{endpoint}': {e}")))?;
        {
            let mut q = url.query_pairs_mut();
            match self {
                Operation::Search { keyword, page } => {
                    q.append_pair("ac", "videolist").append_pair("wd", keyword);
                    if *page > 1 {
                        q.append_pair("pg", &page.to_string());
                    }
                }
                Operation::Category { category_id, page } => {
                    q.append_pair("ac", "videolist")
                        .append_pair("t", category_id)
                        .append_pair("pg", &page.max(&1).to_string());
                }
                Operation::Categories => {
                    q.append_pair("ac", "list");
                }
            }
        }
        Ok(url.into())
    }

    pub fn list_kind(&self) -> ListKind {
        match self {
            Operation::Categories => ListKind::Categories,
            _ => ListKind::Items,
        }
    }

    pub fn page(&self) -> u32 {
        match self {
            Operation::Search { page, .. } | Operation::Category { page, .. } => (*page).max(1),
            Operation::Categories => 1,
        }
    }

    /// Same operation, one page further.
    pub fn next_page(&self) -> Option<Operation> {
        match self {
            Operation::Search { keyword, page } => Some(Operation::Search {
                keyword: keyword.clone(),
                page: page.max(&1) + 1,
            }),
            Operation::Category { category_id, page } => Some(Operation::Category {
                category_id: category_id.clone(),
                page: page.max(&1) + 1,
            }),
            Operation::Categories => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        ensure_metrics_described();
        Self { transport }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Call every source concurrently and wait for all of them to settle.
    pub async fn dispatch(
        &self,
        op: &Operation,
        sources: &[Arc<Source>],
        budget: Duration,
    ) -> Vec<DispatchOutcome> {
        let started = Instant::now();
        let outcomes = join_all(sources.iter().map(|s| self.call_one(op, s, budget))).await;
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        tracing::info!(
            target: "dispatch",
            sources = outcomes.len(),
            failed,
            wall_ms = started.elapsed().as_millis() as u64,
            "fan-out settled"
        );
        outcomes
    }

    async fn call_one(&self, op: &Operation, src: &Source, budget: Duration) -> DispatchOutcome {
        counter!("dispatch_calls_total").increment(1);
        let budget_ms = budget.as_millis() as u64;
        let started = Instant::now();

        let outcome = match op.url(&src.endpoint) {
            Err(e) => DispatchOutcome::failed(&src.key, None, 0, &e),
            Ok(url) => {
                let settled =
                    tokio::time::timeout(budget, self.transport.get(&url, &src.headers, budget))
                        .await;
                let latency_ms = (started.elapsed().as_millis() as u64).min(budget_ms);
                match settled {
                    Err(_) => DispatchOutcome::failed(
                        &src.key,
                        None,
                        budget_ms,
                        &CatalogError::Timeout(budget_ms),
                    ),
                    Ok(Err(e)) => {
                        let latency = if matches!(e, CatalogError::Timeout(_)) {
                            budget_ms
                        } else {
                            latency_ms
                        };
                        DispatchOutcome::failed(&src.key, None, latency, &e)
                    }
                    Ok(Ok(resp)) => {
                        let status = Some(resp.status);
                        if !resp.is_success() {
                            let detail: String = resp.body.chars().take(100).collect();
                            let e = CatalogError::Http {
                                status: resp.status,
                                detail,
                            };
                            DispatchOutcome::failed(&src.key, status, latency_ms, &e)
                        } else {
                            match accept_payload(&resp.body, op.list_kind()) {
                                Ok(payload) => DispatchOutcome {
                                    source_key: src.key.clone(),
                                    raw_payload: Some(payload),
                                    http_status: status,
                                    latency_ms,
                                    failure_kind: FailureKind::None,
                                    error: None,
                                },
                                Err(e) => DispatchOutcome::failed(&src.key, status, latency_ms, &e),
                            }
                        }
                    }
                }
            }
        };

        histogram!("dispatch_latency_ms").record(outcome.latency_ms as f64);
        if !outcome.is_success() {
            counter!("dispatch_failures_total", "kind" => outcome.failure_kind.as_str())
                .increment(1);
            tracing::warn!(
                target: "dispatch",
                source = %src.key,
                kind = outcome.failure_kind.as_str(),
                latency_ms = outcome.latency_ms,
                error = outcome.error.as_deref().unwrap_or_default(),
                "source call failed"
            );
        } else {
            tracing::debug!(target: "dispatch", source = %src.key, latency_ms = outcome.latency_ms, "source call ok");
        }
        outcome
    }
}

fn accept_payload(body: &str, kind: ListKind) -> CatalogResult<Value> {
    let payload: Value = serde_json::from_str(body.trim_start_matches('\u{feff}'))?;
    validate_envelope(&payload, kind)?;
    Ok(payload)
}
