// src/health.rs
//! Health view of dispatch outcomes, used by the source-test operation.

use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchOutcome, FailureKind};
use crate::normalize::NormalizedItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Valid,
    NoResults,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_key: String,
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub result_count: usize,
    /// Share of returned titles containing the test keyword, 0.0..=1.0.
    pub match_rate: f64,
    pub top_matches: Vec<String>,
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Precedence: timeout, then error, then no_results, else valid.
pub fn classify(outcome: &DispatchOutcome, item_count: usize) -> SourceOutcome {
    let status = match outcome.failure_kind {
        FailureKind::Timeout => HealthStatus::Timeout,
        FailureKind::Network | FailureKind::Http | FailureKind::Malformed => HealthStatus::Error,
        FailureKind::None if item_count == 0 => HealthStatus::NoResults,
        FailureKind::None => HealthStatus::Valid,
    };
    SourceOutcome {
        source_key: outcome.source_key.clone(),
        name: outcome.source_key.clone(),
        status,
        latency_ms: outcome.latency_ms,
        result_count: item_count,
        match_rate: 0.0,
        top_matches: Vec::new(),
        disabled: false,
        error: outcome.error.clone(),
    }
}

impl SourceOutcome {
    pub fn with_name(mut self, name: &str, disabled: bool) -> Self {
        self.name = name.to_string();
        self.disabled = disabled;
        self
    }

    /// Fill `match_rate` and `top_matches` from the items the test search returned.
    pub fn with_matches(mut self, keyword: &str, items: &[NormalizedItem]) -> Self {
        let kw = keyword.trim().to_lowercase();
        if items.is_empty() || kw.is_empty() {
            return self;
        }
        let matching: Vec<&NormalizedItem> = items
            .iter()
            .filter(|i| i.title.to_lowercase().contains(&kw))
            .collect();
        self.match_rate = matching.len() as f64 / items.len() as f64;
        self.top_matches = matching.iter().take(3).map(|i| i.title.clone()).collect();
        self
    }
}

/// Ascending latency; ties keep dispatch order.
pub fn order_by_latency(outcomes: &mut [SourceOutcome]) {
    outcomes.sort_by_key(|o| o.latency_ms);
}
