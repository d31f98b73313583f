// src/aggregate.rs
//! Merge per-source outcomes into one result; filter, sort, append pages.
//!
//! Merge order is the order of the outcomes (the dispatcher emits them in registry
//! order) and, within a source, upstream order. Filters run after the merge and before
//! the sort. Sorting is stable, so ties keep their merge order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::dispatch::DispatchOutcome;
use crate::error::CatalogError;
use crate::normalize::{normalize, page_meta, NormalizedItem};
use crate::pagination::Paged;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortRule {
    #[default]
    Default,
    TitleAsc,
    TitleDesc,
    YearAsc,
    YearDesc,
}

impl FromStr for SortRule {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(SortRule::Default),
            "title-asc" => Ok(SortRule::TitleAsc),
            "title-desc" => Ok(SortRule::TitleDesc),
            "year-asc" => Ok(SortRule::YearAsc),
            "year-desc" => Ok(SortRule::YearDesc),
            other => Err(CatalogError::InvalidQuery(format!("unknown sort rule '{other}'"))),
        }
    }
}

impl SortRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortRule::Default => "default",
            SortRule::TitleAsc => "title-asc",
            SortRule::TitleDesc => "title-desc",
            SortRule::YearAsc => "year-asc",
            SortRule::YearDesc => "year-desc",
        }
    }
}

/// Secondary filters applied after the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filters {
    /// Case-insensitive substring over title and remarks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    /// Exact match on the trimmed year.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
}

impl Filters {
    pub fn new(keyword: Option<&str>, year: Option<&str>) -> Self {
        let clean = |v: Option<&str>| {
            v.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            keyword: clean(keyword),
            year: clean(year),
        }
    }

    pub fn matches(&self, item: &NormalizedItem) -> bool {
        if let Some(kw) = &self.keyword {
            let kw = kw.to_lowercase();
            if !item.title.to_lowercase().contains(&kw) && !item.remarks.to_lowercase().contains(&kw)
            {
                return false;
            }
        }
        if let Some(y) = &self.year {
            if item.year.trim() != y {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedResult {
    pub items: Vec<NormalizedItem>,
    pub per_source: BTreeMap<String, DispatchOutcome>,
    pub page: u32,
    pub page_count: u32,
    #[serde(default)]
    pub sort: SortRule,
    #[serde(default)]
    pub filters: Filters,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedResult {
    pub fn outcome(&self, source_key: &str) -> Option<&DispatchOutcome> {
        self.per_source.get(source_key)
    }

    /// Distinct non-empty years among the items, newest first.
    pub fn available_years(&self) -> Vec<String> {
        let mut years: Vec<String> = self
            .items
            .iter()
            .map(|i| i.year.trim().to_string())
            .filter(|y| !y.is_empty())
            .collect();
        years.sort_by(|a, b| {
            crate::normalize::leading_int(b)
                .cmp(&crate::normalize::leading_int(a))
                .then_with(|| a.cmp(b))
        });
        years.dedup();
        years
    }
}

impl Paged for AggregatedResult {
    fn has_more(&self) -> bool {
        self.page < self.page_count
    }
}

/// Merge outcomes into one result.
pub fn aggregate(outcomes: &[DispatchOutcome], sort: SortRule, filters: &Filters) -> AggregatedResult {
    let (items, page, page_count) = collect(outcomes, filters);
    let mut result = AggregatedResult {
        items,
        per_source: outcomes
            .iter()
            .map(|o| (o.source_key.clone(), o.clone()))
            .collect(),
        page: page.unwrap_or(1),
        page_count: page_count.unwrap_or(1),
        sort,
        filters: filters.clone(),
        generated_at: Utc::now(),
    };
    result.page_count = result.page_count.max(result.page);
    sort_items(&mut result.items, sort);
    result
}

/// Append the next page's outcomes to `previous`, keeping its sort and filters.
/// If every next-page call failed, the page cursor does not advance.
pub fn append_page(previous: AggregatedResult, next: &[DispatchOutcome]) -> AggregatedResult {
    let mut result = previous;
    let (items, page, page_count) = collect(next, &result.filters);
    result.items.extend(items);
    for o in next {
        result.per_source.insert(o.source_key.clone(), o.clone());
    }
    if let Some(p) = page {
        result.page = result.page.max(p);
    }
    if let Some(pc) = page_count {
        result.page_count = pc;
    }
    result.page_count = result.page_count.max(result.page);
    result.generated_at = Utc::now();
    sort_items(&mut result.items, result.sort);
    result
}

/// Items from successful outcomes (in order) plus the highest reported page / page count.
fn collect(
    outcomes: &[DispatchOutcome],
    filters: &Filters,
) -> (Vec<NormalizedItem>, Option<u32>, Option<u32>) {
    let mut items = Vec::new();
    let mut page = None::<u32>;
    let mut page_count = None::<u32>;
    for o in outcomes {
        let Some(payload) = o.raw_payload.as_ref().filter(|_| o.is_success()) else {
            continue;
        };
        let meta = page_meta(payload);
        page = Some(page.map_or(meta.page, |p| p.max(meta.page)));
        page_count = Some(page_count.map_or(meta.page_count, |p| p.max(meta.page_count)));
        items.extend(
            normalize(payload, &o.source_key)
                .into_iter()
                .filter(|i| filters.matches(i)),
        );
    }
    (items, page, page_count)
}

/// Stable sort by the requested key. `Default` keeps merge order.
pub fn sort_items(items: &mut [NormalizedItem], rule: SortRule) {
    let by_title = |a: &NormalizedItem, b: &NormalizedItem| -> Ordering {
        a.title.to_lowercase().cmp(&b.title.to_lowercase())
    };
    match rule {
        SortRule::Default => {}
        SortRule::TitleAsc => items.sort_by(by_title),
        SortRule::TitleDesc => items.sort_by(|a, b| by_title(b, a)),
        SortRule::YearAsc => items.sort_by_key(|i| i.year_value()),
        SortRule::YearDesc => items.sort_by(|a, b| b.year_value().cmp(&a.year_value())),
    }
}
