// src/normalize.rs
//! Vendor JSON → canonical items.
//!
//! Catalog vendors agree on very little: the record list may sit under `list`, `data`,
//! `items`, `results` or `data.list`; a title may be `vod_name`, `title` or `name`; ids
//! arrive as strings or numbers. Each canonical field is resolved by trying its known
//! aliases in order. Records missing an id or a title are dropped one by one; the rest
//! of the response survives.

use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CatalogError, CatalogResult};

/// Canonical catalog record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedItem {
    pub id: String,
    pub title: String,
    pub poster: String,
    pub year: String,
    pub remarks: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub source_key: String,
}

impl NormalizedItem {
    /// Year as a number for ordering; non-numeric years count as 0.
    pub fn year_value(&self) -> i64 {
        leading_int(&self.year)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub type_id: String,
    pub type_name: String,
}

/// Paging metadata reported by a vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub page: u32,
    pub page_count: u32,
    pub total: u64,
}

impl Default for PageMeta {
    fn default() -> Self {
        Self {
            page: 1,
            page_count: 1,
            total: 0,
        }
    }
}

/// Which list an operation expects to find in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Items,
    Categories,
}

const LIST_FIELDS: &[&str] = &["list", "data", "items", "results"];
const NESTED_LIST_FIELDS: &[&str] = &["list", "items"];

const ID_FIELDS: &[&str] = &["vod_id", "id"];
const TITLE_FIELDS: &[&str] = &["vod_name", "title", "name"];
const POSTER_FIELDS: &[&str] = &["vod_pic", "pic", "poster", "cover"];
const YEAR_FIELDS: &[&str] = &["vod_year", "year"];
const REMARKS_FIELDS: &[&str] = &["vod_remarks", "remarks", "note"];
const TYPE_FIELDS: &[&str] = &["type_name", "vod_class"];

/// Locate the record list inside a vendor envelope.
pub fn locate_list(raw: &Value) -> Option<&Vec<Value>> {
    if let Value::Array(a) = raw {
        return Some(a);
    }
    let obj = raw.as_object()?;
    for f in LIST_FIELDS {
        match obj.get(*f) {
            Some(Value::Array(a)) => return Some(a),
            Some(Value::Object(inner)) => {
                for nf in NESTED_LIST_FIELDS {
                    if let Some(Value::Array(a)) = inner.get(*nf) {
                        return Some(a);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Structural check run by the dispatcher before a payload is accepted.
///
/// - vendor `code` present and not a success code → upstream-reported error
/// - expected list not locatable → malformed
pub fn validate_envelope(raw: &Value, kind: ListKind) -> CatalogResult<()> {
    if let Some(obj) = raw.as_object() {
        if let Some(code) = obj.get("code").and_then(as_i64) {
            if !matches!(code, 0 | 1 | 200) {
                let msg = obj
                    .get("msg")
                    .or_else(|| obj.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown vendor error");
                return Err(CatalogError::Http {
                    status: 200,
                    detail: format!("vendor code {code}: {msg}"),
                });
            }
        }
    } else if !raw.is_array() {
        return Err(CatalogError::Malformed(
            "payload is neither an object nor an array".into(),
        ));
    }

    let found = match kind {
        ListKind::Items => locate_list(raw).is_some(),
        ListKind::Categories => raw.get("class").map(Value::is_array).unwrap_or(false),
    };
    if found {
        Ok(())
    } else {
        Err(CatalogError::Malformed("no record list in payload".into()))
    }
}

/// Convert a raw payload into canonical items. Never fails: an unlocatable list
/// yields an empty sequence, bad records are skipped.
pub fn normalize(raw: &Value, source_key: &str) -> Vec<NormalizedItem> {
    let Some(records) = locate_list(raw) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(records.len());
    let mut dropped = 0u64;
    for rec in records {
        match normalize_record(rec, source_key) {
            Some(item) => out.push(item),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        tracing::debug!(target: "normalize", source = source_key, dropped, "skipped invalid records");
        counter!("normalize_dropped_records_total").increment(dropped);
    }
    out
}

fn normalize_record(rec: &Value, source_key: &str) -> Option<NormalizedItem> {
    let obj = rec.as_object()?;
    let id = pick(obj, ID_FIELDS)?;
    let title = clean_text(&pick(obj, TITLE_FIELDS)?);
    if title.is_empty() {
        return None;
    }
    Some(NormalizedItem {
        id,
        title,
        poster: pick(obj, POSTER_FIELDS).unwrap_or_default(),
        year: pick(obj, YEAR_FIELDS).unwrap_or_default(),
        remarks: pick(obj, REMARKS_FIELDS)
            .map(|r| clean_text(&r))
            .unwrap_or_default(),
        type_name: pick(obj, TYPE_FIELDS).map(|t| clean_text(&t)),
        source_key: source_key.to_string(),
    })
}

/// Paging metadata; missing or unparseable fields keep their defaults.
pub fn page_meta(raw: &Value) -> PageMeta {
    let d = PageMeta::default();
    let Some(obj) = raw.as_object() else {
        return d;
    };
    let num = |f: &str| obj.get(f).and_then(as_i64).filter(|v| *v >= 0);
    let page = num("page").map(|v| v.max(1) as u32).unwrap_or(d.page);
    let page_count = num("pagecount")
        .map(|v| v.max(1) as u32)
        .unwrap_or(d.page_count);
    let total = num("total").map(|v| v as u64).unwrap_or(d.total);
    PageMeta {
        page,
        page_count: page_count.max(page),
        total,
    }
}

/// Category list (`class`) of a vendor response.
pub fn normalize_categories(raw: &Value) -> Vec<Category> {
    let Some(Value::Array(classes)) = raw.get("class") else {
        return Vec::new();
    };
    classes
        .iter()
        .filter_map(|c| {
            let obj = c.as_object()?;
            Some(Category {
                type_id: pick(obj, &["type_id", "id"])?,
                type_name: clean_text(&pick(obj, &["type_name", "name"])?),
            })
        })
        .collect()
}

/// First alias present as a non-empty string or an integral number.
fn pick(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|f| match obj.get(*f)? {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => n
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| n.as_u64().map(|v| v.to_string())),
        _ => None,
    })
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Leading decimal digits as a number (`"2023年"` → 2023); anything else is 0.
pub fn leading_int(s: &str) -> i64 {
    let digits: String = s
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .take(9)
        .collect();
    digits.parse().unwrap_or(0)
}

/// Decode HTML entities, strip tags, collapse whitespace.
pub fn clean_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[a-z][^>]*>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&out, " ").trim().to_string()
}
