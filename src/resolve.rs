// src/resolve.rs
//! Canonical content id from heterogeneous links and id fields.
//!
//! Link rules are tried in a fixed order; the first rule that matches owns the whole
//! resolution, including its dependent lookups. A failed lookup or an out-of-range
//! index is terminal: no later rule is consulted. Explicit id fields are the fallback
//! when no link rule matched. New link formats are added as a new [`Rule`] variant.

use async_trait::async_trait;
use metrics::{counter, describe_counter};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{CatalogError, CatalogResult};
use crate::transport::{Transport, USER_AGENT};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "resolve_failures_total",
            "Identifier resolutions that ended in a terminal error, by kind."
        );
    });
}

/// What a caller hands to the chain. Field names accept both snake_case and the
/// camelCase spellings used by web clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveInput {
    #[serde(default, alias = "url")]
    pub link: Option<String>,
    /// Bare episode path such as `ep123456`, matched like a link.
    #[serde(default, alias = "episodePath")]
    pub episode_path: Option<String>,
    #[serde(default, alias = "seasonId", alias = "ss")]
    pub season_id: Option<String>,
    #[serde(default, alias = "showId", alias = "media_id", alias = "md")]
    pub show_id: Option<String>,
    #[serde(default, alias = "itemId", alias = "bv", alias = "bvid")]
    pub item_id: Option<String>,
    #[serde(default, alias = "explicitId", alias = "cid")]
    pub explicit_id: Option<String>,
    /// 1-based episode index within a season; defaults to 1.
    #[serde(default, alias = "episodeIndex")]
    pub ep: Option<u32>,
    /// 1-based part index within an item; defaults to 1.
    #[serde(default, alias = "partIndex")]
    pub p: Option<u32>,
}

impl ResolveInput {
    pub fn link(link: &str) -> Self {
        Self {
            link: Some(link.to_string()),
            ..Self::default()
        }
    }
}

/// Link formats, in match order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Season,
    Show,
    Episode,
    Item,
    /// `cid` query parameter carried by the link itself.
    LinkCid,
    /// No link rule matched; explicit id fields were used.
    ExplicitFields,
}

pub const LINK_RULES: [Rule; 5] = [Rule::Season, Rule::Show, Rule::Episode, Rule::Item, Rule::LinkCid];

/// A matched reference, ready for its dependent lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Season(String),
    Show(String),
    Episode(String),
    Item(String),
    Direct(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedId {
    pub canonical_id: String,
    pub rule: Rule,
}

static RE_SEASON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|/bangumi/(?:season/|play/)?)ss(\d+)").unwrap());
static RE_SHOW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|/bangumi/(?:media/)?)md(\d+)").unwrap());
static RE_EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|/bangumi/play/)ep(\d+)").unwrap());
static RE_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|/video/)((?i:bv)[0-9A-Za-z]{10,})").unwrap());
static RE_ITEM_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i:bv)[0-9A-Za-z]{10,}$").unwrap());

fn is_numeric_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_item_id(s: &str) -> bool {
    RE_ITEM_ID.is_match(s)
}

/// Path and query of a link. Bare references (`ep123`, `BV1xx…`) have no scheme and
/// are taken as a path.
#[derive(Debug, Default)]
struct LinkParts {
    path: String,
    query: HashMap<String, String>,
}

fn split_link(link: &str) -> LinkParts {
    let link = link.trim();
    if let Ok(u) = Url::parse(link) {
        return LinkParts {
            path: u.path().to_string(),
            query: u.query_pairs().into_owned().collect(),
        };
    }
    let (path, query) = link.split_once('?').unwrap_or((link, ""));
    LinkParts {
        path: path.to_string(),
        query: url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
    }
}

impl Rule {
    fn match_link(&self, link: &LinkParts) -> Option<Reference> {
        let cap = |re: &Regex| {
            re.captures(&link.path)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };
        let param = |name: &str| {
            link.query
                .get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        match self {
            Rule::Season => cap(&RE_SEASON).map(Reference::Season),
            Rule::Show => cap(&RE_SHOW).map(Reference::Show),
            Rule::Episode => cap(&RE_EPISODE).map(Reference::Episode),
            Rule::Item => param("bvid")
                .filter(|v| is_item_id(v))
                .or_else(|| cap(&RE_ITEM))
                .map(Reference::Item),
            Rule::LinkCid => param("cid").filter(|v| is_numeric_id(v)).map(Reference::Direct),
            Rule::ExplicitFields => None,
        }
    }
}

/// First non-blank explicit field, checked against the shape its link rule accepts.
/// A present but malformed field is unresolvable; later fields are not consulted.
fn explicit_reference(input: &ResolveInput) -> CatalogResult<Option<Reference>> {
    let field = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let numeric = |name: &str, raw: &str, prefix: &str| {
        let id = strip_prefix_ci(raw, prefix);
        if is_numeric_id(&id) {
            Ok(id)
        } else {
            Err(CatalogError::Unresolvable(format!("{name} {raw:?} is not a numeric id")))
        }
    };
    if let Some(raw) = field(&input.season_id) {
        return numeric("season id", &raw, "ss").map(|id| Some(Reference::Season(id)));
    }
    if let Some(raw) = field(&input.show_id) {
        return numeric("show id", &raw, "md").map(|id| Some(Reference::Show(id)));
    }
    if let Some(raw) = field(&input.item_id) {
        if !is_item_id(&raw) {
            return Err(CatalogError::Unresolvable(format!("item id {raw:?} is malformed")));
        }
        return Ok(Some(Reference::Item(raw)));
    }
    if let Some(raw) = field(&input.explicit_id) {
        return numeric("explicit id", &raw, "").map(|id| Some(Reference::Direct(id)));
    }
    Ok(None)
}

fn strip_prefix_ci(s: &str, prefix: &str) -> String {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => s[prefix.len()..].to_string(),
        _ => s.to_string(),
    }
}

/// Pick the reference for an input: link rules first (on the link, then the episode
/// path), then explicit fields.
pub fn match_input(input: &ResolveInput) -> CatalogResult<(Rule, Reference)> {
    let links = [input.link.as_deref(), input.episode_path.as_deref()];
    for link in links.into_iter().flatten().filter(|l| !l.trim().is_empty()) {
        let parts = split_link(link);
        for rule in LINK_RULES {
            if let Some(r) = rule.match_link(&parts) {
                return Ok((rule, r));
            }
        }
    }
    explicit_reference(input)?
        .map(|r| (Rule::ExplicitFields, r))
        .ok_or_else(|| {
            CatalogError::Unresolvable(
                input
                    .link
                    .clone()
                    .or_else(|| input.episode_path.clone())
                    .unwrap_or_else(|| "no link and no id fields".to_string()),
            )
        })
}

/// Dependent lookups against the content backend. Ids are returned as strings.
#[async_trait]
pub trait ResolverBackend: Send + Sync {
    /// Show id → season id.
    async fn season_of_show(&self, show_id: &str) -> CatalogResult<String>;
    /// Season id → canonical ids of its main episodes, in order.
    async fn season_episodes(&self, season_id: &str) -> CatalogResult<Vec<String>>;
    /// Episode id → canonical ids of the episodes in its view, the episode first.
    async fn episode_view(&self, episode_id: &str) -> CatalogResult<Vec<String>>;
    /// Item id → canonical ids of its parts, in order.
    async fn item_parts(&self, item_id: &str) -> CatalogResult<Vec<String>>;
    /// Comment feed for a canonical id, verbatim.
    async fn comment_feed(&self, canonical_id: &str) -> CatalogResult<String>;
}

#[derive(Clone)]
pub struct IdentifierResolver {
    backend: Arc<dyn ResolverBackend>,
}

impl IdentifierResolver {
    pub fn new(backend: Arc<dyn ResolverBackend>) -> Self {
        ensure_metrics_described();
        Self { backend }
    }

    pub async fn resolve(&self, input: &ResolveInput) -> CatalogResult<ResolvedId> {
        let result = self.resolve_inner(input).await;
        match &result {
            Ok(r) => {
                tracing::info!(target: "resolve", rule = ?r.rule, canonical_id = %r.canonical_id, "resolved")
            }
            Err(e) => {
                counter!("resolve_failures_total", "kind" => e.kind()).increment(1);
                tracing::warn!(target: "resolve", error = %e, "resolution failed");
            }
        }
        result
    }

    async fn resolve_inner(&self, input: &ResolveInput) -> CatalogResult<ResolvedId> {
        let (rule, reference) = match_input(input)?;
        tracing::debug!(target: "resolve", ?rule, ?reference, "matched");
        let ep = input.ep.unwrap_or(1);
        let part = input
            .p
            .or_else(|| {
                input
                    .link
                    .as_deref()
                    .and_then(|l| split_link(l).query.get("p").and_then(|v| v.parse().ok()))
            })
            .unwrap_or(1);

        let canonical_id = match reference {
            Reference::Season(season_id) => {
                let eps = self.backend.season_episodes(&season_id).await?;
                pick_index(&eps, ep, "episode")?
            }
            Reference::Show(show_id) => {
                let season_id = self.backend.season_of_show(&show_id).await?;
                let eps = self.backend.season_episodes(&season_id).await?;
                pick_index(&eps, ep, "episode")?
            }
            Reference::Episode(ep_id) => {
                let eps = self.backend.episode_view(&ep_id).await?;
                pick_index(&eps, 1, "episode")?
            }
            Reference::Item(item_id) => {
                let parts = self.backend.item_parts(&item_id).await?;
                pick_index(&parts, part, "part")?
            }
            Reference::Direct(id) => id,
        };
        Ok(ResolvedId { canonical_id, rule })
    }

    /// Resolve, then fetch the comment feed for the resolved id.
    pub async fn comment_feed(&self, input: &ResolveInput) -> CatalogResult<(ResolvedId, String)> {
        let resolved = self.resolve(input).await?;
        let body = self.backend.comment_feed(&resolved.canonical_id).await?;
        Ok((resolved, body))
    }
}

/// 1-based lookup; 0 and past-the-end are both NotFound.
fn pick_index(list: &[String], index: u32, what: &str) -> CatalogResult<String> {
    index
        .checked_sub(1)
        .and_then(|i| list.get(i as usize))
        .cloned()
        .ok_or_else(|| {
            CatalogError::NotFound(format!("{what} {index} not in list of {}", list.len()))
        })
}

/// Backend speaking the public video-site JSON API over a [`Transport`].
pub struct HttpResolverBackend {
    transport: Arc<dyn Transport>,
    api_base: String,
    comment_base: String,
    timeout: Duration,
    headers: BTreeMap<String, String>,
}

impl HttpResolverBackend {
    pub fn new(
        transport: Arc<dyn Transport>,
        api_base: &str,
        comment_base: &str,
        timeout: Duration,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), USER_AGENT.to_string());
        headers.insert("Referer".to_string(), "https://www.bilibili.com/".to_string());
        Self {
            transport,
            api_base: api_base.trim_end_matches('/').to_string(),
            comment_base: comment_base.trim_end_matches('/').to_string(),
            timeout,
            headers,
        }
    }

    async fn get_text(&self, url: &str) -> CatalogResult<String> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let resp = tokio::time::timeout(self.timeout, self.transport.get(url, &self.headers, self.timeout))
            .await
            .map_err(|_| CatalogError::Timeout(timeout_ms))??;
        if !resp.is_success() {
            return Err(CatalogError::Http {
                status: resp.status,
                detail: resp.body.chars().take(100).collect(),
            });
        }
        Ok(resp.body)
    }

    /// `api_base` + `path` with one query pair, percent-encoded.
    fn api_url(&self, path: &str, name: &str, value: &str) -> CatalogResult<Url> {
        let mut url = Url::parse(&format!("{}{}", self.api_base, path))
            .map_err(|e| CatalogError::Config(format!("resolver api base: {e}")))?;
        url.query_pairs_mut().append_pair(name, value);
        Ok(url)
    }

    /// GET `url`, check the `{code, message, data|result}` envelope, return the body.
    async fn fetch_api(&self, url: Url) -> CatalogResult<Value> {
        let path = url.path().to_string();
        let mut v: Value = serde_json::from_str(&self.get_text(url.as_str()).await?)?;
        let code = v.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = v
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream reported an error");
            return Err(CatalogError::Http {
                status: 200,
                detail: format!("code {code}: {msg}"),
            });
        }
        ["data", "result"]
            .iter()
            .find_map(|f| v.get_mut(*f).map(Value::take).filter(|d| !d.is_null()))
            .ok_or_else(|| CatalogError::Malformed(format!("no data in response from {path}")))
    }
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// `cid` of each entry under `pointer`; a missing list is an empty list.
fn cids_at(data: &Value, pointer: &str) -> Vec<String> {
    data.pointer(pointer)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|e| e.get("cid").and_then(id_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ResolverBackend for HttpResolverBackend {
    async fn season_of_show(&self, show_id: &str) -> CatalogResult<String> {
        let data = self
            .fetch_api(self.api_url("/pgc/review/user", "media_id", show_id)?)
            .await?;
        data.pointer("/media/season_id")
            .and_then(id_string)
            .ok_or_else(|| CatalogError::NotFound(format!("no season for show {show_id}")))
    }

    async fn season_episodes(&self, season_id: &str) -> CatalogResult<Vec<String>> {
        let data = self
            .fetch_api(self.api_url("/pgc/web/season/section", "season_id", season_id)?)
            .await?;
        Ok(cids_at(&data, "/main_section/episodes"))
    }

    async fn episode_view(&self, episode_id: &str) -> CatalogResult<Vec<String>> {
        let data = self
            .fetch_api(self.api_url("/pgc/view/web/season", "ep_id", episode_id)?)
            .await?;
        Ok(cids_at(&data, "/episodes"))
    }

    async fn item_parts(&self, item_id: &str) -> CatalogResult<Vec<String>> {
        let data = self
            .fetch_api(self.api_url("/x/web-interface/view", "bvid", item_id)?)
            .await?;
        Ok(cids_at(&data, "/pages"))
    }

    async fn comment_feed(&self, canonical_id: &str) -> CatalogResult<String> {
        let mut url = Url::parse(&self.comment_base)
            .map_err(|e| CatalogError::Config(format!("resolver comment base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| CatalogError::Config("resolver comment base cannot hold a path".into()))?
            .pop_if_empty()
            .push(&format!("{canonical_id}.xml"));
        self.get_text(url.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn record(&self, s: String) {
            self.calls.lock().unwrap().push(s);
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResolverBackend for FakeBackend {
        async fn season_of_show(&self, show_id: &str) -> CatalogResult<String> {
            self.record(format!("show:{show_id}"));
            Ok("77".into())
        }
        async fn season_episodes(&self, season_id: &str) -> CatalogResult<Vec<String>> {
            self.record(format!("season:{season_id}"));
            Ok(vec!["c1".into(), "c2".into(), "c3".into()])
        }
        async fn episode_view(&self, episode_id: &str) -> CatalogResult<Vec<String>> {
            self.record(format!("episode:{episode_id}"));
            Ok(vec!["e1".into(), "e2".into()])
        }
        async fn item_parts(&self, item_id: &str) -> CatalogResult<Vec<String>> {
            self.record(format!("item:{item_id}"));
            Ok(vec!["p1".into(), "p2".into()])
        }
        async fn comment_feed(&self, canonical_id: &str) -> CatalogResult<String> {
            Ok(format!("<i>{canonical_id}</i>"))
        }
    }

    fn resolver() -> (Arc<FakeBackend>, IdentifierResolver) {
        let b = Arc::new(FakeBackend::default());
        (b.clone(), IdentifierResolver::new(b))
    }

    #[test]
    fn rule_matching_order() {
        let m = |l: &str| match_input(&ResolveInput::link(l)).map(|(r, _)| r);
        assert_eq!(m("https://www.bilibili.com/bangumi/play/ss33802").unwrap(), Rule::Season);
        assert_eq!(m("https://www.bilibili.com/bangumi/media/md28229233").unwrap(), Rule::Show);
        assert_eq!(m("https://www.bilibili.com/bangumi/play/ep123456").unwrap(), Rule::Episode);
        assert_eq!(m("ep123456").unwrap(), Rule::Episode);
        assert_eq!(m("https://www.bilibili.com/video/BV1xx411c7mD?p=2").unwrap(), Rule::Item);
        assert_eq!(m("https://player.example/x?bvid=BV1xx411c7mD").unwrap(), Rule::Item);
        assert_eq!(m("https://player.example/x?cid=42").unwrap(), Rule::LinkCid);
        assert!(matches!(
            m("https://example.com/nothing"),
            Err(CatalogError::Unresolvable(_))
        ));
    }

    #[tokio::test]
    async fn season_link_uses_one_based_episode_index() {
        let (b, r) = resolver();
        let mut input = ResolveInput::link("https://www.bilibili.com/bangumi/play/ss100");
        input.ep = Some(2);
        let out = r.resolve(&input).await.unwrap();
        assert_eq!(out.canonical_id, "c2");
        assert_eq!(b.calls(), vec!["season:100"]);
    }

    #[tokio::test]
    async fn out_of_range_episode_is_not_found_without_fallthrough() {
        let (b, r) = resolver();
        let mut input = ResolveInput::link("https://www.bilibili.com/bangumi/play/ss100");
        input.ep = Some(4);
        input.explicit_id = Some("999".into());
        assert!(matches!(r.resolve(&input).await, Err(CatalogError::NotFound(_))));
        assert_eq!(b.calls(), vec!["season:100"]);

        input.ep = Some(0);
        assert!(matches!(r.resolve(&input).await, Err(CatalogError::NotFound(_))));
    }

    #[tokio::test]
    async fn show_needs_two_lookups_episode_one() {
        let (b, r) = resolver();
        let out = r.resolve(&ResolveInput::link("md28229233")).await.unwrap();
        assert_eq!(out.canonical_id, "c1");
        assert_eq!(b.calls(), vec!["show:28229233", "season:77"]);

        let (b, r) = resolver();
        let out = r.resolve(&ResolveInput::link("ep123456")).await.unwrap();
        assert_eq!(out.canonical_id, "e1");
        assert_eq!(b.calls(), vec!["episode:123456"]);
    }

    #[tokio::test]
    async fn item_part_from_link_query_or_field() {
        let (_, r) = resolver();
        let out = r
            .resolve(&ResolveInput::link("https://www.bilibili.com/video/BV1xx411c7mD?p=2"))
            .await
            .unwrap();
        assert_eq!(out.canonical_id, "p2");
    }

    #[tokio::test]
    async fn explicit_fields_are_the_fallback() {
        let (b, r) = resolver();
        let input = ResolveInput {
            show_id: Some("md5".into()),
            ..ResolveInput::default()
        };
        assert_eq!(r.resolve(&input).await.unwrap().rule, Rule::ExplicitFields);
        assert_eq!(b.calls()[0], "show:5");

        let input = ResolveInput {
            explicit_id: Some("31415".into()),
            ..ResolveInput::default()
        };
        let (id, feed) = r.comment_feed(&input).await.unwrap();
        assert_eq!(id.canonical_id, "31415");
        assert_eq!(feed, "<i>31415</i>");

        assert!(matches!(
            r.resolve(&ResolveInput::default()).await,
            Err(CatalogError::Unresolvable(_))
        ));
    }

    #[test]
    fn camel_case_field_names_are_accepted() {
        let input: ResolveInput = serde_json::from_value(serde_json::json!({
            "seasonId": "100", "episodeIndex": 2
        }))
        .unwrap();
        assert_eq!(input.season_id.as_deref(), Some("100"));
        assert_eq!(input.ep, Some(2));

        let input: ResolveInput =
            serde_json::from_value(serde_json::json!({"episodePath": "ep123456"})).unwrap();
        let (rule, reference) = match_input(&input).unwrap();
        assert_eq!(rule, Rule::Episode);
        assert_eq!(reference, Reference::Episode("123456".into()));

        let input: ResolveInput =
            serde_json::from_value(serde_json::json!({"showId": "md7", "explicitId": "9"})).unwrap();
        assert_eq!(match_input(&input).unwrap().1, Reference::Show("7".into()));
    }

    #[tokio::test]
    async fn malformed_explicit_fields_are_unresolvable() {
        let (b, r) = resolver();
        for input in [
            ResolveInput { season_id: Some("12a".into()), ..ResolveInput::default() },
            ResolveInput { show_id: Some("md".into()), ..ResolveInput::default() },
            ResolveInput { item_id: Some("BV1&x=evil".into()), ..ResolveInput::default() },
            ResolveInput { explicit_id: Some("../admin/secret?".into()), ..ResolveInput::default() },
        ] {
            assert!(
                matches!(r.resolve(&input).await, Err(CatalogError::Unresolvable(_))),
                "{input:?}"
            );
        }
        assert!(b.calls().is_empty());

        // A link query parameter of the wrong shape is not a match either.
        assert!(matches!(
            match_input(&ResolveInput::link("https://player.example/x?cid=4%2F2")),
            Err(CatalogError::Unresolvable(_))
        ));
    }
}
