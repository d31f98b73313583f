// src/api.rs
//! Thin axum surface over [`CatalogService`]. Every route except `/health` and
//! `/metrics` passes the auth gate first.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::aggregate::{Filters, SortRule};
use crate::auth::{AuthGate, Role};
use crate::cache::CacheStatus;
use crate::error::CatalogError;
use crate::metrics::Metrics;
use crate::resolve::ResolveInput;
use crate::service::{CatalogQuery, CatalogService};

pub const CACHE_HEADER: &str = "x-cache";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CatalogService>,
    pub gate: Arc<dyn AuthGate>,
}

pub fn router(state: AppState, metrics: Option<Metrics>) -> Router {
    let mut app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/sources", get(list_sources))
        .route("/api/search", get(search))
        .route("/api/browse", get(browse))
        .route("/api/categories", get(categories))
        .route("/api/source-test", post(source_test))
        .route("/api/resolve", get(resolve))
        .route("/api/danmaku", get(danmaku))
        .route("/admin/reload-sources", post(reload_sources));
    if let Some(m) = metrics {
        app = app.merge(m.router::<AppState>());
    }
    app.layer(CorsLayer::very_permissive()).with_state(state)
}

/// JSON error body with the status derived from the error kind.
#[derive(Debug)]
pub struct ApiError(pub CatalogError);

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(r: QueryRejection) -> Self {
        Self(CatalogError::InvalidQuery(r.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self {
        Self(CatalogError::InvalidQuery(r.body_text()))
    }
}

/// `Query` whose rejection is rendered like every other error.
#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
struct ApiQuery<T>(T);

/// `Json` whose rejection is rendered like every other error.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

type ApiResult<T> = Result<T, ApiError>;

fn require(state: &AppState, headers: &HeaderMap, role: Role) -> ApiResult<()> {
    if state.gate.is_authorized(headers, role) {
        Ok(())
    } else {
        Err(CatalogError::Unauthorized.into())
    }
}

fn with_cache_header<T: Serialize>(value: T, status: CacheStatus) -> Response {
    let mut resp = Json(value).into_response();
    resp.headers_mut().insert(
        CACHE_HEADER,
        HeaderValue::from_static(status.as_header()),
    );
    resp
}

fn split_keys(raw: Option<&str>) -> Option<Vec<String>> {
    let keys: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();
    (!keys.is_empty()).then_some(keys)
}

fn parse_sort(raw: Option<&str>) -> ApiResult<SortRule> {
    Ok(raw.unwrap_or_default().parse::<SortRule>()?)
}

async fn list_sources(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    require(&state, &headers, Role::User)?;
    Ok(Json(state.service.list_sources()).into_response())
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(alias = "wd", alias = "keyword")]
    q: String,
    #[serde(default)]
    sources: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    sort: Option<String>,
    /// Secondary filter over title and remarks.
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    year: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(p): ApiQuery<SearchParams>,
) -> ApiResult<Response> {
    require(&state, &headers, Role::User)?;
    let mut query = CatalogQuery::search(&p.q)
        .page(p.page.unwrap_or(1))
        .sort(parse_sort(p.sort.as_deref())?)
        .filters(Filters::new(p.filter.as_deref(), p.year.as_deref()));
    if let Some(keys) = split_keys(p.sources.as_deref()) {
        query = query.sources(keys);
    }
    if let Some(ms) = p.timeout_ms {
        query = query.timeout_ms(ms);
    }
    let (result, status) = state.service.search(query).await?;
    Ok(with_cache_header(result, status))
}

#[derive(Debug, Deserialize)]
struct BrowseParams {
    source: String,
    #[serde(alias = "t")]
    category: String,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    sort: Option<String>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    year: Option<String>,
}

async fn browse(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(p): ApiQuery<BrowseParams>,
) -> ApiResult<Response> {
    require(&state, &headers, Role::Admin)?;
    let query = CatalogQuery::browse(&p.source, &p.category, p.page.unwrap_or(1))
        .sort(parse_sort(p.sort.as_deref())?)
        .filters(Filters::new(p.filter.as_deref(), p.year.as_deref()));
    let (result, status) = state.service.execute(query).await?;
    Ok(with_cache_header(result, status))
}

#[derive(Debug, Deserialize)]
struct CategoriesParams {
    source: String,
}

async fn categories(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(p): ApiQuery<CategoriesParams>,
) -> ApiResult<Response> {
    require(&state, &headers, Role::Admin)?;
    let (cats, status) = state.service.list_categories(&p.source).await?;
    Ok(with_cache_header(cats, status))
}

#[derive(Debug, Deserialize)]
struct SourceTestReq {
    #[serde(default)]
    sources: Vec<String>,
    keyword: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn source_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SourceTestReq>,
) -> ApiResult<Response> {
    require(&state, &headers, Role::Admin)?;
    let report = state
        .service
        .test_sources(&req.sources, &req.keyword, req.timeout_ms)
        .await?;
    Ok(Json(report).into_response())
}

async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(input): ApiQuery<ResolveInput>,
) -> ApiResult<Response> {
    require(&state, &headers, Role::User)?;
    let (resolved, status) = state.service.resolve_identifier(&input).await?;
    Ok(with_cache_header(resolved, status))
}

async fn danmaku(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(input): ApiQuery<ResolveInput>,
) -> ApiResult<Response> {
    require(&state, &headers, Role::User)?;
    let (resolved, xml) = state.service.fetch_comment_feed(&input).await?;
    let mut resp = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/xml; charset=utf-8"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        xml,
    )
        .into_response();
    if let Ok(v) = HeaderValue::from_str(&resolved.canonical_id) {
        resp.headers_mut().insert("x-canonical-id", v);
    }
    Ok(resp)
}

#[derive(Serialize)]
struct ReloadOut {
    sources: usize,
}

async fn reload_sources(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    require(&state, &headers, Role::Admin)?;
    let n = state.service.reload_sources()?;
    Ok(Json(ReloadOut { sources: n }).into_response())
}
