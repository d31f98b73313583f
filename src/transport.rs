// src/transport.rs
//! HTTP transport seam. The dispatcher and the resolver only see [`Transport`];
//! production wires [`ReqwestTransport`], tests wire [`StubTransport`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CatalogError, CatalogResult};

pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Bounded, cancellable GET. Dropping the returned future cancels the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> CatalogResult<TransportResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(4))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> CatalogResult<TransportResponse> {
        let mut req = self.client.get(url).timeout(timeout);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.map_err(|e| map_reqwest(e, timeout))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| map_reqwest(e, timeout))?;
        Ok(TransportResponse { status, body })
    }
}

fn map_reqwest(e: reqwest::Error, timeout: Duration) -> CatalogError {
    if e.is_timeout() {
        CatalogError::Timeout(timeout.as_millis() as u64)
    } else if e.is_decode() || e.is_body() {
        CatalogError::Malformed(e.to_string())
    } else {
        CatalogError::Network(e.to_string())
    }
}

// --- Test helper ---

/// What a stubbed endpoint does when called.
#[derive(Debug, Clone)]
pub enum StubReply {
    Respond { status: u16, body: String },
    NetworkError(String),
    /// Never answers; only a deadline gets the caller out.
    Hang,
}

#[derive(Debug, Clone)]
struct StubRoute {
    prefix: String,
    delay: Duration,
    reply: StubReply,
}

/// One recorded upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubCall {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

/// Scripted in-process transport. Routes are matched by URL prefix, first match wins.
/// Every call is recorded with its headers so tests can inspect upstream traffic.
#[derive(Debug, Default)]
pub struct StubTransport {
    routes: Mutex<Vec<StubRoute>>,
    calls: Mutex<Vec<StubCall>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, prefix: &str, delay: Duration, reply: StubReply) -> Self {
        self.routes.lock().unwrap().push(StubRoute {
            prefix: prefix.to_string(),
            delay,
            reply,
        });
        self
    }

    pub fn json(self, prefix: &str, delay: Duration, body: serde_json::Value) -> Self {
        self.route(
            prefix,
            delay,
            StubReply::Respond {
                status: 200,
                body: body.to_string(),
            },
        )
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.url.clone()).collect()
    }

    /// Recorded requests whose URL starts with `prefix`, in call order.
    pub fn requests_to(&self, prefix: &str) -> Vec<StubCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> CatalogResult<TransportResponse> {
        self.calls.lock().unwrap().push(StubCall {
            url: url.to_string(),
            headers: headers.clone(),
        });
        let route = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|r| url.starts_with(&r.prefix))
            .cloned();
        let Some(route) = route else {
            return Err(CatalogError::Network(format!("no stub route for {url}")));
        };
        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
        match route.reply {
            StubReply::Respond { status, body } => Ok(TransportResponse { status, body }),
            StubReply::NetworkError(msg) => Err(CatalogError::Network(msg)),
            StubReply::Hang => std::future::pending().await,
        }
    }
}
