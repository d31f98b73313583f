//! Error taxonomy shared by every operation of the aggregator.
//!
//! Per-source failures during a fan-out never surface as `Err`; they are recorded as a
//! [`FailureKind`](crate::dispatch::FailureKind) on the source's outcome. `CatalogError`
//! is what an operation returns when the *whole* call cannot proceed.

use thiserror::Error;

/// Terminal error of a catalog operation.
///
/// Variants carry plain `String` context so the error stays `Clone`: followers of a
/// single-flight cache load receive a copy of the leader's error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// Transport-level failure (DNS, connection refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx status, or an upstream envelope that reports failure.
    #[error("upstream returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    /// Deadline exceeded.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Payload not parseable into an expected envelope.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// A resolution index or entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// No resolution pattern matched and no explicit id was given.
    #[error("unresolvable input: {0}")]
    Unresolvable(String),

    /// Rejected by the auth gate.
    #[error("unauthorized")]
    Unauthorized,

    /// Query is malformed (e.g. no resolvable sources).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Source list or runtime configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CatalogError {
    /// Short machine-readable tag, used for metric labels and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogError::Network(_) => "network",
            CatalogError::Http { .. } => "http",
            CatalogError::Timeout(_) => "timeout",
            CatalogError::Malformed(_) => "malformed",
            CatalogError::NotFound(_) => "not_found",
            CatalogError::Unresolvable(_) => "unresolvable",
            CatalogError::Unauthorized => "unauthorized",
            CatalogError::InvalidQuery(_) => "invalid_query",
            CatalogError::Config(_) => "config",
        }
    }

    /// HTTP status the API layer answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            CatalogError::InvalidQuery(_) => 400,
            CatalogError::Unauthorized => 401,
            CatalogError::NotFound(_) => 404,
            CatalogError::Unresolvable(_) => 422,
            CatalogError::Network(_) | CatalogError::Http { .. } | CatalogError::Malformed(_) => {
                502
            }
            CatalogError::Timeout(_) => 504,
            CatalogError::Config(_) => 500,
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Malformed(e.to_string())
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;
