// src/auth.rs
//! Bearer-token gate in front of every catalog operation.
//!
//! Tokens come from env (`OWNER_TOKEN`, `ADMIN_TOKEN`, `USER_TOKEN`); only their
//! SHA-256 digests are kept. Roles are ordered owner > admin > user.

use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Owner,
}

pub trait AuthGate: Send + Sync {
    /// Role carried by the request, if any.
    fn role_of(&self, headers: &HeaderMap) -> Option<Role>;

    fn is_authorized(&self, headers: &HeaderMap, minimum: Role) -> bool {
        self.role_of(headers).is_some_and(|r| r >= minimum)
    }
}

/// Static token table.
#[derive(Debug, Clone, Default)]
pub struct TokenGate {
    tokens: Vec<([u8; 32], Role)>,
}

impl TokenGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, role: Role) -> Self {
        let token = token.trim();
        if !token.is_empty() {
            self.tokens.push((digest(token), role));
        }
        self
    }

    pub fn from_env() -> Self {
        let mut gate = Self::new();
        for (var, role) in [
            ("OWNER_TOKEN", Role::Owner),
            ("ADMIN_TOKEN", Role::Admin),
            ("USER_TOKEN", Role::User),
        ] {
            if let Ok(t) = std::env::var(var) {
                gate = gate.with_token(&t, role);
            }
        }
        if gate.tokens.is_empty() {
            tracing::warn!("no access tokens configured; every gated request will be rejected");
        }
        gate
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl AuthGate for TokenGate {
    fn role_of(&self, headers: &HeaderMap) -> Option<Role> {
        let presented = bearer(headers)?;
        let d = digest(presented);
        // Highest role wins if the same token is configured twice.
        self.tokens
            .iter()
            .filter(|(t, _)| *t == d)
            .map(|(_, r)| *r)
            .max()
    }
}

/// Lets everything through as owner. Opt-in via `AUTH_DISABLED=1` for local runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl AuthGate for OpenGate {
    fn role_of(&self, _headers: &HeaderMap) -> Option<Role> {
        Some(Role::Owner)
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let v = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = v.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}
