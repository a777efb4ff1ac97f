//! Connection authorization hooks.
//!
//! A [`SessionManager`](crate::SessionManager) consults one [`Authorizer`]
//! before it reserves a slot or spawns anything. Denied clients get a
//! `CLOSE("unauthorized")` and nothing else.
//!
//! Shipped implementations:
//! - [`AllowAll`]: development mode
//! - [`SharedSecret`]: constant-time comparison against a configured key
//! - [`OriginAllowlist`]: browser Origin check against an allowlist
//! - [`AuthChain`]: every member must allow
//!
//! Any `Fn(&ConnectionInfo) -> AuthDecision` is an authorizer as well.

use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::transport::{ConnectionInfo, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    /// Refused; the string is for the server log, not the client.
    Deny(String),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow)
    }
}

pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, info: &ConnectionInfo) -> AuthDecision;
}

impl<F> Authorizer for F
where
    F: Fn(&ConnectionInfo) -> AuthDecision + Send + Sync + 'static,
{
    fn authorize(&self, info: &ConnectionInfo) -> AuthDecision {
        self(info)
    }
}

// ---------------------------------------------------------------------------
// AllowAll
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _info: &ConnectionInfo) -> AuthDecision {
        AuthDecision::Allow
    }
}

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Requires the client to present a pre-shared key.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Arc<String>,
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::new(secret.into()),
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl Authorizer for SharedSecret {
    fn authorize(&self, info: &ConnectionInfo) -> AuthDecision {
        match &info.token {
            Some(token) if bool::from(token.as_bytes().ct_eq(self.secret.as_bytes())) => {
                AuthDecision::Allow
            }
            Some(_) => AuthDecision::Deny("invalid api key".into()),
            None => AuthDecision::Deny("missing api key".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// OriginAllowlist
// ---------------------------------------------------------------------------

/// Origins a browser may connect from when no allowlist is configured but
/// origin checking is wanted.
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost",
    "https://localhost",
    "http://127.0.0.1",
    "https://127.0.0.1",
    "http://[::1]",
    "https://[::1]",
];

/// Guards against cross-site WebSocket hijacking.
///
/// Browsers do not apply CORS to WebSocket upgrades; they only report the
/// page's Origin. WebSocket clients must send an Origin that matches an entry
/// exactly or as `entry:port`. Other transports carry no Origin and pass.
#[derive(Debug, Clone)]
pub struct OriginAllowlist {
    allowed: Vec<String>,
}

impl OriginAllowlist {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    pub fn localhost() -> Self {
        Self::new(DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect())
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.allowed.iter().any(|allowed| {
            if origin == allowed {
                return true;
            }
            // "http://localhost:3000" matches "http://localhost"
            origin
                .strip_prefix(allowed.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        })
    }
}

impl Authorizer for OriginAllowlist {
    fn authorize(&self, info: &ConnectionInfo) -> AuthDecision {
        if info.transport != TransportKind::WebSocket {
            return AuthDecision::Allow;
        }
        match &info.origin {
            Some(origin) if self.is_allowed(origin) => AuthDecision::Allow,
            Some(origin) => AuthDecision::Deny(format!("origin {origin} not allowed")),
            None => AuthDecision::Deny("missing origin".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthChain
// ---------------------------------------------------------------------------

/// All members must allow; the first denial wins. Empty chains allow.
#[derive(Clone, Default)]
pub struct AuthChain {
    members: Vec<Arc<dyn Authorizer>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, authorizer: impl Authorizer) -> Self {
        self.members.push(Arc::new(authorizer));
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Authorizer for AuthChain {
    fn authorize(&self, info: &ConnectionInfo) -> AuthDecision {
        for member in &self.members {
            let decision = member.authorize(info);
            if !decision.is_allowed() {
                return decision;
            }
        }
        AuthDecision::Allow
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
