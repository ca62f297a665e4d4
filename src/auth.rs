//! Static token authentication with multi-identity credentials
//!
//! The registry is built once at startup from the configured identity->token
//! mapping and stored as a token->identity reverse index. It is immutable
//! afterwards, so concurrent connections can consult it without locking.

use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;
use std::collections::HashMap;

/// Header carrying the API key when no bearer token is present
const X_API_KEY: &str = "x-api-key";

/// Outcome of an authentication check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Request accepted. The identity is absent when authentication is
    /// disabled (empty registry).
    Allowed { identity: Option<String> },
    /// Request rejected: credentials configured and the token did not match
    Denied,
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allowed { .. })
    }
}

/// Immutable token -> identity lookup
pub struct CredentialRegistry {
    tokens: HashMap<String, String>,
}

impl CredentialRegistry {
    /// Build the reverse index from an identity -> token mapping
    ///
    /// If two identities share a token, the last one inserted wins; tokens
    /// are expected to be unique per identity.
    pub fn new(identities: &HashMap<String, String>) -> Self {
        let tokens = identities
            .iter()
            .map(|(identity, token)| (token.clone(), identity.clone()))
            .collect();
        Self { tokens }
    }

    /// Whether any credentials are configured
    pub fn enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Check a presented token against the registry
    ///
    /// With an empty registry every request is allowed without an identity.
    /// Otherwise only an exact match is allowed; a missing or empty token is
    /// denied like any other mismatch.
    pub fn authenticate(&self, token: Option<&str>) -> AuthDecision {
        if self.tokens.is_empty() {
            return AuthDecision::Allowed { identity: None };
        }

        match token.filter(|t| !t.is_empty()).and_then(|t| self.tokens.get(t)) {
            Some(identity) => AuthDecision::Allowed {
                identity: Some(identity.clone()),
            },
            None => AuthDecision::Denied,
        }
    }
}

/// Extract the credential token from request headers
///
/// A bearer-scheme Authorization header is preferred; the X-API-Key header
/// is the fallback. No other source is consulted.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    headers
        .get(X_API_KEY)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
