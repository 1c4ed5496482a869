//! Resolving who is on the other end of a connection, and what they're allowed to do to
//! a document. Identity resolution itself (token -> user) is an external collaborator
//! per §1, same as `DocumentStore`: this module defines the interface plus a
//! test-friendly static implementation, not a JWT/database-backed one.
//!
//! Grounded on `original_source/auth/utils.py::authenticate_websocket`: a session
//! either resolves to an identified user (via a bearer token) or, lacking one, falls
//! back to the document's own `shared_by_link`/`share_role` gate. The session is
//! refused outright only when neither applies.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::document::{Document, ShareRole};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token did not resolve to an active user")]
    InvalidToken,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Resolver backed by a fixed token -> identity table, for tests and local
/// deployments that front this service with their own auth proxy.
#[derive(Default, Clone)]
pub struct StaticIdentityResolver {
    tokens: std::collections::HashMap<String, Identity>,
}

impl StaticIdentityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Whether a session — identified or anonymous — may open a connection to `document` at
/// all. An identified session always may; an anonymous one only via the document's own
/// share-by-link gate.
#[must_use]
pub fn may_connect(identity: Option<&Identity>, document: &Document) -> bool {
    identity.is_some() || document.publicly_readable()
}

/// Whether the session may submit edits, as opposed to read-only observation.
/// `original_source` grants any resolved identity full edit rights regardless of
/// document ownership, reserving the `share_role` check for anonymous link access —
/// carried over here unchanged (see the module doc comment).
#[must_use]
pub fn may_edit(identity: Option<&Identity>, document: &Document) -> bool {
    match identity {
        Some(_) => true,
        None => document.publicly_editable(),
    }
}

#[must_use]
pub fn effective_share_role(identity: Option<&Identity>, document: &Document) -> ShareRole {
    if identity.is_some() {
        ShareRole::Edit
    } else {
        document.share_role
    }
}
