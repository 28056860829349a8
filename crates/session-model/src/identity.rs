//! Identity-service types and capability trait.
//!
//! The identity service owns credential verification, session issuance, and
//! the feed of session-change notifications. This engine consumes it through
//! [`IdentityClient`]; it never implements it.

use crate::error::AuthResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Opaque identifier issued by the identity service.
///
/// Exists for the lifetime of the account; this engine never mints one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a UserId from an existing identifier string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authenticated session issued by the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    /// The identity this session belongs to.
    pub user_id: UserId,
    /// Bearer token for backend calls. Opaque to this engine.
    pub access_token: String,
}

/// A credential pair presented at sign-in or sign-up.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// A session-change notification delivered by the identity service.
///
/// Notifications arrive asynchronously and must be processed in delivery
/// order; the reconciler attaches a generation to each one so superseded
/// reconciliations can be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An identity signed in (covers both plain sign-in and the sign-in
    /// that follows a successful sign-up).
    SignedIn(AuthSession),
    /// The current identity signed out.
    SignedOut,
    /// The current session's token was refreshed. No reconciliation needed.
    TokenRefreshed(AuthSession),
}

/// Capability trait for the external identity service.
///
/// Implementations are transport adapters (or test doubles); credential
/// verification, session issuance, and call timeouts are theirs, not this
/// engine's.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Query for an existing session, e.g. at process boot.
    async fn current_session(&self) -> AuthResult<Option<AuthSession>>;

    /// Authenticate with a credential.
    ///
    /// A successful call is followed by a [`SessionEvent::SignedIn`]
    /// notification on the feed; callers must not materialize a user from
    /// the returned session directly.
    async fn sign_in(&self, credential: &Credential) -> AuthResult<AuthSession>;

    /// Create a new identity.
    ///
    /// Some identity services auto-sign-in after sign-up (returning the new
    /// session) while others require confirmation first (returning `None`);
    /// either way the reconciler is driven by the notification feed.
    async fn sign_up(&self, credential: &Credential) -> AuthResult<Option<AuthSession>>;

    /// Terminate the current session.
    async fn sign_out(&self) -> AuthResult<()>;

    /// Subscribe to the session-change notification feed.
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
