//! Error types for the session engine's external collaborators.

use thiserror::Error;

/// Errors from the identity service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The supplied credential was rejected.
    #[error("Invalid credential")]
    InvalidCredential,

    /// Sign-up was rejected because an account already exists for the
    /// credential. Distinct so the view layer can offer sign-in instead.
    #[error("Account already exists")]
    AccountExists,

    /// Transport-level failure talking to the identity service.
    #[error("Identity service unreachable: {0}")]
    Network(String),
}

/// Convenience Result type alias for identity operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors from the profile store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A record already exists for the identity (insert collision).
    #[error("Profile already exists: {0}")]
    Conflict(String),

    /// No record exists for the identity (update target missing).
    #[error("Profile not found: {0}")]
    NotFound(String),

    /// Transport-level failure talking to the store.
    #[error("Profile store unreachable: {0}")]
    Network(String),
}

/// Convenience Result type alias for profile store operations.
pub type StoreResult<T> = Result<T, StoreError>;
