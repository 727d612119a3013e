//! Identity and Authorization Ports (Driven Ports)
//!
//! Contracts for the external "verify token -> identity" and
//! "authorize resource action -> bool" capabilities. Token issuance and
//! policy storage are not this service's concern; it only consumes them.

use async_trait::async_trait;

// =============================================================================
// Identity
// =============================================================================

/// An authenticated principal attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable subject identifier.
    pub subject: String,
}

impl Identity {
    /// Create an identity for `subject`.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// Credential verification failure.
///
/// A failed verification never closes the connection; it degrades the
/// connection to public-only data until the client re-authenticates.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthenticationError {
    /// Token has expired.
    #[error("token expired")]
    Expired,

    /// Token is malformed, has a bad signature, or was revoked.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// Verifier could not be reached or timed out.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Port for the external identity capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityPort: Send + Sync {
    /// Verify a bearer token and return the identity it proves.
    async fn verify(&self, token: &str) -> Result<Identity, AuthenticationError>;
}

// =============================================================================
// Authorization
// =============================================================================

/// Authorization check failure.
///
/// Callers must fail closed: an unreachable authorization service denies,
/// never allows.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    /// Authorization service could not be reached or timed out.
    #[error("authorization service unavailable: {0}")]
    Unavailable(String),
}

/// Port for the external authorization capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessPort: Send + Sync {
    /// Whether `identity` may perform `action` on the named resource.
    async fn check(
        &self,
        identity: &Identity,
        resource_type: &str,
        resource_id: &str,
        action: &str,
    ) -> Result<bool, AccessError>;
}
