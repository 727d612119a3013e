//! Identity and Authorization Adapters
//!
//! Bundled implementations of the identity and access ports:
//!
//! - [`JwtIdentityVerifier`]: verifies HS256 bearer tokens locally
//! - [`StaticAccessPolicy`]: portfolio grant table loaded from
//!   configuration, for tests and single-tenant deployments
//!
//! Production deployments point the ports at real identity/authorization
//! services; the fan-out server only depends on the contracts.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use crate::application::ports::identity::{
    AccessError, AccessPort, AuthenticationError, Identity, IdentityPort,
};

// =============================================================================
// JWT Identity Verifier
// =============================================================================

/// Claims expected in a relay bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier.
    pub sub: String,
    /// Expiry as a unix timestamp.
    pub exp: usize,
}

/// Verifies HS256-signed bearer tokens against a shared secret.
pub struct JwtIdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    /// Create a verifier for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl IdentityPort for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthenticationError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthenticationError::Expired,
                _ => AuthenticationError::Invalid(e.to_string()),
            }
        })?;

        Ok(Identity::new(data.claims.sub))
    }
}

// =============================================================================
// Static Access Policy
// =============================================================================

/// Portfolio grant table keyed by subject.
///
/// Grant spec format: `subject:ID1,ID2;subject2:ID3`. Unknown subjects,
/// unknown portfolios, and non-portfolio resource types all deny.
#[derive(Debug, Default)]
pub struct StaticAccessPolicy {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticAccessPolicy {
    /// Create an empty policy that denies everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a grant spec such as `alice:P1,P2;bob:P3`.
    ///
    /// Entries without a subject or with no ids are ignored.
    #[must_use]
    pub fn from_spec(spec: &str) -> Self {
        let mut grants: HashMap<String, HashSet<String>> = HashMap::new();

        for entry in spec.split(';') {
            let Some((subject, ids)) = entry.split_once(':') else {
                continue;
            };
            let subject = subject.trim();
            if subject.is_empty() {
                continue;
            }

            let portfolio_ids: HashSet<String> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect();

            if !portfolio_ids.is_empty() {
                grants
                    .entry(subject.to_string())
                    .or_default()
                    .extend(portfolio_ids);
            }
        }

        Self { grants }
    }

    /// Grant `subject` access to `portfolio_id`.
    pub fn grant(&mut self, subject: &str, portfolio_id: &str) {
        self.grants
            .entry(subject.to_string())
            .or_default()
            .insert(portfolio_id.to_string());
    }
}

#[async_trait]
impl AccessPort for StaticAccessPolicy {
    async fn check(
        &self,
        identity: &Identity,
        resource_type: &str,
        resource_id: &str,
        _action: &str,
    ) -> Result<bool, AccessError> {
        if resource_type != "portfolio" {
            return Ok(false);
        }

        Ok(self
            .grants
            .get(&identity.subject)
            .is_some_and(|ids| ids.contains(resource_id)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;

    const SECRET: &str = "test-secret";

    fn token_for(subject: &str, exp: usize) -> String {
        encode(
            &Header::default(),
            &Claims {
                sub: subject.to_string(),
                exp,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> usize {
        4_102_444_800 // 2100-01-01
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let verifier = JwtIdentityVerifier::new(SECRET);
        let token = token_for("alice", far_future());

        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.subject, "alice");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let verifier = JwtIdentityVerifier::new(SECRET);
        let token = token_for("alice", 1_000_000);

        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthenticationError::Expired));
    }

    #[tokio::test]
    async fn token_with_wrong_secret_is_rejected() {
        let verifier = JwtIdentityVerifier::new("other-secret");
        let token = token_for("alice", far_future());

        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthenticationError::Invalid(_)));
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let verifier = JwtIdentityVerifier::new(SECRET);
        let err = verifier.verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthenticationError::Invalid(_)));
    }

    #[tokio::test]
    async fn grant_spec_parses_multiple_subjects() {
        let policy = StaticAccessPolicy::from_spec("alice:P1,P2;bob:P3");
        let alice = Identity::new("alice");
        let bob = Identity::new("bob");

        assert!(policy.check(&alice, "portfolio", "P1", "read").await.unwrap());
        assert!(policy.check(&alice, "portfolio", "P2", "read").await.unwrap());
        assert!(!policy.check(&alice, "portfolio", "P3", "read").await.unwrap());
        assert!(policy.check(&bob, "portfolio", "P3", "read").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_subject_is_denied() {
        let policy = StaticAccessPolicy::from_spec("alice:P1");
        let mallory = Identity::new("mallory");

        assert!(!policy.check(&mallory, "portfolio", "P1", "read").await.unwrap());
    }

    #[tokio::test]
    async fn non_portfolio_resource_is_denied() {
        let policy = StaticAccessPolicy::from_spec("alice:P1");
        let alice = Identity::new("alice");

        assert!(!policy.check(&alice, "account", "P1", "read").await.unwrap());
    }

    #[test]
    fn malformed_spec_entries_are_ignored() {
        let policy = StaticAccessPolicy::from_spec("alice:P1;;no-colon;:P9;carol:");
        assert_eq!(policy.grants.len(), 1);
        assert!(policy.grants.contains_key("alice"));
    }

    #[tokio::test]
    async fn grant_adds_access() {
        let mut policy = StaticAccessPolicy::new();
        let alice = Identity::new("alice");
        assert!(!policy.check(&alice, "portfolio", "P1", "read").await.unwrap());

        policy.grant("alice", "P1");
        assert!(policy.check(&alice, "portfolio", "P1", "read").await.unwrap());
    }
}
