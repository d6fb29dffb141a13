//! Identity resolution.
//!
//! Token verification happens upstream; the engine only needs to turn a
//! bearer credential into the stable external identity its records are
//! keyed by. Implement [`IdentityResolver`] to plug in a real verifier.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::entitlements::EntitlementError;
use crate::error::Result;

/// Maps a bearer token to a user id.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve `token`, or fail with `Unauthenticated`.
    async fn resolve(&self, token: &str) -> Result<String>;
}

/// Treats the token as the identity itself.
///
/// For deployments where a gateway has already authenticated the caller and
/// forwards the identity as the bearer value.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedIdentityResolver;

#[async_trait]
impl IdentityResolver for TrustedIdentityResolver {
    async fn resolve(&self, token: &str) -> Result<String> {
        let identity = token.trim();
        if identity.is_empty() {
            return Err(EntitlementError::Unauthenticated.into());
        }
        Ok(identity.to_string())
    }
}

/// Fixed token table. Useful for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, String>,
}

impl StaticTokenResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> Result<String> {
        self.tokens.get(token).cloned().ok_or_else(|| {
            tracing::debug!(target: "tierwise::identity", "Unknown bearer token");
            EntitlementError::Unauthenticated.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TierwiseError;

    #[tokio::test]
    async fn test_trusted_resolver() {
        let resolver = TrustedIdentityResolver;
        assert_eq!(resolver.resolve(" auth0|abc ").await.unwrap(), "auth0|abc");

        let err = resolver.resolve("   ").await.unwrap_err();
        assert!(matches!(
            err,
            TierwiseError::Entitlement(EntitlementError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticTokenResolver::new().with_token("tok_a", "user_a");
        assert_eq!(resolver.resolve("tok_a").await.unwrap(), "user_a");
        assert!(resolver.resolve("tok_b").await.is_err());
    }
}
