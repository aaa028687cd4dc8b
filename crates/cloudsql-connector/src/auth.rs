//! Credential sourcing seam.
//!
//! The engine never talks to an OAuth endpoint itself; it pulls bearer
//! tokens through the [`TokenSource`] trait. The Admin API adapter asks for
//! an admin-scoped token per request, and IAM database authentication
//! additionally asks for a login-scoped token whose principal becomes the
//! client certificate's Common Name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::error::Result;

/// An OAuth2 bearer token with its expiration time.
///
/// The secret is zeroized on drop.
#[derive(Clone)]
pub struct Token {
    secret: Zeroizing<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Create a token with a known expiration.
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            expires_at: Some(expires_at),
        }
    }

    /// Create a token without expiry information.
    ///
    /// Such a token cannot be used for IAM database authentication, where
    /// the engine must clamp the certificate lifetime to the token's.
    pub fn without_expiry(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            expires_at: None,
        }
    }

    /// The bearer secret.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// When the token expires, if known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the token is past its expiration.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the secret through Debug output.
        f.debug_struct("Token")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Trait for pluggable OAuth2 credential sources.
///
/// Implementations must be `Send + Sync` so one source can serve every
/// instance entry of a connector concurrently. Failures should be mapped to
/// [`Error::Permission`](crate::Error::Permission).
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A bearer token carrying the Cloud SQL Admin scope, used to
    /// authenticate Admin API requests.
    async fn token(&self) -> Result<Token>;

    /// A token down-scoped for database login, used as the certificate
    /// identity when IAM database authentication is enabled.
    ///
    /// The default implementation reuses [`token`](TokenSource::token);
    /// sources that can mint narrower tokens should override this.
    async fn login_token(&self) -> Result<Token> {
        self.token().await
    }
}

/// Token source that hands out a fixed token.
///
/// Useful for tests and for embedders that manage token refresh themselves.
pub struct StaticTokenSource {
    token: Token,
}

impl StaticTokenSource {
    /// Wrap a fixed token.
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<Token> {
        Ok(self.token.clone())
    }
}
