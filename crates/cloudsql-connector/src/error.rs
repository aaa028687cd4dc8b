//! Error types for cloudsql-connector

use thiserror::Error;

/// Classification of Cloud SQL Admin API failures.
///
/// The refresh loop treats both kinds the same way (absorb while valid
/// credentials exist, retry under the rate limiter), but callers can use the
/// classification to decide whether a retry on their side is worthwhile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// Network failure, 5xx response, or request timeout. Retrying may help.
    #[error("transient Admin API failure: {0}")]
    Transient(String),

    /// Malformed response, missing fields, or a 4xx response other than
    /// 401/403. Retrying will not help.
    #[error("permanent Admin API failure: {0}")]
    Permanent(String),
}

/// Main error type for the connector
///
/// All variants are cloneable so a refresh failure can be published once and
/// observed by every dialer waiting on the same instance entry.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid configuration or instance connection name
    #[error("configuration error: {0}")]
    Config(String),

    /// Admin API rejected the caller's identity (401/403), or no usable
    /// credentials could be obtained
    #[error("permission denied: {0}")]
    Permission(String),

    /// Admin API failure during refresh
    #[error(transparent)]
    Admin(#[from] AdminError),

    /// Caller deadline exceeded while waiting for a refresh or during dial
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// TCP or TLS failure during connect
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server presented a valid certificate chain that is not bound to
    /// the requested instance
    #[error("server identity mismatch: {0}")]
    PeerIdentity(String),

    /// Operation invoked after the connector or entry was closed
    #[error("connector is closed")]
    Closed,

    /// I/O error (network)
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config(reason.into())
    }

    /// Create a permission error
    pub fn permission(reason: impl Into<String>) -> Self {
        Error::Permission(reason.into())
    }

    /// Create a handshake error
    pub fn handshake(reason: impl Into<String>) -> Self {
        Error::Handshake(reason.into())
    }

    /// Whether this error is the peer-identity handshake sub-reason.
    ///
    /// A `true` result means the TLS exchange itself succeeded far enough to
    /// validate the server chain, but the certificate was not bound to the
    /// instance that was dialed. Callers should force a refresh before
    /// retrying.
    pub fn is_peer_identity(&self) -> bool {
        matches!(self, Error::PeerIdentity(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type alias for connector operations
pub type Result<T> = std::result::Result<T, Error>;
