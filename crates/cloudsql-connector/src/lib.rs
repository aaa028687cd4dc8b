//! cloudsql-connector - authenticated mTLS streams to Cloud SQL instances
//!
//! This library dials managed Cloud SQL database instances without IP
//! allowlists, distributed CA bundles, or password-only authentication:
//! - Fetches instance metadata and short-lived client certificates from the
//!   control plane, concurrently, with proactive background refresh
//! - Pins each instance's advertised CA and verifies that the server
//!   certificate is bound to the instance being dialed
//! - Hands the caller an encrypted byte stream for their database driver
//!   (MySQL, PostgreSQL, SQL Server)
//! - Supports IAM database authentication with certificate-lifetime
//!   clamping and TLS 1.3
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cloudsql_connector::{ConnectOptions, Connector, IpKind, StaticTokenSource, Token};
//!
//! let connector = Connector::builder()
//!     .credentials(Arc::new(StaticTokenSource::new(token)))
//!     .build()?;
//!
//! let stream = connector
//!     .connect(
//!         "demo-project:us-central1:main",
//!         &ConnectOptions::new().with_ip_preference(vec![IpKind::Public]),
//!     )
//!     .await?;
//! // Hand `stream` to a database driver.
//! ```

#[macro_use]
mod logging;

pub mod admin;
pub mod auth;
pub mod config;
pub mod error;
pub mod instance;
pub mod keys;
pub mod rate_limiter;
pub mod refresh;

mod connector;
mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use admin::{AdminClient, DatabaseEngine, InstanceMetadata, ServerCaMode, SqlAdminClient};
pub use auth::{StaticTokenSource, Token, TokenSource};
pub use config::{ConnectOptions, IpKind, RefreshStrategy, SERVER_PROXY_PORT};
pub use connector::{Connector, ConnectorBuilder, ProxyStream};
pub use error::{AdminError, Error, Result};
pub use instance::{ConnectionName, DefaultResolver, Resolver, DEFAULT_UNIVERSE_DOMAIN};
pub use keys::ClientKeys;
pub use rate_limiter::AsyncRateLimiter;
pub use refresh::{ConnectionInfo, LazyRefreshCache, RefreshAheadCache};
