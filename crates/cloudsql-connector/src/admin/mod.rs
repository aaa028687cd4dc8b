//! Control-plane seam.
//!
//! The refresh engine depends on the [`AdminClient`] trait only; the
//! concrete HTTP adapter for the Cloud SQL Admin API lives in
//! [`http`](crate::admin::http). Tests drive the engine with in-process
//! implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;

use crate::auth::Token;
use crate::config::IpKind;
use crate::error::{AdminError, Error, Result};
use crate::instance::ConnectionName;

pub mod http;

pub use http::SqlAdminClient;

/// Database engine running on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    MySql,
    Postgres,
    SqlServer,
}

impl DatabaseEngine {
    /// Derive the engine from an Admin API `databaseVersion` string such as
    /// `POSTGRES_16` or `MYSQL_8_0`.
    pub fn from_version(version: &str) -> Option<Self> {
        if version.starts_with("MYSQL") {
            Some(DatabaseEngine::MySql)
        } else if version.starts_with("POSTGRES") {
            Some(DatabaseEngine::Postgres)
        } else if version.starts_with("SQLSERVER") {
            Some(DatabaseEngine::SqlServer)
        } else {
            None
        }
    }
}

/// Who operates the CA that signs the instance's server certificate.
///
/// The peer-identity check differs between the two: Google-managed
/// certificates carry `project:instance` in the Common Name, while
/// customer-managed certificates are matched on the instance DNS name in the
/// Subject Alternative Names only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCaMode {
    GoogleManaged,
    CustomerManaged,
}

/// Instance metadata returned by the control plane.
///
/// Immutable once constructed; the refresh engine shares it freely across
/// dialers inside an `Arc`-ed connection info value.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    database_version: String,
    engine: DatabaseEngine,
    ip_addresses: HashMap<IpKind, String>,
    dns_name: Option<String>,
    server_ca_certs: Vec<CertificateDer<'static>>,
    server_ca_mode: ServerCaMode,
    supports_auto_iam_authn: bool,
}

impl InstanceMetadata {
    /// Build validated metadata.
    ///
    /// An instance advertising no address at all, or no trust anchor, is
    /// unusable and rejected as a permanent admin failure.
    pub fn new(
        database_version: impl Into<String>,
        ip_addresses: HashMap<IpKind, String>,
        dns_name: Option<String>,
        server_ca_certs: Vec<CertificateDer<'static>>,
        server_ca_mode: ServerCaMode,
    ) -> Result<Self> {
        let database_version = database_version.into();
        let engine = DatabaseEngine::from_version(&database_version).ok_or_else(|| {
            Error::Admin(AdminError::Permanent(format!(
                "unrecognized database version {database_version:?}"
            )))
        })?;
        if ip_addresses.is_empty() {
            return Err(Error::Admin(AdminError::Permanent(
                "instance advertises no IP address".into(),
            )));
        }
        if server_ca_certs.is_empty() {
            return Err(Error::Admin(AdminError::Permanent(
                "instance advertises no server CA certificate".into(),
            )));
        }
        let supports_auto_iam_authn =
            matches!(engine, DatabaseEngine::Postgres | DatabaseEngine::MySql);
        Ok(Self {
            database_version,
            engine,
            ip_addresses,
            dns_name,
            server_ca_certs,
            server_ca_mode,
            supports_auto_iam_authn,
        })
    }

    /// Raw `databaseVersion` string, e.g. `POSTGRES_16`.
    pub fn database_version(&self) -> &str {
        &self.database_version
    }

    /// The database engine.
    pub fn engine(&self) -> DatabaseEngine {
        self.engine
    }

    /// Advertised addresses by kind. PSC entries hold a DNS name rather
    /// than a literal address.
    pub fn ip_addresses(&self) -> &HashMap<IpKind, String> {
        &self.ip_addresses
    }

    /// The instance's DNS name, when the control plane advertises one.
    pub fn dns_name(&self) -> Option<&str> {
        self.dns_name.as_deref()
    }

    /// Trust anchors for verifying the server-side proxy.
    pub fn server_ca_certs(&self) -> &[CertificateDer<'static>] {
        &self.server_ca_certs
    }

    /// Operator of the server CA.
    pub fn server_ca_mode(&self) -> ServerCaMode {
        self.server_ca_mode
    }

    /// Whether the engine accepts IAM database authentication.
    pub fn supports_auto_iam_authn(&self) -> bool {
        self.supports_auto_iam_authn
    }
}

/// Abstract control-plane operations the refresh engine depends on.
///
/// The two calls are issued concurrently by each refresh and joined.
/// Implementations classify failures through the crate error taxonomy:
/// [`AdminError::Transient`] for network/5xx/timeouts,
/// [`AdminError::Permanent`] for malformed responses and other 4xx, and
/// [`Error::Permission`] for 401/403.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Fetch instance metadata (engine, addresses, trust anchors).
    async fn get_instance_metadata(&self, name: &ConnectionName) -> Result<InstanceMetadata>;

    /// Have the instance CA sign a short-lived client certificate binding
    /// `public_key_pem` to the caller. When `login_token` is given, the
    /// server embeds the token's principal as the certificate Common Name
    /// (IAM database authentication).
    async fn sign_client_cert(
        &self,
        name: &ConnectionName,
        public_key_pem: &str,
        login_token: Option<&Token>,
    ) -> Result<Vec<CertificateDer<'static>>>;
}
