//! Assembled connection info for one refresh.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ClientConfig;
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::admin::InstanceMetadata;
use crate::error::{AdminError, Error, Result};
use crate::instance::ConnectionName;
use crate::tls::verifier::InstanceIdentityVerifier;

/// Everything needed to dial one instance, produced by one refresh.
///
/// Immutable and shared: dialers hold an `Arc` to it while the refresh
/// engine publishes a successor, and the pinned [`ClientConfig`] is reused
/// across every dial served from this result.
pub struct ConnectionInfo {
    name: ConnectionName,
    metadata: InstanceMetadata,
    expires_at: DateTime<Utc>,
    leaf_serial: String,
    tls_config: Arc<ClientConfig>,
}

impl ConnectionInfo {
    /// Assemble a refresh result from the joined metadata and signed
    /// certificate chain.
    ///
    /// Validates that the leaf chains to the instance's advertised CA and
    /// clamps the effective expiry to the IAM token's when IAM database
    /// authentication is active. The TLS client config is built here, once.
    pub(crate) fn new(
        name: &ConnectionName,
        metadata: InstanceMetadata,
        client_chain: Vec<CertificateDer<'static>>,
        client_key: PrivateKeyDer<'static>,
        iam_token_expiry: Option<DateTime<Utc>>,
        enable_iam_authn: bool,
    ) -> Result<Self> {
        let leaf = client_chain.first().ok_or_else(|| {
            Error::Admin(AdminError::Permanent(
                "signed certificate chain is empty".into(),
            ))
        })?;

        let (not_after, leaf_serial) = parse_leaf(leaf)?;
        validate_client_chain(&client_chain, &metadata)?;

        let mut expires_at = not_after;
        if enable_iam_authn {
            if let Some(token_expiry) = iam_token_expiry {
                // The OAuth2 token is embedded in the certificate identity,
                // so the credentials are only usable while it is valid.
                expires_at = expires_at.min(token_expiry);
            }
        }

        let verifier = InstanceIdentityVerifier::new(
            name.server_common_name(),
            metadata.dns_name().map(str::to_string),
            metadata.server_ca_mode(),
            metadata.server_ca_certs(),
        )?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = if enable_iam_authn {
            // The login token travels inside the certificate; TLS 1.3 keeps
            // the certificate exchange encrypted on the wire.
            ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(&[&rustls::version::TLS13])
        } else {
            ClientConfig::builder_with_provider(provider).with_safe_default_protocol_versions()
        }
        .map_err(|e| Error::config(format!("failed to set TLS protocol versions: {e}")))?;

        let tls_config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(client_chain, client_key)
            .map_err(|e| Error::config(format!("failed to build TLS client config: {e}")))?;

        Ok(Self {
            name: name.clone(),
            metadata,
            expires_at,
            leaf_serial,
            tls_config: Arc::new(tls_config),
        })
    }

    /// The instance this info belongs to.
    pub fn connection_name(&self) -> &ConnectionName {
        &self.name
    }

    /// Instance metadata captured by the refresh.
    pub fn metadata(&self) -> &InstanceMetadata {
        &self.metadata
    }

    /// When the credentials stop being usable.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Serial number of the client certificate, as colon-separated hex.
    pub fn leaf_serial(&self) -> &str {
        &self.leaf_serial
    }

    /// The pinned TLS client config for dialing this instance.
    pub fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls_config)
    }

    /// Whether the credentials are past their expiry.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("name", &self.name.to_string())
            .field("expires_at", &self.expires_at)
            .field("leaf_serial", &self.leaf_serial)
            .finish()
    }
}

/// Extract `NotAfter` and the serial number from the signed leaf.
fn parse_leaf(leaf: &CertificateDer<'_>) -> Result<(DateTime<Utc>, String)> {
    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| {
        Error::Admin(AdminError::Permanent(format!(
            "signed certificate is not valid DER: {e}"
        )))
    })?;
    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| {
            Error::Admin(AdminError::Permanent(
                "signed certificate has an unrepresentable NotAfter".into(),
            ))
        })?;
    Ok((not_after, cert.raw_serial_as_string()))
}

/// Check that the signed leaf chains to one of the advertised CA certs.
///
/// A chain that does not verify means the control plane handed back
/// credentials the server-side proxy will never accept; retrying with the
/// same inputs cannot help.
fn validate_client_chain(
    chain: &[CertificateDer<'static>],
    metadata: &InstanceMetadata,
) -> Result<()> {
    let mut anchors = Vec::with_capacity(metadata.server_ca_certs().len());
    for ca in metadata.server_ca_certs() {
        let anchor = anchor_from_trusted_cert(ca).map_err(|e| {
            Error::Admin(AdminError::Permanent(format!(
                "server CA certificate is not usable as a trust anchor: {e:?}"
            )))
        })?;
        anchors.push(anchor.to_owned());
    }

    let leaf = &chain[0];
    let ee_cert = EndEntityCert::try_from(leaf).map_err(|e| {
        Error::Admin(AdminError::Permanent(format!(
            "signed certificate is not a valid end-entity certificate: {e:?}"
        )))
    })?;
    let intermediates: Vec<CertificateDer<'static>> = chain[1..].to_vec();

    ee_cert
        .verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &anchors,
            &intermediates,
            webpki::types::UnixTime::now(),
            KeyUsage::client_auth(),
            None,
            None,
        )
        .map(|_| ())
        .map_err(|e| {
            Error::Admin(AdminError::Permanent(format!(
                "signed certificate does not chain to the instance CA: {e:?}"
            )))
        })
}
