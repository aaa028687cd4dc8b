//! Instance-bound server certificate verification.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, TrustAnchor, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::admin::ServerCaMode;
use crate::error::{Error, Result};

/// Verifies that the server-side proxy's certificate chains to the
/// instance's advertised CA *and* is bound to the instance being dialed.
///
/// One verifier is built per refresh result and pinned into its TLS client
/// config; it closes over the expected `project:instance` Common Name, the
/// instance DNS name, and the trust anchors from the metadata.
pub(crate) struct InstanceIdentityVerifier {
    expected_cn: String,
    dns_name: Option<String>,
    ca_mode: ServerCaMode,
    trust_anchors: Vec<TrustAnchor<'static>>,
    crypto_provider: Arc<CryptoProvider>,
}

impl InstanceIdentityVerifier {
    pub(crate) fn new(
        expected_cn: String,
        dns_name: Option<String>,
        ca_mode: ServerCaMode,
        server_ca_certs: &[CertificateDer<'static>],
    ) -> Result<Self> {
        let mut trust_anchors = Vec::with_capacity(server_ca_certs.len());
        for cert in server_ca_certs {
            let anchor = anchor_from_trusted_cert(cert).map_err(|e| {
                Error::handshake(format!("failed to parse server CA certificate: {e:?}"))
            })?;
            trust_anchors.push(anchor.to_owned());
        }
        Ok(Self {
            expected_cn,
            dns_name,
            ca_mode,
            trust_anchors,
            crypto_provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Validate the presented chain against the pinned trust anchors.
    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<(), rustls::Error> {
        let ee_cert = EndEntityCert::try_from(end_entity).map_err(|_| {
            rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
        })?;

        let intermediates: Vec<CertificateDer<'static>> = intermediates
            .iter()
            .map(|c| CertificateDer::from(c.as_ref().to_vec()))
            .collect();

        let time =
            webpki::types::UnixTime::since_unix_epoch(std::time::Duration::from_secs(now.as_secs()));

        ee_cert
            .verify_for_usage(
                webpki::ALL_VERIFICATION_ALGS,
                &self.trust_anchors,
                &intermediates,
                time,
                KeyUsage::server_auth(),
                None,
                None,
            )
            .map(|_| ())
            .map_err(|e| {
                debug!("server certificate chain verification failed: {e:?}");
                rustls::Error::InvalidCertificate(CertificateError::BadSignature)
            })
    }

    /// Check that the leaf is bound to the instance being dialed.
    fn identity_matches(&self, leaf: &X509Certificate<'_>) -> bool {
        if let Some(expected_dns) = &self.dns_name {
            if let Ok(Some(san)) = leaf.subject_alternative_name() {
                for general_name in &san.value.general_names {
                    if let GeneralName::DNSName(dns) = general_name {
                        if dns.eq_ignore_ascii_case(expected_dns) {
                            return true;
                        }
                    }
                }
            }
        }
        // Customer-managed CAs bind the instance through the DNS SAN only.
        if self.ca_mode == ServerCaMode::GoogleManaged {
            let cn = leaf
                .subject()
                .iter_common_name()
                .next()
                .and_then(|attr| attr.as_str().ok());
            if cn == Some(self.expected_cn.as_str()) {
                return true;
            }
        }
        false
    }
}

impl std::fmt::Debug for InstanceIdentityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceIdentityVerifier")
            .field("expected_cn", &self.expected_cn)
            .field("dns_name", &self.dns_name)
            .field("ca_mode", &self.ca_mode)
            .field("trust_anchor_count", &self.trust_anchors.len())
            .finish()
    }
}

impl ServerCertVerifier for InstanceIdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        // The dialed host name is deliberately ignored: the proxy serves a
        // regional certificate, and the instance binding below is the
        // authoritative check.
        self.verify_chain(end_entity, intermediates, now)?;

        let (_, leaf) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        if !self.identity_matches(&leaf) {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            ));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto_provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
