//! TCP + TLS dial to the server-side proxy.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{CertificateError, ClientConfig};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Open a TCP connection to `(host, port)` and perform the TLS handshake
/// with the given pinned client config, all under `timeout`.
///
/// `host` may be a literal IP address or a DNS name (PSC endpoints). The
/// name is used for SNI only; peer verification is done by the config's
/// instance-bound verifier.
pub(crate) async fn dial(
    tls_config: Arc<ClientConfig>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::config(format!("invalid server address: {host:?}")))?;

    let handshake = async {
        let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
            Error::handshake(format!("TCP connect to {host}:{port} failed: {e}"))
        })?;
        tcp.set_nodelay(true)
            .map_err(|e| Error::handshake(format!("failed to set TCP_NODELAY: {e}")))?;

        let connector = TlsConnector::from(tls_config);
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| classify_handshake_error(host, port, e))
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "handshake with {host}:{port} did not complete within {timeout:?}"
        ))),
    }
}

/// Distinguish an instance-identity rejection from other handshake
/// failures so callers know to force a refresh and retry.
fn classify_handshake_error(host: &str, port: u16, err: std::io::Error) -> Error {
    let identity_mismatch = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|tls_err| {
            matches!(
                tls_err,
                rustls::Error::InvalidCertificate(CertificateError::NotValidForName)
            )
        });
    if identity_mismatch {
        Error::PeerIdentity(format!(
            "server at {host}:{port} presented a certificate for a different instance"
        ))
    } else {
        Error::handshake(format!("TLS handshake with {host}:{port} failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_identity_mismatch() {
        let tls_err = rustls::Error::InvalidCertificate(CertificateError::NotValidForName);
        let io_err = std::io::Error::new(std::io::ErrorKind::InvalidData, tls_err);
        let err = classify_handshake_error("34.1.2.3", 3307, io_err);
        assert!(err.is_peer_identity(), "got {err}");
    }

    #[test]
    fn test_classify_other_tls_failure() {
        let tls_err = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        let io_err = std::io::Error::new(std::io::ErrorKind::InvalidData, tls_err);
        let err = classify_handshake_error("34.1.2.3", 3307, io_err);
        assert!(matches!(err, Error::Handshake(_)), "got {err}");
    }

    #[test]
    fn test_classify_plain_io_failure() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = classify_handshake_error("34.1.2.3", 3307, io_err);
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_dial_rejects_unparseable_address() {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();

        let err = dial(
            Arc::new(config),
            "not a hostname",
            3307,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
