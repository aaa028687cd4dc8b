//! Shared fixtures for integration tests: an in-process CA, a scriptable
//! control-plane fake, and a TLS echo server standing in for the
//! server-side proxy.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, SubjectPublicKeyInfo,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;

use cloudsql_connector::{
    AdminClient, AdminError, ConnectionName, Error, InstanceMetadata, IpKind, Result,
    ServerCaMode, Token,
};

/// Self-signed CA that issues both server and client certificates.
pub struct TestCa {
    params: CertificateParams,
    key_pair: KeyPair,
    ca_der: CertificateDer<'static>,
    ca_pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Test Instance CA");
        params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        Self {
            ca_der: cert.der().clone(),
            ca_pem: cert.pem(),
            params,
            key_pair,
        }
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_der.clone()
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Sign a client certificate for an externally generated public key.
    /// Returns the DER chain `[leaf, ca]`.
    pub fn issue_client_chain(
        &self,
        public_key_pem: &str,
        ttl: time::Duration,
        serial: u64,
    ) -> Vec<CertificateDer<'static>> {
        let issuer = Issuer::from_params(&self.params, &self.key_pair);
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "client-identity");
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ClientAuth);
        params.not_after = time::OffsetDateTime::now_utc() + ttl;
        params.serial_number = Some(SerialNumber::from(serial.to_be_bytes().to_vec()));
        let spki = SubjectPublicKeyInfo::from_pem(public_key_pem).unwrap();
        let leaf = params.signed_by(&spki, &issuer).unwrap();
        vec![leaf.der().clone(), self.ca_der.clone()]
    }

    /// Same as [`issue_client_chain`](TestCa::issue_client_chain) but PEM
    /// encoded, the way the Admin API returns it.
    pub fn issue_client_chain_pem(
        &self,
        public_key_pem: &str,
        ttl: time::Duration,
        serial: u64,
    ) -> String {
        let issuer = Issuer::from_params(&self.params, &self.key_pair);
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "client-identity");
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ClientAuth);
        params.not_after = time::OffsetDateTime::now_utc() + ttl;
        params.serial_number = Some(SerialNumber::from(serial.to_be_bytes().to_vec()));
        let spki = SubjectPublicKeyInfo::from_pem(public_key_pem).unwrap();
        let leaf = params.signed_by(&spki, &issuer).unwrap();
        format!("{}{}", leaf.pem(), self.ca_pem)
    }

    /// Build a rustls server config presenting a certificate with the given
    /// CN and SANs, requiring client certificates issued by this CA.
    pub fn server_tls_config(&self, cn: &str, sans: &[&str]) -> Arc<ServerConfig> {
        let issuer = Issuer::from_params(&self.params, &self.key_pair);
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        for san in sans {
            params
                .subject_alt_names
                .push(SanType::DnsName((*san).try_into().unwrap()));
        }
        let key = KeyPair::generate().unwrap();
        let leaf = params.signed_by(&key, &issuer).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .unwrap();

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(
            vec![leaf.der().clone(), self.ca_der.clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .unwrap();
        Arc::new(config)
    }
}

pub fn test_token(minutes: i64) -> Token {
    Token::new(
        "test-token",
        chrono::Utc::now() + chrono::Duration::minutes(minutes),
    )
}

/// Scriptable [`AdminClient`] that signs real certificates from a test CA.
pub struct FakeAdmin {
    pub ca: TestCa,
    ip_addresses: Mutex<HashMap<IpKind, String>>,
    dns_name: Mutex<Option<String>>,
    ca_mode: Mutex<ServerCaMode>,
    cert_ttl: Mutex<time::Duration>,
    fail_transient: AtomicBool,
    sign_calls: AtomicUsize,
    next_serial: AtomicU64,
}

impl FakeAdmin {
    pub fn new() -> Self {
        Self {
            ca: TestCa::new(),
            ip_addresses: Mutex::new(HashMap::from([(
                IpKind::Public,
                "127.0.0.1".to_string(),
            )])),
            dns_name: Mutex::new(None),
            ca_mode: Mutex::new(ServerCaMode::GoogleManaged),
            cert_ttl: Mutex::new(time::Duration::hours(1)),
            fail_transient: AtomicBool::new(false),
            sign_calls: AtomicUsize::new(0),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn set_ip_addresses(&self, addresses: HashMap<IpKind, String>) {
        *self.ip_addresses.lock().unwrap() = addresses;
    }

    pub fn set_dns_name(&self, dns: Option<String>) {
        *self.dns_name.lock().unwrap() = dns;
    }

    pub fn set_ca_mode(&self, mode: ServerCaMode) {
        *self.ca_mode.lock().unwrap() = mode;
    }

    pub fn set_cert_ttl(&self, ttl: time::Duration) {
        *self.cert_ttl.lock().unwrap() = ttl;
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_transient.store(failing, Ordering::SeqCst);
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdminClient for FakeAdmin {
    async fn get_instance_metadata(&self, _name: &ConnectionName) -> Result<InstanceMetadata> {
        if self.fail_transient.load(Ordering::SeqCst) {
            return Err(Error::Admin(AdminError::Transient(
                "503 Service Unavailable".into(),
            )));
        }
        InstanceMetadata::new(
            "POSTGRES_16",
            self.ip_addresses.lock().unwrap().clone(),
            self.dns_name.lock().unwrap().clone(),
            vec![self.ca.ca_der()],
            *self.ca_mode.lock().unwrap(),
        )
    }

    async fn sign_client_cert(
        &self,
        _name: &ConnectionName,
        public_key_pem: &str,
        _login_token: Option<&Token>,
    ) -> Result<Vec<CertificateDer<'static>>> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_transient.load(Ordering::SeqCst) {
            return Err(Error::Admin(AdminError::Transient(
                "503 Service Unavailable".into(),
            )));
        }
        let ttl = *self.cert_ttl.lock().unwrap();
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        Ok(self.ca.issue_client_chain(public_key_pem, ttl, serial))
    }
}

/// In-process stand-in for the server-side proxy: accepts mTLS connections
/// and echoes bytes back. The presented identity can be swapped at runtime.
pub struct TlsEchoServer {
    port: u16,
    identity: Arc<Mutex<Arc<ServerConfig>>>,
}

impl TlsEchoServer {
    pub async fn start(config: Arc<ServerConfig>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let identity = Arc::new(Mutex::new(config));

        let slot = Arc::clone(&identity);
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                let config = Arc::clone(&*slot.lock().unwrap());
                tokio::spawn(async move {
                    let acceptor = tokio_rustls::TlsAcceptor::from(config);
                    if let Ok(tls) = acceptor.accept(tcp).await {
                        let (mut reader, mut writer) = tokio::io::split(tls);
                        let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    }
                });
            }
        });

        Self { port, identity }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Swap the certificate presented to subsequent connections.
    pub fn set_identity(&self, config: Arc<ServerConfig>) {
        *self.identity.lock().unwrap() = config;
    }
}
