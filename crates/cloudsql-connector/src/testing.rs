//! Shared fixtures for unit tests: an in-process CA and a scriptable
//! control-plane fake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, SubjectPublicKeyInfo,
};
use rustls::pki_types::CertificateDer;

use crate::admin::{AdminClient, InstanceMetadata, ServerCaMode};
use crate::auth::Token;
use crate::config::IpKind;
use crate::error::{AdminError, Error, Result};
use crate::instance::ConnectionName;

pub(crate) struct TestCa {
    params: CertificateParams,
    key_pair: KeyPair,
    ca_der: CertificateDer<'static>,
}

impl TestCa {
    pub(crate) fn new() -> Self {
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
            params,
            key_pair,
        }
    }

    pub(crate) fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_der.clone()
    }

    /// Sign a client certificate for an externally generated public key.
    pub(crate) fn issue_client_chain(
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

    /// Sign a server certificate for an in-process proxy endpoint.
    #[allow(dead_code)]
    pub(crate) fn issue_server_chain(
        &self,
        cn: &str,
        sans: &[&str],
    ) -> (Vec<CertificateDer<'static>>, KeyPair) {
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
        (vec![leaf.der().clone(), self.ca_der.clone()], key)
    }
}

pub(crate) fn test_name() -> ConnectionName {
    ConnectionName::parse("demo-project:us-central1:main").unwrap()
}

pub(crate) fn test_token(minutes: i64) -> Token {
    Token::new("test-token", chrono::Utc::now() + chrono::Duration::minutes(minutes))
}

/// Scriptable [`AdminClient`] that signs real certificates from a test CA.
///
/// Tracks call counts and the maximum number of concurrent sign calls, and
/// can be switched into a failing mode.
pub(crate) struct FakeAdmin {
    ca: TestCa,
    ip_addresses: HashMap<IpKind, String>,
    cert_ttl: Mutex<time::Duration>,
    fail_transient: AtomicBool,
    metadata_calls: AtomicUsize,
    sign_calls: AtomicUsize,
    concurrent_signs: AtomicUsize,
    max_concurrent_signs: AtomicUsize,
    next_serial: AtomicU64,
}

impl FakeAdmin {
    pub(crate) fn new() -> Self {
        Self {
            ca: TestCa::new(),
            ip_addresses: HashMap::from([(IpKind::Public, "127.0.0.1".to_string())]),
            cert_ttl: Mutex::new(time::Duration::hours(1)),
            fail_transient: AtomicBool::new(false),
            metadata_calls: AtomicUsize::new(0),
            sign_calls: AtomicUsize::new(0),
            concurrent_signs: AtomicUsize::new(0),
            max_concurrent_signs: AtomicUsize::new(0),
            next_serial: AtomicU64::new(1),
        }
    }

    pub(crate) fn set_cert_ttl(&self, ttl: time::Duration) {
        *self.cert_ttl.lock().unwrap() = ttl;
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.fail_transient.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_signs(&self) -> usize {
        self.max_concurrent_signs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdminClient for FakeAdmin {
    async fn get_instance_metadata(&self, _name: &ConnectionName) -> Result<InstanceMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_transient.load(Ordering::SeqCst) {
            return Err(Error::Admin(AdminError::Transient(
                "503 Service Unavailable".into(),
            )));
        }
        InstanceMetadata::new(
            "POSTGRES_16",
            self.ip_addresses.clone(),
            None,
            vec![self.ca.ca_der()],
            ServerCaMode::GoogleManaged,
        )
    }

    async fn sign_client_cert(
        &self,
        _name: &ConnectionName,
        public_key_pem: &str,
        _login_token: Option<&Token>,
    ) -> Result<Vec<CertificateDer<'static>>> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let live = self.concurrent_signs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_signs.fetch_max(live, Ordering::SeqCst);

        // Keep the request in flight long enough for overlapping refreshes
        // to be observable.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = if self.fail_transient.load(Ordering::SeqCst) {
            Err(Error::Admin(AdminError::Transient(
                "503 Service Unavailable".into(),
            )))
        } else {
            let ttl = *self.cert_ttl.lock().unwrap();
            let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
            Ok(self.ca.issue_client_chain(public_key_pem, ttl, serial))
        };

        self.concurrent_signs.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
