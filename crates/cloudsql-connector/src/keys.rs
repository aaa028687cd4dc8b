//! Client keypair for mTLS identity.
//!
//! Key generation is comparatively expensive, so a connector generates one
//! keypair during construction and reuses it for every certificate signing
//! request over its lifetime. The public half is sent to the Admin API; the
//! private half never leaves the process.

use rcgen::KeyPair;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// The connector-lifetime client keypair.
pub struct ClientKeys {
    public_key_pem: String,
    private_key_der: Zeroizing<Vec<u8>>,
}

impl ClientKeys {
    /// Generate a fresh keypair. Blocking; call during connector
    /// construction, not on the dial path.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::config(format!("failed to generate client keypair: {e}")))?;
        Ok(Self {
            public_key_pem: key_pair.public_key_pem(),
            private_key_der: Zeroizing::new(key_pair.serialize_der()),
        })
    }

    /// PEM-encoded public key, as sent in every sign request.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// A fresh DER handle to the private key for building a TLS client
    /// identity.
    pub(crate) fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key_der.to_vec()))
    }
}

impl std::fmt::Debug for ClientKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKeys")
            .field("public_key_pem", &self.public_key_pem)
            .finish()
    }
}
