//! TLS support for dialing the server-side proxy.
//!
//! The server certificate of a Cloud SQL instance is issued for a regional
//! proxy shared by many instances, so standard hostname verification against
//! the dialed address proves nothing about *which* instance the proxy routes
//! to. [`verifier::InstanceIdentityVerifier`] therefore validates the chain
//! against the instance's own CA and then checks the instance binding baked
//! into the certificate (`project:instance` Common Name for Google-managed
//! CAs, the instance DNS name in the SANs otherwise). [`dialer`] performs
//! the TCP connect and handshake under the caller's timeout.

pub(crate) mod dialer;
pub(crate) mod verifier;
