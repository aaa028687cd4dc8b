//! Connector configuration types.
//!
//! Process-wide defaults are set on the [`Connector`](crate::Connector)
//! builder; [`ConnectOptions`] overrides a subset of them for a single
//! `connect` call.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default Cloud SQL Admin API endpoint.
pub const DEFAULT_ADMIN_API_ENDPOINT: &str = "https://sqladmin.googleapis.com";

/// Fixed port of the server-side proxy on every Cloud SQL instance.
pub const SERVER_PROXY_PORT: u16 = 3307;

/// Default upper bound on TCP connect plus TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on waiting for usable connection info.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of IP address a Cloud SQL instance may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpKind {
    /// Public (internet-routable) address. The Admin API calls this
    /// `PRIMARY` for historical reasons.
    Public,
    /// VPC-internal address.
    Private,
    /// Private Service Connect endpoint, advertised as a DNS name.
    Psc,
}

impl IpKind {
    /// The name the Admin API uses for this kind in `ipAddresses[].type`.
    pub(crate) fn api_name(self) -> &'static str {
        match self {
            IpKind::Public => "PRIMARY",
            IpKind::Private => "PRIVATE",
            IpKind::Psc => "PSC",
        }
    }

    /// Parse an Admin API address type. Unknown kinds (e.g. `OUTGOING`)
    /// return `None` and are skipped by the metadata adapter.
    pub(crate) fn from_api_name(s: &str) -> Option<Self> {
        match s {
            "PRIMARY" | "PUBLIC" => Some(IpKind::Public),
            "PRIVATE" => Some(IpKind::Private),
            "PSC" => Some(IpKind::Psc),
            _ => None,
        }
    }
}

impl std::fmt::Display for IpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_name())
    }
}

/// How an instance entry keeps its credentials fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshStrategy {
    /// Proactive: a background worker refreshes ahead of certificate expiry.
    #[default]
    Background,
    /// On-demand: refresh happens inside `connect` when the cached
    /// certificate is missing, invalidated, or close to expiry. Suited to
    /// CPU-throttled serverless environments where background timers are
    /// unreliable.
    Lazy,
}

/// Per-`connect` overrides of the connector-wide defaults.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Ordered IP kind preference for this dial.
    pub ip_preference: Option<Vec<IpKind>>,
    /// Override the connector's IAM database authentication setting. Only
    /// honored on the first `connect` for an instance; later conflicting
    /// overrides fail with a configuration error.
    pub enable_iam_authn: Option<bool>,
    /// Override the TCP+TLS handshake timeout for this dial.
    pub handshake_timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Create empty options (all connector defaults apply).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ordered IP kind preference.
    pub fn with_ip_preference(mut self, preference: Vec<IpKind>) -> Self {
        self.ip_preference = Some(preference);
        self
    }

    /// Enable or disable IAM database authentication for this instance.
    pub fn with_iam_authn(mut self, enable: bool) -> Self {
        self.enable_iam_authn = Some(enable);
        self
    }

    /// Set the handshake timeout for this dial.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }
}

/// Resolved connector-wide configuration.
#[derive(Debug, Clone)]
pub(crate) struct ConnectorConfig {
    pub ip_preference: Vec<IpKind>,
    pub enable_iam_authn: bool,
    pub admin_api_endpoint: String,
    pub universe_domain: Option<String>,
    pub quota_project: Option<String>,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub refresh_strategy: RefreshStrategy,
    pub user_agent: Option<String>,
    pub server_proxy_port: u16,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            ip_preference: vec![IpKind::Public],
            enable_iam_authn: false,
            admin_api_endpoint: DEFAULT_ADMIN_API_ENDPOINT.to_string(),
            universe_domain: None,
            quota_project: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            refresh_strategy: RefreshStrategy::Background,
            user_agent: None,
            server_proxy_port: SERVER_PROXY_PORT,
        }
    }
}

impl ConnectorConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.ip_preference.is_empty() {
            return Err(Error::config("ip_preference must not be empty"));
        }
        if self.admin_api_endpoint.is_empty() {
            return Err(Error::config("admin_api_endpoint must not be empty"));
        }
        Ok(())
    }
}

/// Select the address to dial by walking the caller's ordered preference
/// list; the first kind the instance advertises wins.
pub(crate) fn select_address<'a>(
    advertised: &'a std::collections::HashMap<IpKind, String>,
    preference: &[IpKind],
) -> Result<(IpKind, &'a str)> {
    if preference.is_empty() {
        return Err(Error::config("ip_preference must not be empty"));
    }
    for kind in preference {
        if let Some(addr) = advertised.get(kind) {
            return Ok((*kind, addr.as_str()));
        }
    }
    let advertised_kinds: Vec<String> = advertised.keys().map(|k| k.to_string()).collect();
    Err(Error::config(format!(
        "instance has no IP address matching preference {:?} (advertised: {})",
        preference.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        advertised_kinds.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn advertised(kinds: &[(IpKind, &str)]) -> HashMap<IpKind, String> {
        kinds
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect()
    }

    #[test]
    fn test_ip_kind_api_names_roundtrip() {
        for kind in [IpKind::Public, IpKind::Private, IpKind::Psc] {
            assert_eq!(IpKind::from_api_name(kind.api_name()), Some(kind));
        }
        // The legacy alias and unknown kinds.
        assert_eq!(IpKind::from_api_name("PUBLIC"), Some(IpKind::Public));
        assert_eq!(IpKind::from_api_name("OUTGOING"), None);
    }

    #[test]
    fn test_select_address_first_preference_wins() {
        let addrs = advertised(&[
            (IpKind::Public, "34.1.2.3"),
            (IpKind::Private, "10.0.0.2"),
        ]);
        let (kind, addr) =
            select_address(&addrs, &[IpKind::Private, IpKind::Public]).unwrap();
        assert_eq!(kind, IpKind::Private);
        assert_eq!(addr, "10.0.0.2");
    }

    #[test]
    fn test_select_address_falls_through_missing_kinds() {
        let addrs = advertised(&[(IpKind::Private, "10.0.0.2"), (IpKind::Psc, "x.psc.goog")]);
        let (kind, _) = select_address(&addrs, &[IpKind::Public, IpKind::Private]).unwrap();
        assert_eq!(kind, IpKind::Private);
    }

    #[test]
    fn test_select_address_no_match_is_config_error() {
        let addrs = advertised(&[(IpKind::Private, "10.0.0.2")]);
        let err = select_address(&addrs, &[IpKind::Public]).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err}");
    }

    #[test]
    fn test_select_address_empty_preference_is_config_error() {
        let addrs = advertised(&[(IpKind::Public, "34.1.2.3")]);
        assert!(select_address(&addrs, &[]).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectorConfig::default();
        assert_eq!(config.ip_preference, vec![IpKind::Public]);
        assert_eq!(config.server_proxy_port, SERVER_PROXY_PORT);
        assert_eq!(config.refresh_strategy, RefreshStrategy::Background);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_empty_preference() {
        let config = ConnectorConfig {
            ip_preference: vec![],
            ..ConnectorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
