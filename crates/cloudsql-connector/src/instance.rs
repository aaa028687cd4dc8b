//! Instance connection names.
//!
//! A Cloud SQL instance is addressed by its "instance connection name",
//! `PROJECT:REGION:INSTANCE`. A four-segment form embeds a non-default API
//! universe domain: `DOMAIN:PROJECT:REGION:INSTANCE`. The [`Resolver`] trait
//! admits additional textual forms (e.g. DNS names carrying the connection
//! name in a TXT record) without coupling the engine to a DNS client.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Universe domain served by the default API endpoint.
pub const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";

/// Parsed, canonical identifier for a Cloud SQL instance.
///
/// Equality covers the project/region/instance triple plus the effective
/// universe domain, so instances with the same triple under different API
/// universes get distinct registry entries. The default universe domain is
/// normalized away: a name that spells it out resolves to the same endpoint
/// as one that omits it, so both compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionName {
    project: String,
    region: String,
    instance: String,
    universe_domain: Option<String>,
}

impl ConnectionName {
    /// Parse an instance connection name.
    ///
    /// Accepts `project:region:instance` and
    /// `domain:project:region:instance`. An embedded default domain
    /// (`googleapis.com`) is dropped during canonicalization.
    pub fn parse(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split(':').collect();
        let (universe_domain, triple) = match segments.len() {
            3 => (None, &segments[..]),
            4 => (Some(segments[0]), &segments[1..]),
            _ => {
                return Err(Error::config(format!(
                    "instance connection name must have format \
                     PROJECT:REGION:INSTANCE, got {s:?}"
                )))
            }
        };
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(Error::config(format!(
                "instance connection name has empty segment: {s:?}"
            )));
        }
        Ok(Self {
            project: triple[0].to_string(),
            region: triple[1].to_string(),
            instance: triple[2].to_string(),
            universe_domain: universe_domain
                .filter(|domain| *domain != DEFAULT_UNIVERSE_DOMAIN)
                .map(str::to_string),
        })
    }

    /// The project the instance lives in.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The region the instance lives in.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The instance name.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Universe domain embedded in the name, if any.
    pub fn universe_domain(&self) -> Option<&str> {
        self.universe_domain.as_deref()
    }

    /// The `project:instance` form the server-side proxy bakes into the
    /// Common Name of Google-managed server certificates.
    pub(crate) fn server_common_name(&self) -> String {
        format!("{}:{}", self.project, self.instance)
    }

    /// Pin the effective universe domain onto the name.
    ///
    /// The connector-level `universe_domain` setting and a domain prefix in
    /// the name must agree; a name without a prefix inherits the setting.
    /// The default domain counts as unset on both sides.
    pub(crate) fn with_universe_domain(mut self, configured: Option<&str>) -> Result<Self> {
        let configured = configured.filter(|domain| *domain != DEFAULT_UNIVERSE_DOMAIN);
        match (&self.universe_domain, configured) {
            (Some(from_name), Some(from_config)) if from_name != from_config => {
                Err(Error::config(format!(
                    "universe domain mismatch: name carries {from_name:?}, \
                     connector is configured for {from_config:?}"
                )))
            }
            (None, Some(from_config)) => {
                self.universe_domain = Some(from_config.to_string());
                Ok(self)
            }
            _ => Ok(self),
        }
    }
}

impl std::fmt::Display for ConnectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.instance)
    }
}

impl std::str::FromStr for ConnectionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Turns the caller-supplied instance identifier into a [`ConnectionName`].
///
/// The default resolver only parses the two textual forms. Deployments that
/// address instances by DNS name implement this trait on top of their own
/// DNS client and look the connection name up from a TXT record.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<ConnectionName>;
}

/// Resolver that validates and parses instance connection names.
#[derive(Debug, Default)]
pub struct DefaultResolver;

#[async_trait]
impl Resolver for DefaultResolver {
    async fn resolve(&self, name: &str) -> Result<ConnectionName> {
        ConnectionName::parse(name)
    }
}
