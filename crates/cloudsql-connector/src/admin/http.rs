//! Cloud SQL Admin API adapter.
//!
//! Implements [`AdminClient`] against the `sqladmin` REST surface:
//! `connectSettings` for instance metadata and `generateEphemeralCert` for
//! the short-lived client certificate. Requests authenticate with bearer
//! tokens pulled from the connector's [`TokenSource`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use rustls::pki_types::CertificateDer;
use serde::Deserialize;

use crate::admin::{AdminClient, InstanceMetadata, ServerCaMode};
use crate::auth::{Token, TokenSource};
use crate::config::IpKind;
use crate::error::{AdminError, Error, Result};
use crate::instance::ConnectionName;

const API_VERSION: &str = "v1beta4";
const BASE_USER_AGENT: &str = concat!("cloudsql-connector/", env!("CARGO_PKG_VERSION"));

/// Attempts per request; 5xx responses and connect/timeout failures are
/// retried with doubling backoff.
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Per-request timeout. Slow Admin API calls count as transient failures
/// and fall to the refresh loop's retry handling.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectSettingsResponse {
    region: Option<String>,
    database_version: Option<String>,
    ip_addresses: Option<Vec<IpMapping>>,
    server_ca_cert: Option<SslCert>,
    dns_name: Option<String>,
    server_ca_mode: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    #[serde(rename = "type")]
    kind: String,
    ip_address: Option<String>,
}

#[derive(Deserialize)]
struct SslCert {
    cert: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateEphemeralCertResponse {
    ephemeral_cert: Option<SslCert>,
}

/// [`AdminClient`] implementation over the Cloud SQL Admin HTTP API.
pub struct SqlAdminClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl SqlAdminClient {
    /// Create an adapter.
    ///
    /// `user_agent` is an optional caller-supplied suffix appended to the
    /// connector's own user-agent string; `quota_project` sets the
    /// `x-goog-user-project` header on every request.
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        quota_project: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Self> {
        let agent = match user_agent {
            Some(suffix) if !suffix.is_empty() => format!("{BASE_USER_AGENT} {suffix}"),
            _ => BASE_USER_AGENT.to_string(),
        };
        let mut headers = HeaderMap::new();
        let agent_value = HeaderValue::from_str(&agent)
            .map_err(|_| Error::config(format!("user agent contains invalid bytes: {agent:?}")))?;
        headers.insert("x-goog-api-client", agent_value.clone());
        headers.insert(reqwest::header::USER_AGENT, agent_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(project) = quota_project {
            let value = HeaderValue::from_str(project).map_err(|_| {
                Error::config(format!("quota project contains invalid bytes: {project:?}"))
            })?;
            headers.insert("x-goog-user-project", value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn instance_url(&self, name: &ConnectionName, suffix: &str) -> String {
        format!(
            "{}/sql/{}/projects/{}/instances/{}{}",
            self.base_url,
            API_VERSION,
            name.project(),
            name.instance(),
            suffix
        )
    }

    async fn bearer(&self) -> Result<Token> {
        let token = self.tokens.token().await?;
        if token.is_expired() {
            return Err(Error::permission("admin API token is expired"));
        }
        Ok(token)
    }

    /// Send a request, retrying 5xx responses and transport-level failures.
    async fn send_with_retry(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let cloned = request
                .try_clone()
                .ok_or_else(|| Error::config("admin request body is not retryable"))?;
            let result = cloned.send().await;
            let retryable = match &result {
                Ok(resp) => resp.status().is_server_error(),
                Err(e) => e.is_timeout() || e.is_connect(),
            };
            if retryable && attempt < MAX_ATTEMPTS {
                debug!(
                    "retrying admin API request (attempt {}/{})",
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
                continue;
            }
            return result.map_err(classify_transport_error);
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Admin(AdminError::Permanent(format!("malformed response: {e}"))))
    }
}

#[async_trait]
impl AdminClient for SqlAdminClient {
    async fn get_instance_metadata(&self, name: &ConnectionName) -> Result<InstanceMetadata> {
        let token = self.bearer().await?;
        let url = self.instance_url(name, "/connectSettings");
        debug!("[{name}] requesting connect settings");

        let request = self.http.get(&url).bearer_auth(token.secret());
        let response = self.send_with_retry(request).await?;
        let settings: ConnectSettingsResponse = self.read_json(response).await?;

        if let Some(region) = &settings.region {
            if region != name.region() {
                return Err(Error::config(format!(
                    "[{name}] region mismatch: got {:?}, instance is in {region:?}",
                    name.region()
                )));
            }
        }

        let mut ip_addresses: HashMap<IpKind, String> = HashMap::new();
        for mapping in settings.ip_addresses.unwrap_or_default() {
            let Some(kind) = IpKind::from_api_name(&mapping.kind) else {
                continue;
            };
            if let Some(address) = mapping.ip_address {
                ip_addresses.insert(kind, address);
            }
        }
        // PSC instances are reached through their DNS name.
        if let Some(dns) = &settings.dns_name {
            ip_addresses.insert(IpKind::Psc, dns.clone());
        }

        let ca_pem = settings
            .server_ca_cert
            .and_then(|c| c.cert)
            .ok_or_else(|| {
                Error::Admin(AdminError::Permanent(
                    "connectSettings response is missing serverCaCert".into(),
                ))
            })?;
        let server_ca_certs = parse_pem_chain(&ca_pem)?;
        let server_ca_mode = parse_ca_mode(settings.server_ca_mode.as_deref());

        let database_version = settings.database_version.ok_or_else(|| {
            Error::Admin(AdminError::Permanent(
                "connectSettings response is missing databaseVersion".into(),
            ))
        })?;

        InstanceMetadata::new(
            database_version,
            ip_addresses,
            settings.dns_name,
            server_ca_certs,
            server_ca_mode,
        )
    }

    async fn sign_client_cert(
        &self,
        name: &ConnectionName,
        public_key_pem: &str,
        login_token: Option<&Token>,
    ) -> Result<Vec<CertificateDer<'static>>> {
        let token = self.bearer().await?;
        let url = self.instance_url(name, ":generateEphemeralCert");
        debug!("[{name}] requesting ephemeral certificate");

        let mut body = serde_json::json!({ "public_key": public_key_pem });
        if let Some(login) = login_token {
            body["access_token"] = serde_json::Value::String(login.secret().to_string());
        }

        let request = self
            .http
            .post(&url)
            .bearer_auth(token.secret())
            .json(&body);
        let response = self.send_with_retry(request).await?;
        let signed: GenerateEphemeralCertResponse = self.read_json(response).await?;

        let cert_pem = signed.ephemeral_cert.and_then(|c| c.cert).ok_or_else(|| {
            Error::Admin(AdminError::Permanent(
                "generateEphemeralCert response is missing ephemeralCert".into(),
            ))
        })?;
        parse_pem_chain(&cert_pem)
    }
}

fn parse_pem_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Admin(AdminError::Permanent(format!(
                "failed to parse PEM certificate: {e}"
            )))
        })?;
    if certs.is_empty() {
        return Err(Error::Admin(AdminError::Permanent(
            "response contains no certificate".into(),
        )));
    }
    Ok(certs)
}

fn parse_ca_mode(mode: Option<&str>) -> ServerCaMode {
    match mode {
        Some(s) if s.starts_with("CUSTOMER_MANAGED") => ServerCaMode::CustomerManaged,
        _ => ServerCaMode::GoogleManaged,
    }
}

fn classify_status(status: StatusCode, body: &str) -> Error {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::permission(format!(
            "admin API denied the request ({detail}); verify the Cloud SQL Admin API \
             is enabled and the principal holds the Cloud SQL Client role"
        )),
        s if s.is_server_error() => Error::Admin(AdminError::Transient(detail)),
        _ => Error::Admin(AdminError::Permanent(detail)),
    }
}

fn classify_transport_error(err: reqwest::Error) -> Error {
    Error::Admin(AdminError::Transient(format!("request failed: {err}")))
}
