//! Process-scoped registry of instance entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::admin::{AdminClient, SqlAdminClient};
use crate::auth::TokenSource;
use crate::config::{select_address, ConnectOptions, ConnectorConfig, IpKind, RefreshStrategy};
use crate::error::{Error, Result};
use crate::instance::{ConnectionName, DefaultResolver, Resolver};
use crate::keys::ClientKeys;
use crate::rate_limiter::AsyncRateLimiter;
use crate::refresh::{ConnectionInfo, LazyRefreshCache, RefreshAheadCache, RefreshCtx};
use crate::tls::dialer;

/// The encrypted byte stream handed to the caller's database driver.
pub type ProxyStream = tokio_rustls::client::TlsStream<TcpStream>;

enum InstanceCache {
    Background(RefreshAheadCache),
    Lazy(LazyRefreshCache),
}

impl InstanceCache {
    async fn connection_info(&self) -> Result<Arc<ConnectionInfo>> {
        match self {
            InstanceCache::Background(cache) => cache.connection_info().await,
            InstanceCache::Lazy(cache) => cache.connection_info().await,
        }
    }

    async fn force_refresh(&self, stale: &Arc<ConnectionInfo>) {
        match self {
            InstanceCache::Background(cache) => cache.force_refresh(stale),
            InstanceCache::Lazy(cache) => cache.force_refresh(stale).await,
        }
    }

    async fn invalidate(&self) {
        match self {
            InstanceCache::Background(cache) => cache.invalidate(),
            InstanceCache::Lazy(cache) => cache.invalidate().await,
        }
    }

    fn close(&self) {
        match self {
            InstanceCache::Background(cache) => cache.close(),
            InstanceCache::Lazy(cache) => cache.close(),
        }
    }
}

struct Entry {
    cache: InstanceCache,
    enable_iam_authn: bool,
}

/// Builder for [`Connector`].
pub struct ConnectorBuilder {
    config: ConnectorConfig,
    admin_api_endpoint: Option<String>,
    credentials: Option<Arc<dyn TokenSource>>,
    admin: Option<Arc<dyn AdminClient>>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl ConnectorBuilder {
    fn new() -> Self {
        Self {
            config: ConnectorConfig::default(),
            admin_api_endpoint: None,
            credentials: None,
            admin: None,
            resolver: None,
        }
    }

    /// Default ordered IP kind preference (default `[Public]`).
    pub fn ip_preference(mut self, preference: Vec<IpKind>) -> Self {
        self.config.ip_preference = preference;
        self
    }

    /// Enable IAM database authentication by default for every instance.
    pub fn enable_iam_authn(mut self, enable: bool) -> Self {
        self.config.enable_iam_authn = enable;
        self
    }

    /// Override the Admin API base URL.
    pub fn admin_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.admin_api_endpoint = Some(endpoint.into());
        self
    }

    /// Use a non-default API universe domain. Must agree with any domain
    /// prefix embedded in instance connection names.
    pub fn universe_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.universe_domain = Some(domain.into());
        self
    }

    /// Project used for quota and billing on Admin API calls.
    pub fn quota_project(mut self, project: impl Into<String>) -> Self {
        self.config.quota_project = Some(project.into());
        self
    }

    /// Upper bound on TCP connect plus TLS handshake (default 30s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Upper bound on waiting for usable credentials (default 30s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Refresh strategy for new instance entries (default background).
    pub fn refresh_strategy(mut self, strategy: RefreshStrategy) -> Self {
        self.config.refresh_strategy = strategy;
        self
    }

    /// Suffix appended to the connector's user-agent on Admin API calls.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    /// OAuth2 credential source for Admin API and IAM login tokens.
    pub fn credentials(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Replace the Admin API client. Intended for tests and emulators.
    pub fn admin_client(mut self, admin: Arc<dyn AdminClient>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Replace the instance name resolver.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the server-side proxy port. Intended for tests and
    /// emulators; real instances always listen on 3307.
    pub fn server_proxy_port(mut self, port: u16) -> Self {
        self.config.server_proxy_port = port;
        self
    }

    /// Build the connector. Generates the process-lifetime client keypair,
    /// which blocks briefly.
    pub fn build(mut self) -> Result<Connector> {
        if let Some(endpoint) = self.admin_api_endpoint.take() {
            self.config.admin_api_endpoint = endpoint;
        } else if let Some(domain) = &self.config.universe_domain {
            self.config.admin_api_endpoint = format!("https://sqladmin.{domain}");
        }
        self.config.validate()?;

        let tokens: Arc<dyn TokenSource> = match (&self.credentials, &self.admin) {
            (Some(source), _) => Arc::clone(source),
            (None, Some(_)) => Arc::new(UnconfiguredTokenSource),
            (None, None) => {
                return Err(Error::config(
                    "a credential source is required; supply one with \
                     ConnectorBuilder::credentials",
                ))
            }
        };

        let admin: Arc<dyn AdminClient> = match self.admin {
            Some(admin) => admin,
            None => Arc::new(SqlAdminClient::new(
                self.config.admin_api_endpoint.clone(),
                Arc::clone(&tokens),
                self.config.quota_project.as_deref(),
                self.config.user_agent.as_deref(),
            )?),
        };

        let keys = Arc::new(ClientKeys::generate()?);
        info!("connector initialized, client keypair generated");

        Ok(Connector {
            config: self.config,
            keys,
            admin,
            tokens,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(DefaultResolver)),
            limiter: Arc::new(AsyncRateLimiter::default()),
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }
}

/// Token source standing in when the caller injected a custom Admin client
/// without credentials; only IAM login-token requests ever reach it.
struct UnconfiguredTokenSource;

#[async_trait::async_trait]
impl TokenSource for UnconfiguredTokenSource {
    async fn token(&self) -> Result<crate::auth::Token> {
        Err(Error::permission(
            "no credential source configured on this connector",
        ))
    }
}

/// Dials authenticated, mutually-TLS-encrypted streams to Cloud SQL
/// instances, refreshing per-instance credentials behind the scenes.
///
/// One connector owns one client keypair, one Admin API rate limiter, and
/// one cache entry per instance; create it once per process and share it.
pub struct Connector {
    config: ConnectorConfig,
    keys: Arc<ClientKeys>,
    admin: Arc<dyn AdminClient>,
    tokens: Arc<dyn TokenSource>,
    resolver: Arc<dyn Resolver>,
    limiter: Arc<AsyncRateLimiter>,
    entries: Mutex<HashMap<ConnectionName, Arc<Entry>>>,
    closed: AtomicBool,
}

impl Connector {
    /// Start building a connector.
    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::new()
    }

    /// Open an encrypted stream to the instance named by `name`.
    ///
    /// Waits for usable credentials (bounded by the connect timeout),
    /// selects an address by the IP kind preference, dials TCP, and
    /// performs the mTLS handshake with instance-bound peer verification.
    pub async fn connect(&self, name: &str, opts: &ConnectOptions) -> Result<ProxyStream> {
        let (info, _entry) = self.lookup(name, opts).await?;

        let default_pref = &self.config.ip_preference;
        let preference = opts.ip_preference.as_deref().unwrap_or(default_pref);
        let (kind, address) = select_address(info.metadata().ip_addresses(), preference)?;

        let timeout = opts
            .handshake_timeout
            .unwrap_or(self.config.handshake_timeout);
        debug!("[{name}] dialing {kind} address {address}");
        let stream = dialer::dial(
            info.tls_config(),
            address,
            self.config.server_proxy_port,
            timeout,
        )
        .await?;
        info!("[{name}] connected via {kind} address");
        Ok(stream)
    }

    /// Drop `stale` from its instance's cache and refresh immediately, if
    /// it is still the cached result. Call this before retrying a connect
    /// that failed with a peer-identity mismatch or another error
    /// suggesting stale credentials.
    pub async fn force_refresh(&self, stale: &Arc<ConnectionInfo>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let entry = self
            .entries
            .lock()
            .unwrap()
            .get(stale.connection_name())
            .cloned();
        if let Some(entry) = entry {
            entry.cache.force_refresh(stale).await;
        }
    }

    /// Connection info for an instance, refreshing if necessary. Useful
    /// for callers that embed the TLS config into their own dialing logic.
    pub async fn connection_info(
        &self,
        name: &str,
        opts: &ConnectOptions,
    ) -> Result<Arc<ConnectionInfo>> {
        let (info, _) = self.lookup(name, opts).await?;
        Ok(info)
    }

    /// Drop cached credentials for `name` so the next connect refreshes.
    /// No-op for instances this connector has never dialed.
    pub async fn invalidate(&self, name: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let resolved = self.resolve(name).await?;
        let entry = self.entries.lock().unwrap().get(&resolved).cloned();
        if let Some(entry) = entry {
            entry.cache.invalidate().await;
        }
        Ok(())
    }

    /// Close every instance entry and fail all future operations.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<Arc<Entry>> = {
            let mut map = self.entries.lock().unwrap();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.cache.close();
        }
        info!("connector closed ({} instance entries)", entries.len());
    }

    async fn resolve(&self, name: &str) -> Result<ConnectionName> {
        self.resolver
            .resolve(name)
            .await?
            .with_universe_domain(self.config.universe_domain.as_deref())
    }

    async fn lookup(
        &self,
        name: &str,
        opts: &ConnectOptions,
    ) -> Result<(Arc<ConnectionInfo>, Arc<Entry>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let resolved = self.resolve(name).await?;
        let entry = self.entry_for(resolved, opts)?;

        let info = tokio::time::timeout(self.config.connect_timeout, entry.cache.connection_info())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "[{name}] no connection info within {:?}",
                    self.config.connect_timeout
                ))
            })??;
        Ok((info, entry))
    }

    /// Get or create the entry for a canonical name. Creation happens
    /// under the registry lock, so two concurrent connects share one entry.
    fn entry_for(&self, name: ConnectionName, opts: &ConnectOptions) -> Result<Arc<Entry>> {
        let enable_iam_authn = opts
            .enable_iam_authn
            .unwrap_or(self.config.enable_iam_authn);

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&name) {
            if entry.enable_iam_authn != enable_iam_authn {
                return Err(Error::config(format!(
                    "[{name}] instance entry was created with \
                     enable_iam_authn={}, cannot override per connect",
                    entry.enable_iam_authn
                )));
            }
            return Ok(Arc::clone(entry));
        }

        debug!("[{name}] creating instance entry");
        let ctx = RefreshCtx {
            name: name.clone(),
            admin: Arc::clone(&self.admin),
            keys: Arc::clone(&self.keys),
            tokens: Arc::clone(&self.tokens),
            enable_iam_authn,
        };
        let cache = match self.config.refresh_strategy {
            RefreshStrategy::Background => {
                InstanceCache::Background(RefreshAheadCache::new(ctx, Arc::clone(&self.limiter)))
            }
            RefreshStrategy::Lazy => {
                InstanceCache::Lazy(LazyRefreshCache::new(ctx, Arc::clone(&self.limiter)))
            }
        };
        let entry = Arc::new(Entry {
            cache,
            enable_iam_authn,
        });
        entries.insert(name, Arc::clone(&entry));
        Ok(entry)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.config)
            .field("entries", &self.entries.lock().unwrap().len())
            .finish()
    }
}
