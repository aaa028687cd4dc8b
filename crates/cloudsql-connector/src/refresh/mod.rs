//! Credential refresh engine.
//!
//! A refresh fetches instance metadata and a freshly signed client
//! certificate from the control plane, validates and assembles them into an
//! immutable [`ConnectionInfo`], and hands it to one of two caches:
//! [`RefreshAheadCache`] keeps credentials fresh with a background worker,
//! [`LazyRefreshCache`] refreshes on demand inside `connect`.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::admin::AdminClient;
use crate::auth::TokenSource;
use crate::error::{Error, Result};
use crate::instance::ConnectionName;
use crate::keys::ClientKeys;

mod entry;
mod info;
mod lazy;

pub use entry::RefreshAheadCache;
pub use info::ConnectionInfo;
pub use lazy::LazyRefreshCache;

/// Pad between a scheduled refresh and certificate expiry, in seconds;
/// gives a dialer holding the old credentials time to finish its handshake.
pub(crate) const REFRESH_BUFFER_SECS: i64 = 4 * 60;

/// [`REFRESH_BUFFER_SECS`] as a chrono duration.
pub(crate) fn refresh_buffer() -> ChronoDuration {
    ChronoDuration::seconds(REFRESH_BUFFER_SECS)
}

/// Everything one instance entry needs to perform a refresh.
pub(crate) struct RefreshCtx {
    pub name: ConnectionName,
    pub admin: Arc<dyn AdminClient>,
    pub keys: Arc<ClientKeys>,
    pub tokens: Arc<dyn TokenSource>,
    pub enable_iam_authn: bool,
}

/// Perform one full refresh: metadata and certificate are fetched
/// concurrently and joined into a [`ConnectionInfo`].
///
/// The caller is responsible for single-flight and rate limiting.
pub(crate) async fn perform_refresh(ctx: &RefreshCtx) -> Result<Arc<ConnectionInfo>> {
    let login_token = if ctx.enable_iam_authn {
        let token = ctx.tokens.login_token().await?;
        if token.expires_at().is_none() {
            return Err(Error::config(
                "IAM database authentication requires a token source that reports token expiry",
            ));
        }
        if token.is_expired() {
            return Err(Error::permission("database login token is already expired"));
        }
        Some(token)
    } else {
        None
    };

    let (metadata, client_chain) = tokio::try_join!(
        ctx.admin.get_instance_metadata(&ctx.name),
        ctx.admin
            .sign_client_cert(&ctx.name, ctx.keys.public_key_pem(), login_token.as_ref()),
    )?;

    if ctx.enable_iam_authn && !metadata.supports_auto_iam_authn() {
        return Err(Error::config(format!(
            "{} does not support IAM database authentication; it is available \
             for Postgres and MySQL instances only",
            metadata.database_version()
        )));
    }

    let info = ConnectionInfo::new(
        &ctx.name,
        metadata,
        client_chain,
        ctx.keys.private_key_der(),
        login_token.and_then(|t| t.expires_at()),
        ctx.enable_iam_authn,
    )?;
    Ok(Arc::new(info))
}

/// How long to wait before the next proactive refresh.
///
/// More than an hour of lifetime left: refresh at the halfway point. Under
/// an hour but more than the buffer: refresh a buffer's worth before
/// expiry. Anything shorter: refresh immediately.
pub(crate) fn refresh_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> std::time::Duration {
    let remaining = expires_at - now;
    let delay = if remaining > ChronoDuration::hours(1) {
        remaining / 2
    } else if remaining > refresh_buffer() {
        remaining - refresh_buffer()
    } else {
        ChronoDuration::zero()
    };
    delay.to_std().unwrap_or_default()
}
