//! On-demand refresh cache for one instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::rate_limiter::AsyncRateLimiter;
use crate::refresh::{perform_refresh, refresh_buffer, ConnectionInfo, RefreshCtx};

/// Per-instance credential cache without a background worker.
///
/// A refresh runs inside [`connection_info`](LazyRefreshCache::connection_info)
/// when the cache is empty, invalidated, or within the refresh buffer of
/// expiry. The entry lock makes the refresh single-flight: concurrent
/// dialers queue on the lock and the first one through repopulates the
/// cache for the rest.
///
/// Suited to environments where CPU is only reliably available while a
/// request is being served, e.g. severely throttled serverless containers.
pub struct LazyRefreshCache {
    ctx: RefreshCtx,
    limiter: Arc<AsyncRateLimiter>,
    state: Mutex<LazyState>,
    closed: AtomicBool,
}

struct LazyState {
    cached: Option<Arc<ConnectionInfo>>,
    needs_refresh: bool,
}

impl LazyRefreshCache {
    pub(crate) fn new(ctx: RefreshCtx, limiter: Arc<AsyncRateLimiter>) -> Self {
        Self {
            ctx,
            limiter,
            state: Mutex::new(LazyState {
                cached: None,
                needs_refresh: false,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Current connection info, refreshing in-line when the cached value is
    /// missing, invalidated, or about to expire.
    pub async fn connection_info(&self) -> Result<Arc<ConnectionInfo>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if let Some(info) = &state.cached {
            // Pad expiry with the buffer so the caller has time to finish a
            // handshake with the certificate it gets back.
            if !state.needs_refresh && Utc::now() < info.expires_at() - refresh_buffer() {
                debug!(
                    "[{}] cached connection info is still valid",
                    self.ctx.name
                );
                return Ok(Arc::clone(info));
            }
        }

        debug!("[{}] refresh operation started", self.ctx.name);
        self.limiter.acquire().await;
        match perform_refresh(&self.ctx).await {
            Ok(info) => {
                debug!(
                    "[{}] refresh completed, certificate expires at {}",
                    self.ctx.name,
                    info.expires_at()
                );
                state.cached = Some(Arc::clone(&info));
                state.needs_refresh = false;
                Ok(info)
            }
            Err(err) => {
                if let Some(info) = &state.cached {
                    if !info.is_expired() {
                        warn!(
                            "[{}] refresh failed ({err}); serving previously cached credentials",
                            self.ctx.name
                        );
                        return Ok(Arc::clone(info));
                    }
                }
                warn!(
                    "[{}] refresh failed with no valid credentials cached: {err}",
                    self.ctx.name
                );
                Err(err)
            }
        }
    }

    /// Drop `stale` from the cache so the next dial refreshes, if it is
    /// still the cached result.
    pub async fn force_refresh(&self, stale: &Arc<ConnectionInfo>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        let is_current = matches!(&state.cached, Some(cur) if Arc::ptr_eq(cur, stale));
        if is_current {
            state.needs_refresh = true;
        }
    }

    /// Unconditionally mark the cache for refresh on the next dial.
    pub async fn invalidate(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.state.lock().await.needs_refresh = true;
    }

    /// Fail all future accessors. Idempotent; there is no background work
    /// to cancel.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
