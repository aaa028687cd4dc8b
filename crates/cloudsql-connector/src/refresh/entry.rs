//! Background refresh-ahead cache for one instance.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::{Error, Result};
use crate::rate_limiter::AsyncRateLimiter;
use crate::refresh::{perform_refresh, refresh_delay, ConnectionInfo, RefreshCtx};

/// Per-instance credential cache with a proactive refresh worker.
///
/// One worker task owns the published result and performs every refresh, so
/// at most one control-plane fetch is in flight per instance no matter how
/// timer ticks, forced invalidations, and dialers interleave. Publication
/// is a generation bump on a watch channel; dialers re-check the shared
/// state on every bump.
pub struct RefreshAheadCache {
    shared: Arc<EntryShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct EntryShared {
    ctx: RefreshCtx,
    limiter: Arc<AsyncRateLimiter>,
    // Guards only the fields below; never held across an await point.
    state: Mutex<EntryState>,
    wake: Notify,
    publish_tx: watch::Sender<u64>,
}

struct EntryState {
    /// Latest published outcome. `None` while the first (or a forced)
    /// refresh is pending.
    current: Option<Result<Arc<ConnectionInfo>>>,
    /// A refresh should run as soon as possible.
    needs_refresh: bool,
    closed: bool,
}

impl RefreshAheadCache {
    pub(crate) fn new(ctx: RefreshCtx, limiter: Arc<AsyncRateLimiter>) -> Self {
        let (publish_tx, _) = watch::channel(0);
        let shared = Arc::new(EntryShared {
            ctx,
            limiter,
            state: Mutex::new(EntryState {
                current: None,
                needs_refresh: true,
                closed: false,
            }),
            wake: Notify::new(),
            publish_tx,
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Current connection info, waiting for the in-flight refresh when
    /// nothing valid is published yet.
    ///
    /// Callers bound the wait with their own deadline.
    pub async fn connection_info(&self) -> Result<Arc<ConnectionInfo>> {
        let mut publish_rx = self.shared.publish_tx.subscribe();
        loop {
            // Mark the current generation seen before inspecting state, so
            // a publication racing with the check below flips `changed()`.
            publish_rx.borrow_and_update();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    return Err(Error::Closed);
                }
                match &state.current {
                    Some(Ok(info)) if !info.is_expired() => return Ok(Arc::clone(info)),
                    Some(Err(err)) => return Err(err.clone()),
                    Some(Ok(_)) => {
                        // Expired while the timer hasn't fired (e.g. the
                        // process was suspended). Ask for a refresh and
                        // wait like a first dialer.
                        if !state.needs_refresh {
                            state.needs_refresh = true;
                            self.shared.wake.notify_one();
                        }
                    }
                    None => {}
                }
            }
            if publish_rx.changed().await.is_err() {
                return Err(Error::Closed);
            }
        }
    }

    /// Drop `stale` from the cache and refresh immediately, if it is still
    /// the published result. Dialers holding `stale` are unaffected.
    pub fn force_refresh(&self, stale: &Arc<ConnectionInfo>) {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return;
        }
        let is_current = matches!(&state.current, Some(Ok(cur)) if Arc::ptr_eq(cur, stale));
        if is_current {
            debug!(
                "[{}] cached credentials invalidated, scheduling refresh",
                self.shared.ctx.name
            );
            state.current = None;
            state.needs_refresh = true;
            self.shared.wake.notify_one();
        }
    }

    /// Unconditionally drop whatever is published and refresh.
    pub fn invalidate(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.current = None;
        state.needs_refresh = true;
        self.shared.wake.notify_one();
    }

    /// Stop the refresh worker and fail all pending and future accessors.
    /// Idempotent.
    pub fn close(&self) {
        let worker = self.worker.lock().unwrap().take();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.current = None;
        }
        if let Some(handle) = worker {
            handle.abort();
        }
        self.shared.wake.notify_one();
        // Wake pending connection_info calls so they observe `closed`.
        self.shared.publish_tx.send_modify(|generation| *generation += 1);
    }
}

impl Drop for RefreshAheadCache {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(shared: Arc<EntryShared>) {
    let mut next_deadline: Option<Instant> = None;
    loop {
        // Wait until a refresh is requested or the timer is due.
        loop {
            {
                let state = shared.state.lock().unwrap();
                if state.closed {
                    return;
                }
                if state.needs_refresh {
                    break;
                }
            }
            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = shared.wake.notified() => {}
                        _ = sleep_until(deadline) => {
                            shared.state.lock().unwrap().needs_refresh = true;
                        }
                    }
                }
                None => shared.wake.notified().await,
            }
        }

        {
            let mut state = shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.needs_refresh = false;
        }
        next_deadline = None;

        // The limiter is the only pacing between retries.
        shared.limiter.acquire().await;
        if shared.state.lock().unwrap().closed {
            return;
        }

        debug!("[{}] refresh operation started", shared.ctx.name);
        let outcome = perform_refresh(&shared.ctx).await;

        {
            let mut state = shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            match outcome {
                Ok(info) => {
                    let delay = refresh_delay(info.expires_at(), Utc::now());
                    debug!(
                        "[{}] refresh completed, certificate expires at {}, next refresh in {:?}",
                        shared.ctx.name,
                        info.expires_at(),
                        delay
                    );
                    next_deadline = Some(Instant::now() + delay);
                    state.current = Some(Ok(info));
                }
                Err(err) => {
                    let serving_valid =
                        matches!(&state.current, Some(Ok(info)) if !info.is_expired());
                    if serving_valid {
                        warn!(
                            "[{}] refresh failed ({err}); keeping previously cached credentials",
                            shared.ctx.name
                        );
                    } else {
                        warn!(
                            "[{}] refresh failed with no valid credentials cached: {err}",
                            shared.ctx.name
                        );
                        state.current = Some(Err(err));
                    }
                    // Retry as soon as the limiter allows.
                    state.needs_refresh = true;
                }
            }
        }
        shared.publish_tx.send_modify(|generation| *generation += 1);
    }
}
