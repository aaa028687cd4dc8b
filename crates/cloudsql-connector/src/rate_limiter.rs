//! Token-bucket rate limiter for Admin API calls.
//!
//! One limiter is shared by every instance entry of a connector; a token is
//! acquired before each refresh attempt, so a misbehaving instance (or a
//! tight force-refresh loop) cannot hammer the control plane.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default burst capacity.
pub const DEFAULT_BURST: u32 = 2;

/// Default interval between token refills (one token every 30 seconds).
pub const DEFAULT_FILL_INTERVAL: Duration = Duration::from_secs(30);

struct LimiterState {
    tokens: f64,
    last_update: Instant,
}

/// Async token bucket.
///
/// Tokens replenish lazily at `1 / fill_interval` per second up to the burst
/// capacity. [`acquire`](AsyncRateLimiter::acquire) waits until a token is
/// available; acquisition order is the lock's FIFO order. The wait is a
/// plain `tokio::time::sleep`, so dropping the acquire future (caller
/// cancellation, entry close) releases the limiter cleanly.
pub struct AsyncRateLimiter {
    max_capacity: f64,
    rate: f64,
    state: Mutex<LimiterState>,
}

impl AsyncRateLimiter {
    /// Create a limiter with the given burst capacity and fill interval.
    pub fn new(max_capacity: u32, fill_interval: Duration) -> Self {
        let rate = 1.0 / fill_interval.as_secs_f64().max(f64::EPSILON);
        Self {
            max_capacity: f64::from(max_capacity.max(1)),
            rate,
            state: Mutex::new(LimiterState {
                tokens: f64::from(max_capacity.max(1)),
                last_update: Instant::now(),
            }),
        }
    }

    fn replenish(&self, state: &mut LimiterState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.max_capacity);
        state.last_update = now;
    }

    /// Wait for a token, then consume it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        self.replenish(&mut state);
        if state.tokens < 1.0 {
            let deficit = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate);
            tokio::time::sleep(wait).await;
            self.replenish(&mut state);
        }
        state.tokens -= 1.0;
    }
}

impl Default for AsyncRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BURST, DEFAULT_FILL_INTERVAL)
    }
}

impl std::fmt::Debug for AsyncRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRateLimiter")
            .field("max_capacity", &self.max_capacity)
            .field("rate", &self.rate)
            .finish()
    }
}
