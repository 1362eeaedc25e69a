//! Fixed-window, per-client request limiter.
//!
//! [`RateLimiter`] counts requests per client key and answers whether a key
//! has gone over a single shared limit. The whole key→count map is cleared in
//! one step every `window`, on boundaries anchored to the limiter's creation
//! instant rather than to each client's first request.
//!
//! A consequence worth knowing about: a client whose first request lands just
//! before a boundary gets a much shorter effective window than one arriving
//! just after, and can burst up to twice the limit across the boundary.
//!
//! ## Usage
//!
//! The canonical order is increment-then-check, which allows exactly `limit`
//! requests per window and rejects from request `limit + 1` onwards.
//! [`RateLimiter::admit`] performs both steps under a single lock.

use crate::error::{Error, Result};
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;

/// Outcome of an increment-then-check admission query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The request fits in the client's budget for this window.
    Allowed { count: u64 },
    /// The client is over the limit; the request must be refused.
    Rejected { count: u64 },
}

impl Decision {
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// The client's request count after this request was recorded.
    pub const fn count(self) -> u64 {
        match self {
            Self::Allowed { count } | Self::Rejected { count } => count,
        }
    }
}

/// Tracks a request count per client key inside a global fixed window.
pub struct RateLimiter {
    usage: Mutex<HashMap<String, u64>>,
    limit: u64,
    window: Duration,
    anchor: Instant,
}

impl RateLimiter {
    /// Creates a limiter without starting the periodic reset.
    ///
    /// The window is anchored to the moment of this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `limit` or `window` is zero.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(Error::invalid_config("rate limit must be greater than 0"));
        }
        if window.is_zero() {
            return Err(Error::invalid_config(
                "rate limit window must be greater than 0",
            ));
        }

        Ok(Self {
            usage: Mutex::new(HashMap::new()),
            limit,
            window,
            anchor: Instant::now(),
        })
    }

    /// Creates a limiter and starts its periodic reset on the current tokio
    /// runtime.
    ///
    /// The reset task stops when `shutdown` is cancelled or once the limiter
    /// has been dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `limit` or `window` is zero.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn initialize(
        limit: u64,
        window: Duration,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let limiter = Arc::new(Self::new(limit, window)?);
        limiter.spawn_reset_loop(shutdown);

        #[cfg(feature = "tracing")]
        tracing::info!("Rate limiter initialized: {limit} requests per {window:?}");

        Ok(limiter)
    }

    /// Spawns the task that clears every counter once per window.
    ///
    /// Ticks fall on `anchor + k * window`, starting from the first boundary
    /// after the call; a tick missed under load is skipped rather than
    /// replayed so boundaries stay aligned to the anchor.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn_reset_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        let first = next_boundary(self.anchor, self.window, Instant::now());
        let mut ticker = interval_at(first, self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !reset_if_alive(&limiter) {
                            break;
                        }
                    }
                    () = shutdown.cancelled() => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Rate limiter reset loop cancelled");
                        break;
                    }
                }
            }
        })
    }

    /// Records one request for `key`.
    pub fn increment(&self, key: &str) {
        let mut usage = self.usage.lock();
        bump(&mut usage, key);
    }

    /// Returns `true` iff the count for `key` is strictly greater than the
    /// limit. Unseen keys count as zero.
    pub fn exceeds_limit(&self, key: &str) -> bool {
        self.count(key) > self.limit
    }

    /// Increments `key` and checks it against the limit in one step.
    pub fn admit(&self, key: &str) -> Decision {
        let count = {
            let mut usage = self.usage.lock();
            bump(&mut usage, key)
        };

        if count > self.limit {
            Decision::Rejected { count }
        } else {
            Decision::Allowed { count }
        }
    }

    /// Returns the current count for `key` (zero if unseen).
    pub fn count(&self, key: &str) -> u64 {
        self.usage.lock().get(key).copied().unwrap_or(0)
    }

    /// Clears every counter at once and returns how many keys were tracked.
    pub fn reset(&self) -> usize {
        let cleared = core::mem::take(&mut *self.usage.lock());
        cleared.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.usage.lock().len()
    }

    pub const fn limit(&self) -> u64 {
        self.limit
    }

    pub const fn window(&self) -> Duration {
        self.window
    }
}

impl core::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

/// First instant on the `anchor + k * window` grid strictly after `now`.
fn next_boundary(anchor: Instant, window: Duration, now: Instant) -> Instant {
    let elapsed = now.saturating_duration_since(anchor).as_nanos();
    let into_window = u64::try_from(elapsed % window.as_nanos()).unwrap_or(0);
    now + window.saturating_sub(Duration::from_nanos(into_window))
}

fn bump(usage: &mut HashMap<String, u64>, key: &str) -> u64 {
    // Avoid allocating a new key on the hot path once the client is known.
    if let Some(count) = usage.get_mut(key) {
        *count = count.saturating_add(1);
        *count
    } else {
        usage.insert(key.to_owned(), 1);
        1
    }
}

fn reset_if_alive(limiter: &Weak<RateLimiter>) -> bool {
    let Some(limiter) = limiter.upgrade() else {
        #[cfg(feature = "tracing")]
        tracing::debug!("Rate limiter dropped; stopping reset loop");
        return false;
    };

    let _cleared = limiter.reset();
    #[cfg(feature = "tracing")]
    tracing::trace!("Rate limit window elapsed; cleared {_cleared} keys");
    true
}
