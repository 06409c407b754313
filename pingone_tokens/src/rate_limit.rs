//! A minimum-interval gate for token requests

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use pingone_clock::{Clock, DurationMs, System, UnixTimeMs};

use crate::SharedClock;

/// Default spacing between token requests, allowing at most 20 per second
pub const DEFAULT_MIN_INTERVAL: DurationMs = DurationMs(50);

/// Refuses a request made too soon after the previous one
///
/// Only requests that are let through are recorded, so a refused request
/// does not push the next permitted time further out.
pub struct RateLimiter {
    min_interval: DurationMs,
    last_request: Mutex<Option<UnixTimeMs>>,
    clock: SharedClock,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("min_interval", &self.min_interval)
            .field("last_request", &*self.last_request.lock())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

impl RateLimiter {
    /// A limiter spacing requests by `min_interval`, on the system clock
    pub fn new(min_interval: DurationMs) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
            clock: Arc::new(System),
        }
    }

    /// Uses the provided clock instead of the system clock
    pub fn with_clock<C>(self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// The configured spacing
    pub fn min_interval(&self) -> DurationMs {
        self.min_interval
    }

    /// Lets a request through and records it, or refuses it
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last_request.lock();

        match *last {
            Some(prev) if now.saturating_since(prev).0 < self.min_interval.0 => {
                tracing::trace!(
                    since_last_ms = now.saturating_since(prev).0,
                    "token request refused by rate limiter"
                );
                false
            }
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// How long until a request would be let through
    pub fn retry_after(&self) -> DurationMs {
        let now = self.clock.now();
        match *self.last_request.lock() {
            Some(prev) => self.min_interval - now.saturating_since(prev),
            None => DurationMs::ZERO,
        }
    }
}
