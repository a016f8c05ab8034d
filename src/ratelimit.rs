//! Per-key sliding-window rate limiting for the device activation API.
//!
//! State lives in a [`DashMap`] like the other shared registries. Expired
//! timestamps are evicted on access; a periodic sweep, driven by a check
//! counter, drops keys that have gone idle so the map stays bounded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Keys tracked at once. New keys bounce once the map is full; known
/// keys keep being served.
const MAX_TRACKED_KEYS: usize = 4096;

/// Every this many checks, one full sweep drops idle keys.
const SWEEP_EVERY: usize = 512;

/// Allows at most `max_attempts` per key within `window`.
pub struct RateLimiter {
    max_attempts: usize,
    window: Duration,
    stamps: DashMap<String, VecDeque<Instant>>,
    checks: AtomicUsize,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            stamps: DashMap::new(),
            checks: AtomicUsize::new(0),
        }
    }

    /// Records an attempt for `key`. Returns false when the key is over
    /// its budget for the current window.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        self.maybe_sweep(now);

        if let Some(mut entry) = self.stamps.get_mut(key) {
            // Stamps are pushed in order, so expiry only ever trims the
            // front.
            while entry
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                entry.pop_front();
            }
            if entry.len() >= self.max_attempts {
                return false;
            }
            entry.push_back(now);
            return true;
        }

        if self.stamps.len() >= MAX_TRACKED_KEYS {
            return false;
        }
        self.stamps.entry(key.to_string()).or_default().push_back(now);
        true
    }

    fn maybe_sweep(&self, now: Instant) {
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != 0 {
            return;
        }
        // A key is live while its newest stamp is still inside the window.
        self.stamps
            .retain(|_, stamps| {
                stamps
                    .back()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
    }
}

/// The three per-IP limits of the device activation flow.
pub struct DeviceRateLimits {
    pub create: RateLimiter,
    pub claim: RateLimiter,
    pub poll: RateLimiter,
}

impl DeviceRateLimits {
    pub fn new() -> Self {
        Self {
            create: RateLimiter::new(5, Duration::from_secs(60)),
            claim: RateLimiter::new(10, Duration::from_secs(60)),
            poll: RateLimiter::new(30, Duration::from_secs(60)),
        }
    }
}

impl Default for DeviceRateLimits {
    fn default() -> Self {
        Self::new()
    }
}
