//! Per-address fixed-window request counting.
//!
//! Bursts straddling a window boundary may see up to twice the limit; that
//! approximation is accepted in exchange for O(1) state per address.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{config::RateLimitConfig, error::RelayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u32,
    pub window_reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<IpAddr, RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn admit(&self, addr: IpAddr) -> Result<(), RelayError> {
        self.admit_at(addr, Instant::now())
    }

    /// Count one request from `addr` observed at `now`.
    pub fn admit_at(&self, addr: IpAddr, now: Instant) -> Result<(), RelayError> {
        let rejected = {
            let mut windows = self.windows.lock();
            // A fresh entry starts already elapsed so it takes the reset path.
            let window = windows.entry(addr).or_insert(RateWindow {
                count: 0,
                window_reset_at: now,
            });
            if now >= window.window_reset_at {
                *window = RateWindow {
                    count: 1,
                    window_reset_at: now + self.window,
                };
                false
            } else {
                window.count = window.count.saturating_add(1);
                window.count > self.max_requests
            }
        };

        if rejected {
            warn!(remote_addr = %addr, "rate limit exceeded");
            counter!("tether_relay_rate_limited_total").increment(1);
            return Err(RelayError::RateLimited);
        }
        Ok(())
    }

    pub fn window_for(&self, addr: &IpAddr) -> Option<RateWindow> {
        self.windows.lock().get(addr).copied()
    }

    /// Drop windows that have already elapsed; returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| now < window.window_reset_at);
        let purged = before - windows.len();
        if purged > 0 {
            debug!(purged, remaining = windows.len(), "purged expired rate windows");
        }
        purged
    }

    pub fn tracked_addresses(&self) -> usize {
        self.windows.lock().len()
    }
}
