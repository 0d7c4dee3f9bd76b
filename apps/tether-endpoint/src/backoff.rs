use std::time::Duration;

use crate::config::BackoffConfig;

/// Doubling reconnect delay, capped at `max` and reset to `floor` after a
/// session that reached the active state.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let floor = config.floor.min(config.max);
        Self {
            floor,
            max: config.max,
            current: floor,
        }
    }

    /// Delay to wait before the next attempt; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
