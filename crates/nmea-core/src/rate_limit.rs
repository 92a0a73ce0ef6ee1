//! Fixed-window rate limiter for live emissions.

use std::time::{Duration, Instant};

/// Length of one counting window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Counts emissions in fixed one-second windows.
///
/// A ceiling of zero disables limiting.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_window: u32,
    window_start: Option<Instant>,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_window: max_per_second,
            window_start: None,
            count: 0,
        }
    }

    pub fn max_per_second(&self) -> u32 {
        self.max_per_window
    }

    pub fn set_max_per_second(&mut self, max_per_second: u32) {
        self.max_per_window = max_per_second;
    }

    /// Take one slot in the window containing `now`.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.max_per_window == 0 {
            return true;
        }

        let expired = self
            .window_start
            .map_or(true, |start| now.saturating_duration_since(start) >= RATE_WINDOW);
        if expired {
            self.window_start = Some(now);
            self.count = 0;
        }

        if self.count < self.max_per_window {
            self.count += 1;
            true
        } else {
            false
        }
    }
}
