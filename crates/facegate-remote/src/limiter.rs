//! Fixed-window request limiter.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    window_start: Option<Instant>,
    used: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: None,
            used: 0,
        }
    }

    /// Take one slot in the current window. Excess requests are refused,
    /// never queued.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let expired = match self.window_start {
            None => true,
            Some(start) => now.saturating_duration_since(start) > self.window,
        };
        if expired {
            self.window_start = Some(now);
            self.used = 0;
        }
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    /// (used, limit) in the current window.
    pub fn usage(&self) -> (u32, u32) {
        (self.used, self.limit)
    }
}
