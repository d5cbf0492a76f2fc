//! Fixed-window token bucket

use chrono::{DateTime, Duration, Utc};

/// Per-user token allowance for one fixed window.
///
/// Invariant: `0 <= tokens_remaining <= max_tokens`. The window restarts at
/// the first request made after `window_start + window_size` has passed, so
/// windows are anchored at a request and never slide.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    pub tokens_remaining: u32,
    pub window_start: DateTime<Utc>,
    pub window_size: Duration,
    pub max_tokens: u32,
    last_activity: DateTime<Utc>,
}

impl RateLimitBucket {
    pub fn new(max_tokens: u32, window_size: Duration, now: DateTime<Utc>) -> Self {
        Self {
            tokens_remaining: max_tokens,
            window_start: now,
            window_size,
            max_tokens,
            last_activity: now,
        }
    }

    /// Take one token, refilling first if the current window has ended.
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> bool {
        self.last_activity = now;

        if now - self.window_start >= self.window_size {
            self.window_start = now;
            self.tokens_remaining = self.max_tokens;
        }

        if self.tokens_remaining > 0 {
            self.tokens_remaining -= 1;
            true
        } else {
            false
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + self.window_size
    }

    /// Whole seconds until the window resets, at least 1
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        let remaining_ms = (self.reset_at() - now).num_milliseconds().max(0) as u64;
        remaining_ms.div_ceil(1000).max(1)
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }
}
