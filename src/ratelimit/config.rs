//! Rate limiting configuration

use std::time::Duration;

use crate::config::RateLimitSettings;

/// Runtime configuration of the per-user send limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Sends admitted per user within one window
    pub max_tokens: u32,
    /// Length of a fixed window, anchored at its first request
    pub window: Duration,
    /// Time after which an untouched bucket is removed
    pub bucket_ttl: Duration,
    /// Backend type: "local" or "redis"
    pub backend: String,
    /// Redis key prefix for rate limit counters
    pub redis_prefix: String,
}

impl RateLimitConfig {
    pub fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&RateLimitSettings::default())
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_tokens: settings.max_tokens,
            window: Duration::from_secs(settings.window_seconds),
            bucket_ttl: Duration::from_secs(settings.bucket_ttl_seconds),
            backend: settings.backend.clone(),
            redis_prefix: settings.redis_prefix.clone(),
        }
    }
}
