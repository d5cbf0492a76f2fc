//! Local rate limiter implementation

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::bucket::RateLimitBucket;
use super::config::RateLimitConfig;

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Send is allowed
    Allowed {
        remaining: u32,
        limit: u32,
        /// Window reset, Unix milliseconds
        reset_at: i64,
    },
    /// Send is denied until the window resets
    Denied {
        retry_after: u64,
        limit: u32,
        reset_at: i64,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    /// Window state as reported to clients
    pub fn quota(&self) -> RateLimitQuota {
        match *self {
            RateLimitResult::Allowed {
                remaining,
                limit,
                reset_at,
            } => RateLimitQuota {
                limit,
                remaining,
                reset_at,
            },
            RateLimitResult::Denied {
                limit, reset_at, ..
            } => RateLimitQuota {
                limit,
                remaining: 0,
                reset_at,
            },
        }
    }
}

/// Limit, tokens left and window reset for one user after a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitQuota {
    pub limit: u32,
    pub remaining: u32,
    /// Window reset, Unix milliseconds
    pub reset_at: i64,
}

impl RateLimitQuota {
    /// Window reset in whole Unix seconds, rounded up
    pub fn reset_at_secs(&self) -> i64 {
        (self.reset_at + 999).div_euclid(1000)
    }
}

/// Per-user fixed-window limiter.
///
/// Each user's bucket lives behind its DashMap shard lock while it is checked,
/// so concurrent sends for the same user are serialized and exactly
/// `max_tokens` of them succeed per window.
pub struct RateLimiter {
    buckets: DashMap<String, RateLimitBucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one token for `user_id`; `false` once the window is exhausted.
    pub fn check_limit(&self, user_id: &str) -> bool {
        self.check(user_id).is_allowed()
    }

    pub fn check(&self, user_id: &str) -> RateLimitResult {
        self.check_at(user_id, Utc::now())
    }

    pub fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> RateLimitResult {
        let limit = self.config.max_tokens;

        if !self.config.enabled {
            return RateLimitResult::Allowed {
                remaining: limit,
                limit,
                reset_at: now.timestamp_millis(),
            };
        }

        let window = chrono::Duration::milliseconds(self.config.window_ms());
        let mut bucket = self
            .buckets
            .entry(user_id.to_string())
            .or_insert_with(|| RateLimitBucket::new(limit, window, now));

        let allowed = bucket.try_consume(now);
        let reset_at = bucket.reset_at().timestamp_millis();

        if allowed {
            RateLimitResult::Allowed {
                remaining: bucket.tokens_remaining,
                limit,
                reset_at,
            }
        } else {
            tracing::debug!(
                user_id = %user_id,
                window_start = %bucket.window_start,
                "Send rate limit exhausted"
            );
            RateLimitResult::Denied {
                retry_after: bucket.retry_after(now),
                limit,
                reset_at,
            }
        }
    }

    /// Clean up buckets that haven't been used recently
    pub fn cleanup_stale(&self) -> usize {
        self.cleanup_stale_at(Utc::now())
    }

    pub fn cleanup_stale_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::milliseconds(self.config.bucket_ttl.as_millis() as i64);
        let before = self.buckets.len();

        // A bucket whose window is still open keeps its count even past the TTL
        self.buckets
            .retain(|_, bucket| now - bucket.last_activity() < ttl || now < bucket.reset_at());

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            tracing::debug!(
                removed = removed,
                buckets = self.buckets.len(),
                "Cleaned up stale rate limit buckets"
            );
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            enabled: self.config.enabled,
            buckets: self.buckets.len(),
            limit: self.config.max_tokens,
            window_seconds: self.config.window.as_secs(),
        }
    }
}

/// Statistics about the rate limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub buckets: usize,
    pub limit: u32,
    pub window_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter(max_tokens: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_tokens,
            ..Default::default()
        })
    }

    #[test]
    fn test_rate_limiter_disabled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            ..Default::default()
        });

        for _ in 0..100 {
            assert!(limiter.check_limit("user-1"));
        }
        assert_eq!(limiter.stats().buckets, 0);
    }

    #[test]
    fn test_admits_max_tokens_per_window() {
        let limiter = limiter(10);

        for i in 0..10 {
            assert!(limiter.check_limit("creator-1"), "send {} should pass", i + 1);
        }
        assert!(!limiter.check_limit("creator-1"));
    }

    #[test]
    fn test_users_have_independent_buckets() {
        let limiter = limiter(3);

        for _ in 0..3 {
            assert!(limiter.check_limit("key-1"));
        }
        assert!(!limiter.check_limit("key-1"));

        for _ in 0..3 {
            assert!(limiter.check_limit("key-2"));
        }
        assert!(!limiter.check_limit("key-2"));
    }

    #[test]
    fn test_window_resets_after_sixty_seconds() {
        let limiter = limiter(10);
        let start = Utc::now();

        for _ in 0..10 {
            assert!(limiter.check_at("u", start).is_allowed());
        }
        assert!(!limiter.check_at("u", start + chrono::Duration::seconds(30)).is_allowed());

        let result = limiter.check_at("u", start + chrono::Duration::seconds(61));
        assert_eq!(
            result,
            RateLimitResult::Allowed {
                remaining: 9,
                limit: 10,
                reset_at: (start + chrono::Duration::seconds(121)).timestamp_millis(),
            }
        );
    }

    #[test]
    fn test_denied_reports_retry_after() {
        let limiter = limiter(1);
        let start = Utc::now();
        assert!(limiter.check_at("u", start).is_allowed());

        match limiter.check_at("u", start + chrono::Duration::seconds(45)) {
            RateLimitResult::Denied { retry_after, limit, .. } => {
                assert_eq!(retry_after, 15);
                assert_eq!(limit, 1);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_max() {
        let limiter = Arc::new(limiter(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..5).filter(|_| limiter.check_limit("hot-user")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_quota_counts_down_to_zero() {
        let limiter = limiter(2);
        let now = Utc::now();

        let first = limiter.check_at("u", now).quota();
        assert_eq!(first.limit, 2);
        assert_eq!(first.remaining, 1);
        assert_eq!(limiter.check_at("u", now).quota().remaining, 0);

        let denied = limiter.check_at("u", now).quota();
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, first.reset_at);
    }

    #[test]
    fn test_quota_reset_rounds_up_to_seconds() {
        let quota = RateLimitQuota {
            limit: 10,
            remaining: 9,
            reset_at: 1_700_000_000_001,
        };
        assert_eq!(quota.reset_at_secs(), 1_700_000_001);
    }

    #[test]
    fn test_cleanup_stale_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            bucket_ttl: Duration::from_secs(300),
            ..Default::default()
        });
        let start = Utc::now();
        limiter.check_at("old", start);
        limiter.check_at("fresh", start + chrono::Duration::seconds(290));

        let removed = limiter.cleanup_stale_at(start + chrono::Duration::seconds(301));
        assert_eq!(removed, 1);
        assert_eq!(limiter.stats().buckets, 1);
    }
}
