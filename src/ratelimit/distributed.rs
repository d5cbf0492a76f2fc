//! Distributed rate limiting backend

use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;

use crate::metrics::RateLimitMetrics;
use crate::redis::{current_time_ms, RedisPool};

use super::config::RateLimitConfig;
use super::limiter::{RateLimitResult, RateLimiter};

lazy_static! {
    /// Counts a send in the user's window. The key expiry is set on the first
    /// increment only, so the window is anchored at the first request.
    static ref FIXED_WINDOW_SCRIPT: redis::Script = redis::Script::new(
        r#"
        local current = redis.call('INCR', KEYS[1])
        if current == 1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
        end
        local ttl = redis.call('PTTL', KEYS[1])
        if ttl < 0 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
            ttl = tonumber(ARGV[1])
        end
        return {current, ttl}
        "#,
    );
}

/// Backend type for distributed rate limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBackendType {
    /// Local in-memory rate limiting (single instance)
    Local,
    /// Redis-backed rate limiting shared by every instance
    Redis,
}

impl RateLimitBackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitBackendType::Local => "local",
            RateLimitBackendType::Redis => "redis",
        }
    }
}

/// Error type for distributed rate limiter
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit backend error: {0}")]
    BackendError(String),
}

/// Per-user send limiter shared by the HTTP layer.
#[async_trait]
pub trait DistributedRateLimiter: Send + Sync {
    fn backend_type(&self) -> RateLimitBackendType;

    /// Consume one token for `user_id` and describe the outcome
    async fn check(&self, user_id: &str) -> RateLimitResult;

    async fn check_limit(&self, user_id: &str) -> bool {
        self.check(user_id).await.is_allowed()
    }

    /// Drop idle in-memory state; returns the number of buckets removed
    fn cleanup_stale(&self) -> usize;
}

fn record(backend: RateLimitBackendType, result: &RateLimitResult) {
    if result.is_allowed() {
        RateLimitMetrics::record_allowed(backend.as_str());
    } else {
        RateLimitMetrics::record_denied(backend.as_str());
    }
}

/// Local rate limiter adapter for distributed interface
pub struct LocalRateLimiterBackend {
    limiter: Arc<RateLimiter>,
}

impl LocalRateLimiterBackend {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl DistributedRateLimiter for LocalRateLimiterBackend {
    fn backend_type(&self) -> RateLimitBackendType {
        RateLimitBackendType::Local
    }

    async fn check(&self, user_id: &str) -> RateLimitResult {
        let result = self.limiter.check(user_id);
        record(self.backend_type(), &result);
        result
    }

    fn cleanup_stale(&self) -> usize {
        self.limiter.cleanup_stale()
    }
}

/// Redis-backed fixed-window counter.
///
/// When Redis cannot be reached the check is answered by the local limiter so
/// sends keep flowing with per-instance limits.
pub struct RedisRateLimiterBackend {
    pool: Arc<RedisPool>,
    fallback: Arc<RateLimiter>,
    config: RateLimitConfig,
}

impl RedisRateLimiterBackend {
    pub fn new(pool: Arc<RedisPool>, fallback: Arc<RateLimiter>, config: RateLimitConfig) -> Self {
        Self {
            pool,
            fallback,
            config,
        }
    }

    fn rate_limit_key(&self, user_id: &str) -> String {
        format!("{}:{}", self.config.redis_prefix, user_id)
    }

    async fn check_redis(&self, user_id: &str) -> Result<RateLimitResult, RateLimitError> {
        let key = self.rate_limit_key(user_id);
        let window_ms = self.config.window_ms();

        let (count, ttl_ms): (i64, i64) = self
            .pool
            .execute(|mut conn| async move {
                let reply: redis::RedisResult<(i64, i64)> = FIXED_WINDOW_SCRIPT
                    .key(&key)
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await;
                reply
            })
            .await
            .map_err(|e| RateLimitError::BackendError(e.to_string()))?;

        let limit = self.config.max_tokens;
        let reset_at = current_time_ms() + ttl_ms.max(0);

        tracing::debug!(
            user_id = %user_id,
            count = count,
            limit = limit,
            "Distributed rate limit check"
        );

        if count <= limit as i64 {
            Ok(RateLimitResult::Allowed {
                remaining: limit - count as u32,
                limit,
                reset_at,
            })
        } else {
            Ok(RateLimitResult::Denied {
                retry_after: (ttl_ms.max(0) as u64).div_ceil(1000).max(1),
                limit,
                reset_at,
            })
        }
    }
}

#[async_trait]
impl DistributedRateLimiter for RedisRateLimiterBackend {
    fn backend_type(&self) -> RateLimitBackendType {
        RateLimitBackendType::Redis
    }

    async fn check(&self, user_id: &str) -> RateLimitResult {
        if !self.config.enabled {
            return self.fallback.check(user_id);
        }

        match self.check_redis(user_id).await {
            Ok(result) => {
                record(self.backend_type(), &result);
                result
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Redis rate limiter unavailable, using local limiter"
                );
                let result = self.fallback.check(user_id);
                record(RateLimitBackendType::Local, &result);
                result
            }
        }
    }

    fn cleanup_stale(&self) -> usize {
        // Redis counters expire on their own
        self.fallback.cleanup_stale()
    }
}

/// Create a distributed rate limiter based on configuration
pub fn create_distributed_rate_limiter(
    config: &RateLimitConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn DistributedRateLimiter> {
    let local = Arc::new(RateLimiter::new(config.clone()));

    if config.backend == "redis" {
        if let Some(pool) = redis_pool {
            tracing::info!(
                prefix = %config.redis_prefix,
                "Creating Redis distributed rate limiter"
            );
            return Arc::new(RedisRateLimiterBackend::new(pool, local, config.clone()));
        }
        tracing::warn!("Redis rate limiter requested but pool not available, falling back to local");
    } else {
        tracing::info!("Using local rate limiter");
    }

    Arc::new(LocalRateLimiterBackend::new(local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::redis::CircuitBreaker;

    #[tokio::test]
    async fn test_local_rate_limiter_backend() {
        let config = RateLimitConfig {
            max_tokens: 2,
            ..Default::default()
        };
        let backend = LocalRateLimiterBackend::new(Arc::new(RateLimiter::new(config)));

        assert_eq!(backend.backend_type(), RateLimitBackendType::Local);
        assert!(backend.check_limit("creator").await);
        assert!(backend.check_limit("creator").await);
        assert!(!backend.check_limit("creator").await);
    }

    #[test]
    fn test_rate_limit_error_display() {
        let err = RateLimitError::BackendError("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }

    #[test]
    fn test_create_local_distributed_rate_limiter() {
        let config = RateLimitConfig::default();
        let distributed = create_distributed_rate_limiter(&config, None);
        assert_eq!(distributed.backend_type(), RateLimitBackendType::Local);
    }

    #[test]
    fn test_redis_without_pool_falls_back_to_local() {
        let config = RateLimitConfig {
            backend: "redis".to_string(),
            ..Default::default()
        };
        let distributed = create_distributed_rate_limiter(&config, None);
        assert_eq!(distributed.backend_type(), RateLimitBackendType::Local);
    }

    #[tokio::test]
    async fn test_redis_errors_fall_back_to_local_limits() {
        let cb = Arc::new(CircuitBreaker::new());
        for _ in 0..5 {
            cb.record_failure();
        }
        let pool = Arc::new(RedisPool::new(RedisConfig::default(), cb).unwrap());
        let config = RateLimitConfig {
            backend: "redis".to_string(),
            max_tokens: 1,
            ..Default::default()
        };
        let distributed = create_distributed_rate_limiter(&config, Some(pool));

        assert_eq!(distributed.backend_type(), RateLimitBackendType::Redis);
        assert!(distributed.check_limit("u").await);
        assert!(!distributed.check_limit("u").await);
    }
}
