//! Per-user send rate limiting with fixed windows.
//!
//! Each user may enqueue `max_tokens` messages per window (10 per 60 s by
//! default). Supports local (in-memory) and distributed (Redis) backends.

mod bucket;
mod config;
mod distributed;
mod limiter;

pub use bucket::RateLimitBucket;
pub use config::RateLimitConfig;
pub use distributed::{
    create_distributed_rate_limiter, DistributedRateLimiter, LocalRateLimiterBackend,
    RateLimitBackendType, RateLimitError, RedisRateLimiterBackend,
};
pub use limiter::{RateLimitQuota, RateLimitResult, RateLimiter, RateLimiterStats};
