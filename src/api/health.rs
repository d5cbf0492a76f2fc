//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::queue::QueueBackendStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub queue: QueueHealthResponse,
    pub rate_limiter: RateLimiterHealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct QueueHealthResponse {
    pub backend: String,
    pub reachable: bool,
    pub depth: usize,
    pub in_flight: usize,
    pub dlq: usize,
}

#[derive(Debug, Serialize)]
pub struct RateLimiterHealthResponse {
    pub backend: String,
    pub limit: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub circuit_breaker_state: String,
    pub healthy: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (reachable, stats) = match state.queue.stats().await {
        Ok(stats) => (true, stats),
        Err(e) => {
            tracing::warn!(error = %e, "Queue unreachable during health check");
            (false, QueueBackendStats::default())
        }
    };

    let redis = state.redis_pool.as_ref().map(|pool| RedisHealthResponse {
        circuit_breaker_state: pool.circuit_state().as_str().to_string(),
        healthy: pool.is_healthy(),
    });

    let redis_ok = redis.as_ref().map(|r| r.healthy).unwrap_or(true);
    let status = if reachable && redis_ok { "healthy" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        queue: QueueHealthResponse {
            backend: state.queue.backend_type().to_string(),
            reachable,
            depth: stats.queue_depth,
            in_flight: stats.messages_in_flight,
            dlq: stats.dlq_count,
        },
        rate_limiter: RateLimiterHealthResponse {
            backend: state.rate_limiter.backend_type().as_str().to_string(),
            limit: state.settings.ratelimit.max_tokens,
            window_seconds: state.settings.ratelimit.window_seconds,
        },
        redis,
    })
}
