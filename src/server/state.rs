use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::delivery::{create_delivery_client, MessageDeliveryClient};
use crate::error::AppError;
use crate::messages::{MessageService, MessageServiceConfig};
use crate::queue::{create_queue_backend, MessageQueueBackend};
use crate::ratelimit::{create_distributed_rate_limiter, DistributedRateLimiter, RateLimitConfig};
use crate::redis::{CircuitBreaker, RedisPool};
use crate::status::{spawn_status_writer, StatusReporter, StatusStore};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub start_time: Instant,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub rate_limiter: Arc<dyn DistributedRateLimiter>,
    pub queue: Arc<dyn MessageQueueBackend>,
    pub delivery: Arc<dyn MessageDeliveryClient>,
    pub status_store: Arc<StatusStore>,
    pub reporter: StatusReporter,
    pub messages: Arc<MessageService>,
}

impl AppState {
    /// Build every component from settings.
    ///
    /// Settings are validated first. A Redis pool is created only when the
    /// queue or the rate limiter is configured for Redis. Must run inside a Tokio runtime since it spawns
    /// the status writer.
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        settings.validate()?;

        let needs_redis = settings.queue.backend == "redis" || settings.ratelimit.backend == "redis";
        let redis_pool = if needs_redis {
            let pool = RedisPool::new(settings.redis.clone(), Arc::new(CircuitBreaker::new()))
                .map_err(|e| AppError::Internal(format!("Redis pool: {}", e)))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let queue = create_queue_backend(&settings.queue, redis_pool.clone());
        let delivery = create_delivery_client(&settings.delivery, &settings.worker)
            .map_err(|e| AppError::Internal(format!("Delivery client: {}", e)))?;

        Ok(Self::with_components(settings, redis_pool, queue, delivery))
    }

    /// Assemble state around an existing queue and delivery client
    pub fn with_components(
        settings: Settings,
        redis_pool: Option<Arc<RedisPool>>,
        queue: Arc<dyn MessageQueueBackend>,
        delivery: Arc<dyn MessageDeliveryClient>,
    ) -> Self {
        let rate_limiter = create_distributed_rate_limiter(
            &RateLimitConfig::from(&settings.ratelimit),
            redis_pool.clone(),
        );

        let status_store = Arc::new(StatusStore::new(queue.clone()));
        // The writer stops on its own once every reporter clone is dropped.
        let (reporter, _writer) =
            spawn_status_writer(status_store.clone(), settings.status.channel_capacity);

        let messages = Arc::new(MessageService::new(
            rate_limiter.clone(),
            queue.clone(),
            status_store.clone(),
            reporter.clone(),
            MessageServiceConfig::from(&settings),
        ));

        Self {
            settings: Arc::new(settings),
            start_time: Instant::now(),
            redis_pool,
            rate_limiter,
            queue,
            delivery,
            status_store,
            reporter,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_rejects_invalid_settings() {
        let mut settings = Settings::default();
        settings.status.cleanup_interval_seconds = 0;

        let err = AppState::new(settings).err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_new_without_redis_uses_local_components() {
        let state = AppState::new(Settings::default()).unwrap_or_else(|e| panic!("{}", e));
        assert!(state.redis_pool.is_none());
        assert_eq!(state.queue.backend_type(), "memory");
    }
}
