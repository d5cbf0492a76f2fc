//! Queue backend factory

use std::sync::Arc;

use crate::config::QueueConfig as SettingsQueueConfig;
use crate::redis::RedisPool;

use super::backend::MessageQueueBackend;
use super::memory_backend::MemoryQueueBackend;
use super::models::QueueConfig;
use super::redis_backend::RedisQueueBackend;

/// Create a queue backend based on configuration.
///
/// - `"redis"`: `RedisQueueBackend` when a Redis pool is provided
/// - `"memory"` (default): `MemoryQueueBackend`
pub fn create_queue_backend(
    settings: &SettingsQueueConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn MessageQueueBackend> {
    let config = QueueConfig::from(settings);

    match settings.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    prefix = %settings.redis_prefix,
                    visibility_timeout_secs = config.visibility_timeout.as_secs(),
                    max_receive_count = config.max_receive_count,
                    "Creating Redis queue backend"
                );
                Arc::new(RedisQueueBackend::new(config, pool, settings.redis_prefix.clone()))
            } else {
                tracing::warn!("Redis backend requested but no pool provided, falling back to memory");
                Arc::new(MemoryQueueBackend::new(config))
            }
        }
        other => {
            if other != "memory" {
                tracing::warn!(backend = %other, "Unknown queue backend, using memory");
            }
            tracing::info!(
                backend = "memory",
                visibility_timeout_secs = config.visibility_timeout.as_secs(),
                max_receive_count = config.max_receive_count,
                "Creating in-memory queue backend"
            );
            Arc::new(MemoryQueueBackend::new(config))
        }
    }
}
