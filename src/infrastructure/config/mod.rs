mod settings;

pub use settings::{
    ApiConfig, DeliveryConfig, MessagesConfig, OtelConfig, QueueConfig, RateLimitSettings,
    RedisConfig, ServerConfig, Settings, StatusConfig, WorkerConfig, MAX_RECEIVE_BATCH,
};
