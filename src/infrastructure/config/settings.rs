use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

/// Upper bound for a single queue receive, matching the dispatch batch size.
pub const MAX_RECEIVE_BATCH: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub ratelimit: RateLimitSettings,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Shared secret expected in `X-API-Key`; unset disables the check
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

/// Rate limiter settings as loaded from configuration sources.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Messages admitted per user per window
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Backend type: "local" or "redis"
    #[serde(default = "default_local")]
    pub backend: String,
    #[serde(default = "default_ratelimit_prefix")]
    pub redis_prefix: String,
    #[serde(default = "default_ratelimit_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_bucket_ttl")]
    pub bucket_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Backend type: "memory" or "redis"
    #[serde(default = "default_memory")]
    pub backend: String,
    /// Lease length granted to a worker on receive
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    /// Deliveries allowed before a message is dead-lettered
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Long-poll wait when the queue is empty
    #[serde(default = "default_receive_wait")]
    pub receive_wait_seconds: u64,
    #[serde(default = "default_queue_prefix")]
    pub redis_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches allowed in flight at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Rough processing time per batch, used for delivery estimates
    #[serde(default = "default_estimated_batch_seconds")]
    pub estimated_batch_seconds: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Backend type: "http" or "log"
    #[serde(default = "default_log")]
    pub backend: String,
    #[serde(default = "default_delivery_url")]
    pub base_url: String,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    #[serde(default = "default_max_send_batch")]
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_capacity")]
    pub channel_capacity: usize,
    /// How long terminal message records are kept
    #[serde(default = "default_status_retention")]
    pub retention_seconds: u64,
    #[serde(default = "default_status_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Emit logs as JSON lines instead of the human-readable format
    #[serde(default)]
    pub json_logs: bool,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_max_tokens() -> u32 {
    10
}

fn default_window_seconds() -> u64 {
    60
}

fn default_local() -> String {
    "local".to_string()
}

fn default_memory() -> String {
    "memory".to_string()
}

fn default_log() -> String {
    "log".to_string()
}

fn default_ratelimit_prefix() -> String {
    "dispatch:ratelimit".to_string()
}

fn default_queue_prefix() -> String {
    "dispatch:queue".to_string()
}

fn default_ratelimit_cleanup_interval() -> u64 {
    60
}

fn default_bucket_ttl() -> u64 {
    300 // 5 minutes
}

fn default_visibility_timeout() -> u64 {
    90
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_receive_wait() -> u64 {
    10
}

fn default_batch_size() -> usize {
    MAX_RECEIVE_BATCH
}

fn default_max_concurrency() -> usize {
    2
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_retry_base_delay() -> u64 {
    1_000
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_estimated_batch_seconds() -> u64 {
    5
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_delivery_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_max_content_length() -> usize {
    5000
}

fn default_max_send_batch() -> usize {
    10
}

fn default_status_capacity() -> usize {
    10_000
}

fn default_status_retention() -> u64 {
    3600 // 1 hour
}

fn default_status_cleanup_interval() -> u64 {
    300
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "message-dispatch-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("redis.url", "redis://localhost:6379")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // DISPATCH__QUEUE__BACKEND, DISPATCH__WORKER__MAX_CONCURRENCY, ...
            .add_source(
                Environment::with_prefix("DISPATCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations the dispatcher cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.batch_size == 0 || self.worker.batch_size > MAX_RECEIVE_BATCH {
            return Err(ConfigError::Message(format!(
                "worker.batch_size must be between 1 and {}",
                MAX_RECEIVE_BATCH
            )));
        }
        if self.worker.max_concurrency == 0 {
            return Err(ConfigError::Message(
                "worker.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.queue.max_receive_count == 0 {
            return Err(ConfigError::Message(
                "queue.max_receive_count must be at least 1".to_string(),
            ));
        }
        if self.ratelimit.max_tokens == 0 || self.ratelimit.window_seconds == 0 {
            return Err(ConfigError::Message(
                "ratelimit.max_tokens and ratelimit.window_seconds must be positive".to_string(),
            ));
        }
        // Each of these feeds a timer or lease that must not be zero
        let durations = [
            ("queue.visibility_timeout_seconds", self.queue.visibility_timeout_seconds),
            ("worker.delivery_timeout_seconds", self.worker.delivery_timeout_seconds),
            ("ratelimit.cleanup_interval_seconds", self.ratelimit.cleanup_interval_seconds),
            ("status.cleanup_interval_seconds", self.status.cleanup_interval_seconds),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, seconds)| *seconds == 0) {
            return Err(ConfigError::Message(format!("{} must be at least 1", name)));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            redis: RedisConfig::default(),
            ratelimit: RateLimitSettings::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            delivery: DeliveryConfig::default(),
            messages: MessagesConfig::default(),
            status: StatusConfig::default(),
            otel: OtelConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: default_max_tokens(),
            window_seconds: default_window_seconds(),
            backend: default_local(),
            redis_prefix: default_ratelimit_prefix(),
            cleanup_interval_seconds: default_ratelimit_cleanup_interval(),
            bucket_ttl_seconds: default_bucket_ttl(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_memory(),
            visibility_timeout_seconds: default_visibility_timeout(),
            max_receive_count: default_max_receive_count(),
            receive_wait_seconds: default_receive_wait(),
            redis_prefix: default_queue_prefix(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            delivery_timeout_seconds: default_delivery_timeout(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            estimated_batch_seconds: default_estimated_batch_seconds(),
            drain_timeout_seconds: default_drain_timeout(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backend: default_log(),
            base_url: default_delivery_url(),
            api_token: None,
        }
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            max_content_length: default_max_content_length(),
            max_batch_size: default_max_send_batch(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_status_capacity(),
            retention_seconds: default_status_retention(),
            cleanup_interval_seconds: default_status_cleanup_interval(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8081);
        assert_eq!(settings.ratelimit.max_tokens, 10);
        assert_eq!(settings.ratelimit.window_seconds, 60);
        assert_eq!(settings.queue.visibility_timeout_seconds, 90);
        assert_eq!(settings.queue.max_receive_count, 3);
        assert_eq!(settings.worker.batch_size, 5);
        assert_eq!(settings.worker.max_concurrency, 2);
        assert_eq!(settings.messages.max_content_length, 5000);
        assert_eq!(settings.messages.max_batch_size, 10);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_batch() {
        let mut settings = Settings::default();
        settings.worker.batch_size = 6;
        assert!(settings.validate().is_err());

        settings.worker.batch_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings.worker.max_concurrency = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_receive_count() {
        let mut settings = Settings::default();
        settings.queue.max_receive_count = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let cases: [fn(&mut Settings); 4] = [
            |s| s.queue.visibility_timeout_seconds = 0,
            |s| s.worker.delivery_timeout_seconds = 0,
            |s| s.ratelimit.cleanup_interval_seconds = 0,
            |s| s.status.cleanup_interval_seconds = 0,
        ];
        for zero_out in cases {
            let mut settings = Settings::default();
            zero_out(&mut settings);
            assert!(settings.validate().is_err());
        }
    }

    #[test]
    fn test_validate_names_zero_status_cleanup_interval() {
        let mut settings = Settings::default();
        settings.status.cleanup_interval_seconds = 0;
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("status.cleanup_interval_seconds"));
    }

    #[test]
    fn test_server_addr() {
        let settings = Settings::default();
        assert_eq!(settings.server_addr(), "0.0.0.0:8081");
    }
}
