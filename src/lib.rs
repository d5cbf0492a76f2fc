// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules for shorter paths
pub use infrastructure::backoff;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::redis;

// Domain layer (business logic)
pub mod delivery;
pub mod queue;
pub mod ratelimit;
pub mod status;
pub mod worker;

// Application layer
pub mod api;
pub mod messages;
pub mod server;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
