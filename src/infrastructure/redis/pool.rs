//! Redis connection pool for the Redis-backed queue and rate limiter.

use std::future::Future;
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use super::{CircuitBreaker, CircuitState};

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

/// Shared multiplexed connection guarded by a circuit breaker.
///
/// The connection is established lazily and dropped after an I/O error so the
/// next call reconnects.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    config: RedisConfig,
}

impl RedisPool {
    pub fn new(config: RedisConfig, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
            config,
        })
    }

    /// Get the shared connection, connecting on first use.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            return Err(PoolError::CircuitOpen);
        }

        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                tracing::info!(url = %self.config.url, "Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run a command against the shared connection and record the outcome on
    /// the circuit breaker.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    *self.connection.write().await = None;
                }
                self.circuit_breaker.record_failure();
                Err(PoolError::Redis(e))
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn is_healthy(&self) -> bool {
        self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let reply: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            reply
        })
        .await
        .map(|_| ())
    }
}
