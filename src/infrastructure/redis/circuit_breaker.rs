//! Circuit breaker guarding Redis-backed queue and rate limit operations

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successful trial calls needed to close a half-open circuit
    pub success_threshold: u32,
    /// Time an open circuit waits before allowing trial calls (ms)
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Lock-free circuit breaker.
///
/// While open, callers fail fast with `PoolError::CircuitOpen` instead of
/// waiting on a dead Redis, which the worker pool turns into backoff and the
/// send endpoint into a 500.
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    trial_successes: AtomicU32,
    changed_at_ms: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            trial_successes: AtomicU32::new(0),
            changed_at_ms: AtomicI64::new(current_time_ms()),
            config,
        }
    }

    /// Current state, promoting Open to HalfOpen once the reset timeout elapsed
    pub fn state(&self) -> CircuitState {
        let raw = self.state.load(Ordering::Acquire);
        if CircuitState::from_raw(raw) == CircuitState::Open {
            let elapsed = current_time_ms() - self.changed_at_ms.load(Ordering::Acquire);
            if elapsed >= self.config.reset_timeout_ms as i64
                && self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.trial_successes.store(0, Ordering::Release);
                self.changed_at_ms.store(current_time_ms(), Ordering::Release);
                tracing::info!("Redis circuit breaker half-open, allowing trial requests");
            }
        }
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        match CircuitState::from_raw(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => self.consecutive_failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.trial_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.set_state(CircuitState::Closed);
                    tracing::info!("Redis circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match CircuitState::from_raw(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.set_state(CircuitState::Open);
                    tracing::warn!(failures = failures, "Redis circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                self.set_state(CircuitState::Open);
                tracing::warn!("Redis circuit breaker reopened by failed trial request");
            }
            CircuitState::Open => {
                self.changed_at_ms.store(current_time_ms(), Ordering::Release);
            }
        }
    }

    fn set_state(&self, next: CircuitState) {
        self.state.store(next as u8, Ordering::Release);
        self.changed_at_ms.store(current_time_ms(), Ordering::Release);
        self.trial_successes.store(0, Ordering::Release);
        if next == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::Release);
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
