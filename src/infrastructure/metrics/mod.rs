//! Prometheus metrics for the dispatch service.
//!
//! - Rate limiting metrics (admitted / denied sends)
//! - Queue metrics (enqueued, acked, requeued, dead-lettered, redriven, gauges)
//! - Delivery metrics (attempt outcomes, latency)
//! - Worker metrics (batches processed, batches in flight)
//! - Status store metrics

mod helpers;

pub use helpers::{encode_metrics, DeliveryMetrics, QueueMetrics, RateLimitMetrics, WorkerMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "dispatch";

lazy_static! {
    // ============================================================================
    // Rate Limiting Metrics
    // ============================================================================

    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Total sends admitted by the rate limiter",
        &["backend"]
    ).unwrap();

    pub static ref RATELIMIT_DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Total sends rejected by the rate limiter",
        &["backend"]
    ).unwrap();

    // ============================================================================
    // Queue Metrics
    // ============================================================================

    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_enqueued_total", METRIC_PREFIX),
        "Total messages enqueued"
    ).unwrap();

    pub static ref QUEUE_ACKED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_acked_total", METRIC_PREFIX),
        "Total messages acknowledged and removed"
    ).unwrap();

    pub static ref QUEUE_REQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_requeued_total", METRIC_PREFIX),
        "Total messages returned to the queue for redelivery"
    ).unwrap();

    pub static ref QUEUE_DEAD_LETTERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_dead_lettered_total", METRIC_PREFIX),
        "Total messages moved to the dead-letter queue"
    ).unwrap();

    pub static ref QUEUE_REDRIVEN_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_redriven_total", METRIC_PREFIX),
        "Total dead-lettered messages redriven to the main queue"
    ).unwrap();

    pub static ref QUEUE_LEASES_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_leases_expired_total", METRIC_PREFIX),
        "Total leases reclaimed after the visibility timeout"
    ).unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        format!("{}_queue_depth", METRIC_PREFIX),
        "Messages waiting to be received"
    ).unwrap();

    pub static ref QUEUE_IN_FLIGHT: IntGauge = register_int_gauge!(
        format!("{}_queue_in_flight", METRIC_PREFIX),
        "Messages currently leased by a worker"
    ).unwrap();

    pub static ref QUEUE_DLQ_SIZE: IntGauge = register_int_gauge!(
        format!("{}_queue_dlq_size", METRIC_PREFIX),
        "Messages in the dead-letter queue"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_attempts_total", METRIC_PREFIX),
        "Delivery attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_delivery_latency_seconds", METRIC_PREFIX),
        "External delivery call latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // ============================================================================
    // Worker Metrics
    // ============================================================================

    pub static ref WORKER_BATCHES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_worker_batches_total", METRIC_PREFIX),
        "Total batches processed by the worker pool"
    ).unwrap();

    pub static ref WORKER_BATCHES_IN_FLIGHT: IntGauge = register_int_gauge!(
        format!("{}_worker_batches_in_flight", METRIC_PREFIX),
        "Batches currently being processed"
    ).unwrap();

    pub static ref WORKER_POLL_ERRORS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_worker_poll_errors_total", METRIC_PREFIX),
        "Queue receive failures observed by the worker pool"
    ).unwrap();

    // ============================================================================
    // Status Store Metrics
    // ============================================================================

    pub static ref STATUS_UPDATES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_status_updates_dropped_total", METRIC_PREFIX),
        "Status updates dropped because the writer channel was full"
    ).unwrap();
}
