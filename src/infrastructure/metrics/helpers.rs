//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    DELIVERY_ATTEMPTS_TOTAL, DELIVERY_LATENCY, QUEUE_ACKED_TOTAL, QUEUE_DEAD_LETTERED_TOTAL,
    QUEUE_DEPTH, QUEUE_DLQ_SIZE, QUEUE_ENQUEUED_TOTAL, QUEUE_IN_FLIGHT,
    QUEUE_LEASES_EXPIRED_TOTAL, QUEUE_REDRIVEN_TOTAL, QUEUE_REQUEUED_TOTAL,
    RATELIMIT_ALLOWED_TOTAL, RATELIMIT_DENIED_TOTAL, WORKER_BATCHES_IN_FLIGHT,
    WORKER_BATCHES_TOTAL, WORKER_POLL_ERRORS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording rate limit metrics
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record_allowed(backend: &str) {
        RATELIMIT_ALLOWED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_denied(backend: &str) {
        RATELIMIT_DENIED_TOTAL.with_label_values(&[backend]).inc();
    }
}

/// Helper struct for recording queue metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued() {
        QUEUE_ENQUEUED_TOTAL.inc();
    }

    pub fn record_acked() {
        QUEUE_ACKED_TOTAL.inc();
    }

    pub fn record_requeued() {
        QUEUE_REQUEUED_TOTAL.inc();
    }

    pub fn record_dead_lettered() {
        QUEUE_DEAD_LETTERED_TOTAL.inc();
    }

    pub fn record_redriven(count: u64) {
        QUEUE_REDRIVEN_TOTAL.inc_by(count);
    }

    pub fn record_leases_expired(count: u64) {
        QUEUE_LEASES_EXPIRED_TOTAL.inc_by(count);
    }

    /// Record a lease reclamation performed inside Redis
    pub fn record_reclaimed(requeued: u64, dead_lettered: u64) {
        QUEUE_REQUEUED_TOTAL.inc_by(requeued);
        QUEUE_DEAD_LETTERED_TOTAL.inc_by(dead_lettered);
    }

    /// Refresh the queue gauges from a stats snapshot
    pub fn set_sizes(depth: usize, in_flight: usize, dlq: usize) {
        QUEUE_DEPTH.set(depth as i64);
        QUEUE_IN_FLIGHT.set(in_flight as i64);
        QUEUE_DLQ_SIZE.set(dlq as i64);
    }
}

/// Helper struct for recording delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_delivered(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["delivered"]).inc();
        DELIVERY_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_transient_failure(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["transient"]).inc();
        DELIVERY_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_permanent_failure(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["permanent"]).inc();
        DELIVERY_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_timeout() {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["timeout"]).inc();
    }
}

/// Helper struct for recording worker metrics
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn batch_started() {
        WORKER_BATCHES_IN_FLIGHT.inc();
    }

    pub fn batch_finished() {
        WORKER_BATCHES_IN_FLIGHT.dec();
        WORKER_BATCHES_TOTAL.inc();
    }

    pub fn record_poll_error() {
        WORKER_POLL_ERRORS_TOTAL.inc();
    }
}
