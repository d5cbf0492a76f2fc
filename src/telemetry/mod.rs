//! OpenTelemetry telemetry module for distributed tracing.
//!
//! This module provides:
//! - OTLP exporter configuration for sending traces to collectors like Jaeger, Zipkin, or Tempo
//! - Integration with the `tracing` crate for seamless span creation
//! - Configurable sampling for production environments
//! - Optional JSON log output for log shippers
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DISPATCH__OTEL__ENABLED` | Enable OpenTelemetry tracing | `false` |
//! | `DISPATCH__OTEL__ENDPOINT` | OTLP gRPC endpoint | `http://localhost:4317` |
//! | `DISPATCH__OTEL__SERVICE_NAME` | Service name in traces | `message-dispatch-service` |
//! | `DISPATCH__OTEL__SAMPLING_RATIO` | Trace sampling ratio (0.0-1.0) | `1.0` |
//! | `DISPATCH__OTEL__JSON_LOGS` | JSON log lines instead of text | `false` |

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::OtelConfig;

const SERVICE_TRACER_NAME: &str = "message-dispatch-service";

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Telemetry-specific error type
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Telemetry guard that ensures proper shutdown of OpenTelemetry on drop.
pub struct TelemetryGuard {
    _provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self._provider.is_some() {
            // Shutdown is handled automatically by TracerProvider drop
            tracing::info!("Shutting down OpenTelemetry tracer provider");
        }
    }
}

/// Initialize the telemetry system with the given configuration.
///
/// Sets up the tracing subscriber with console output (text or JSON) and,
/// when enabled, an OpenTelemetry layer exporting spans over OTLP.
///
/// The returned guard must be kept alive for the duration of the application.
pub fn init_telemetry(config: &OtelConfig) -> TelemetryResult<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if config.enabled {
        let provider = init_otel_tracer(config)?;
        let tracer = provider.tracer(SERVICE_TRACER_NAME);
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()
            .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

        tracing::info!(
            endpoint = %config.endpoint,
            service_name = %config.service_name,
            sampling_ratio = %config.sampling_ratio,
            "OpenTelemetry tracing initialized"
        );

        Ok(TelemetryGuard {
            _provider: Some(provider),
        })
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

        tracing::info!(json_logs = config.json_logs, "Tracing initialized (OpenTelemetry disabled)");

        Ok(TelemetryGuard { _provider: None })
    }
}

/// Initialize the OpenTelemetry tracer with OTLP exporter.
fn init_otel_tracer(config: &OtelConfig) -> TelemetryResult<SdkTracerProvider> {
    use opentelemetry::KeyValue;

    // Create OTLP exporter
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()
        .map_err(|e| TelemetryError::ExporterBuild(e.to_string()))?;

    // Configure sampler based on sampling ratio
    let sampler = if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    // Build the tracer provider
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                config.service_name.clone(),
            ),
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
        ]))
        .build();

    Ok(provider)
}

/// Attach OpenTelemetry attributes to `span`; a no-op without the OTel layer
pub fn record_attributes<I>(span: &tracing::Span, attributes: I)
where
    I: IntoIterator<Item = opentelemetry::KeyValue>,
{
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    for attribute in attributes {
        span.set_attribute(attribute.key, attribute.value);
    }
}

/// Utility module for creating common span attributes.
pub mod attributes {
    use opentelemetry::KeyValue;

    pub fn user_id(id: &str) -> KeyValue {
        KeyValue::new("user.id", id.to_string())
    }

    pub fn message_id(id: uuid::Uuid) -> KeyValue {
        KeyValue::new("message.id", id.to_string())
    }

    pub fn receive_count(count: u32) -> KeyValue {
        KeyValue::new("message.receive_count", count as i64)
    }

    pub fn batch_size(size: usize) -> KeyValue {
        KeyValue::new("dispatch.batch_size", size as i64)
    }

    pub fn delivery_outcome(outcome: &str) -> KeyValue {
        KeyValue::new("dispatch.outcome", outcome.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OtelConfig::default();
        assert!(!config.enabled);
        assert!(!config.json_logs);
        assert_eq!(config.endpoint, "http://localhost:4317");
        assert_eq!(config.service_name, "message-dispatch-service");
        assert_eq!(config.sampling_ratio, 1.0);
    }

    #[test]
    fn test_attributes() {
        assert_eq!(attributes::user_id("creator-1").key.as_str(), "user.id");
        assert_eq!(attributes::message_id(uuid::Uuid::nil()).key.as_str(), "message.id");
        assert_eq!(attributes::receive_count(2).key.as_str(), "message.receive_count");
    }

    #[test]
    fn test_record_attributes_without_otel_layer() {
        let span = tracing::info_span!("dispatch_message");
        record_attributes(&span, [attributes::delivery_outcome("delivered")]);
    }

    #[test]
    fn test_telemetry_guard_creation() {
        let guard = TelemetryGuard { _provider: None };
        drop(guard);
    }
}
