use opentelemetry_sdk::{
    logs::LoggerProvider, metrics::SdkMeterProvider,
    trace::TracerProvider as SdkTracerProvider,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Logging and OTLP export settings for one service
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Reported as the `service.name` resource attribute
    pub service_name: String,
    /// OTLP gRPC collector endpoint, used only when `otel_enabled`
    pub otel_endpoint: String,
    pub otel_enabled: bool,
    /// Default filter directive; `RUST_LOG` overrides it
    pub log_level: String,
    /// How often counters are pushed to the collector
    pub metrics_export_interval: Duration,
}

impl TelemetryConfig {
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "telemetry-bridge".to_string(),
            otel_endpoint: "http://localhost:4317".to_string(),
            otel_enabled: false,
            log_level: "info".to_string(),
            metrics_export_interval: Duration::from_secs(30),
        }
    }
}

/// Exporter pipelines that must be flushed on shutdown
pub struct TelemetryProviders {
    pub tracer_provider: SdkTracerProvider,
    pub logger_provider: LoggerProvider,
    pub meter_provider: SdkMeterProvider,
}
