//! Logging and OpenTelemetry export
//!
//! Logs go to stdout as JSON lines (or human-readable text for local runs).
//! The server usually runs next to a local Grafana, so spans and metrics
//! are exported over OTLP/gRPC only when an endpoint is configured.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,sheets=debug,kube=info,tower=warn,hyper=warn";

/// Environment variable naming the OTLP collector
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Telemetry setup failure
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Span exporter could not be built
    #[error("failed to build OTLP span exporter: {0}")]
    SpanExporter(String),

    /// Metric exporter could not be built
    #[error("failed to build OTLP metric exporter: {0}")]
    MetricExporter(String),

    /// A global subscriber is already installed
    #[error("tracing subscriber already installed: {0}")]
    Subscriber(String),
}

/// What to initialise
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` of exported spans and metrics
    pub service_name: String,

    /// OTLP collector, e.g. `http://localhost:4317`; `None` keeps telemetry local
    pub otlp_endpoint: Option<String>,

    /// Human-readable logs instead of JSON
    pub pretty: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sheets-apiserver".to_string(),
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|endpoint| !endpoint.trim().is_empty()),
            pretty: false,
        }
    }
}

/// Install the global subscriber, propagator and, when configured, the
/// OTLP trace and metric pipelines
///
/// Fails if a global subscriber already exists.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = resource(&config.service_name);
            global::set_meter_provider(meter_provider(endpoint, resource.clone())?);
            let provider = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let fmt = tracing_subscriber::fmt::layer().with_target(true);
    let (json, text) = if config.pretty {
        (None, Some(fmt))
    } else {
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_file(false)
            .with_line_number(false);
        (Some(json), None)
    };

    tracing_subscriber::registry()
        .with(log_filter())
        .with(json)
        .with(text)
        .with(otel)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// `RUST_LOG` when it parses, otherwise [`DEFAULT_LOG_FILTER`]
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn resource(service_name: &str) -> Resource {
    Resource::new([
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ])
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::SpanExporter(e.to_string()))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricExporter(e.to_string()))?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}
