//! Logging and Trace Export
//!
//! Installs the global `tracing` subscriber: an `EnvFilter`, a console fmt
//! layer, and, when enabled, an OpenTelemetry layer exporting spans over
//! OTLP/gRPC.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: `false`, `0` or `off` disables export (default: enabled)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: Service name for traces (default: quote-stream-gateway)
//! - `RUST_LOG`: Base filter; the gateway's own directives are layered on top
//!
//! ```ignore
//! use quote_stream_gateway::infrastructure::telemetry;
//!
//! let _guard = telemetry::init();
//! tracing::info!(batch_id = 7, events = 12, "Batch processed");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SERVICE_NAME: &str = "quote-stream-gateway";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Our crate at info; transport crates only when they have something to say.
const GATEWAY_DIRECTIVES: &[&str] = &[
    "quote_stream_gateway=info",
    "tower_http=info",
    "tungstenite=warn",
    "tokio_tungstenite=warn",
    "h2=warn",
    "hyper=warn",
];

// =============================================================================
// Configuration
// =============================================================================

/// Trace export settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub enabled: bool,
    /// OTLP collector endpoint.
    pub otlp_endpoint: String,
    /// `service.name` resource attribute.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`. Blank values count as unset.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            enabled: get("OTEL_ENABLED").is_none_or(|v| !is_off(&v)),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otlp_endpoint),
            service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
        }
    }
}

fn is_off(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "off" | "no"
    )
}

// =============================================================================
// Initialisation
// =============================================================================

/// Flushes and shuts the tracer provider down when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are being exported.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shut down tracer provider: {e}");
        }
    }
}

/// Install the subscriber using [`TelemetryConfig::from_env`].
///
/// Keep the guard alive for the life of the process.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// `RUST_LOG` (or `info` when unset) plus the gateway's directives.
#[must_use]
pub fn build_filter() -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    GATEWAY_DIRECTIVES.iter().fold(base, |filter, directive| {
        #[allow(clippy::expect_used)]
        let parsed = directive.parse().expect("static directive is valid");
        filter.add_directive(parsed)
    })
}

/// Install the subscriber with `config`.
///
/// An exporter that cannot be built downgrades to console-only logging.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let tracer_provider = config.enabled.then(|| otlp_provider(&config)).flatten();
    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(build_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if tracer_provider.is_some() {
        tracing::info!(
            endpoint = %config.otlp_endpoint,
            service = %config.service_name,
            "Trace export enabled"
        );
    }

    TelemetryGuard { tracer_provider }
}

fn otlp_provider(config: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| eprintln!("OTLP exporter unavailable, logging to console only: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder()
                    .with_service_name(config.service_name.clone())
                    .build(),
            )
            .build(),
    )
}
