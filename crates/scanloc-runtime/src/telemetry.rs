//! Logging and span export for the localizer process.
//!
//! Call [`init_tracing`] once at startup.  Every crate in the workspace logs
//! through `tracing`; this module decides where it goes.
//!
//! `RUST_LOG` filters events (default `info`).  Setting
//! `OTEL_EXPORTER_OTLP_ENDPOINT` (e.g. `http://localhost:4318`) also ships
//! `scan_cycle` spans to that collector over OTLP/HTTP.
//!
//! The output format comes from [`TelemetryConfig::log_format`]
//! (overridable with `SCANLOC_LOG_FORMAT`, see [`crate::config`]).
//!
//! ```rust,no_run
//! use scanloc_runtime::telemetry::{init_tracing, TelemetryConfig};
//!
//! let _telemetry = init_tracing(&TelemetryConfig::default());
//! ```

use std::str::FromStr;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Console log layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `service.name` attached to exported spans.
    pub service_name: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "scanloc".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

/// Install the process-wide subscriber.
///
/// Layers: `RUST_LOG` filter (default `info`), OTLP span export when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set, then console output in
/// `config.log_format`.  Only the first call installs anything.
///
/// Keep the returned guard alive until exit; dropping it flushes spans.
pub fn init_tracing(config: &TelemetryConfig) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = build_provider(&config.service_name);

    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("scanloc")));
    let (json, compact) = match config.log_format {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Compact => (None, Some(fmt::layer().compact())),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(otel)
        .with(json)
        .with(compact)
        .try_init();
    if let Err(e) = installed {
        eprintln!("[scanloc] keeping existing tracing subscriber: {e}");
    }

    TracerProviderGuard(provider)
}

/// Owns the span exporter; shutting it down on drop flushes queued spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// Whether spans are being exported over OTLP.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        let Some(provider) = self.0.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("[scanloc] span exporter shutdown failed: {e}");
        }
    }
}

/// `None` without an endpoint, or when the exporter fails to build.
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[scanloc] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // No batch worker: init can run before the Tokio runtime.
            .with_simple_exporter(exporter)
            .build(),
    )
}
