//! `scanloc-runtime` – process-level wiring for the localizer.
//!
//! # Modules
//!
//! - [`config`] – `scanloc.toml` loading with `SCANLOC_*` overrides.
//! - [`telemetry`] – `tracing` subscriber setup with optional OTLP export.
//! - [`node`] – [`LocalizerNode`]: scan worker, map loading and diagnostics
//!   under one lifecycle.

pub mod config;
pub mod node;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use node::{LocalizerInput, LocalizerNode};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TracerProviderGuard};
