//! Node configuration – `scanloc.toml` plus `SCANLOC_*` overrides.
//!
//! Every section and field is optional; anything left out takes its default.
//!
//! ```toml
//! bus_capacity = 256
//! scan_queue_depth = 8
//!
//! [localizer]
//! body_frame = "base_link"
//! convergence_fit_threshold = 3.0
//!
//! [registration]
//! max_iterations = 30
//!
//! [preprocess]
//! voxel_edge_length = 2.0
//!
//! [diagnostics]
//! rate_hz = 100.0
//!
//! [telemetry]
//! log_format = "json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use scanloc_localizer::{DiagnosticsConfig, LocalizerConfig, RegistrationParams};
use scanloc_perception::PreprocessorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::telemetry::{LogFormat, TelemetryConfig};

/// File read when `SCANLOC_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "scanloc.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Buffered events per bus topic before slow subscribers lag.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Scans (and pose resets) waiting for the scan worker.
    #[serde(default = "default_scan_queue_depth")]
    pub scan_queue_depth: usize,

    #[serde(default)]
    pub localizer: LocalizerConfig,

    #[serde(default)]
    pub registration: RegistrationParams,

    #[serde(default)]
    pub preprocess: PreprocessorConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_bus_capacity() -> usize {
    256
}
fn default_scan_queue_depth() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
            scan_queue_depth: default_scan_queue_depth(),
            localizer: LocalizerConfig::default(),
            registration: RegistrationParams::default(),
            preprocess: PreprocessorConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// `SCANLOC_CONFIG`, or `scanloc.toml` in the working directory.
pub fn config_path() -> PathBuf {
    std::env::var_os("SCANLOC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load the config from [`config_path`].  Returns `None` if the file does
/// not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

/// Load the config from `path` and apply environment overrides.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg = parse(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Parse TOML text; no environment overrides.
pub fn parse(raw: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(raw)?)
}

/// Apply `SCANLOC_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SCANLOC_BODY_FRAME` | `localizer.body_frame` |
/// | `SCANLOC_FIT_THRESHOLD` | `localizer.convergence_fit_threshold` |
/// | `SCANLOC_MAX_ITERATIONS` | `registration.max_iterations` |
/// | `SCANLOC_VOXEL_EDGE` | `preprocess.voxel_edge_length` |
/// | `SCANLOC_LOG_FORMAT` | `telemetry.log_format` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_with(cfg, |key| std::env::var(key).ok());
}

/// [`apply_env_overrides`] with an explicit variable source.
pub fn apply_overrides_with<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("SCANLOC_BODY_FRAME") {
        cfg.localizer.body_frame = v;
    }
    if let Some(v) = lookup("SCANLOC_FIT_THRESHOLD") {
        match v.parse::<f64>() {
            Ok(threshold) if threshold.is_finite() => cfg.localizer.convergence_fit_threshold = threshold,
            _ => warn!(value = %v, "ignoring invalid SCANLOC_FIT_THRESHOLD"),
        }
    }
    if let Some(v) = lookup("SCANLOC_MAX_ITERATIONS") {
        match v.parse::<u32>() {
            Ok(max) => cfg.registration.max_iterations = max,
            Err(_) => warn!(value = %v, "ignoring invalid SCANLOC_MAX_ITERATIONS"),
        }
    }
    if let Some(v) = lookup("SCANLOC_VOXEL_EDGE") {
        match v.parse::<f32>() {
            Ok(edge) if edge.is_finite() => cfg.preprocess.voxel_edge_length = edge,
            _ => warn!(value = %v, "ignoring invalid SCANLOC_VOXEL_EDGE"),
        }
    }
    if let Some(v) = lookup("SCANLOC_LOG_FORMAT") {
        match v.parse::<LogFormat>() {
            Ok(format) => cfg.telemetry.log_format = format,
            Err(e) => warn!(error = %e, "ignoring invalid SCANLOC_LOG_FORMAT"),
        }
    }
}

/// Write `cfg` to `path`, creating parent directories.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
