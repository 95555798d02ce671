//! `scanloc-localizer` – map-based pose tracking.
//!
//! # Modules
//!
//! - [`registration`] – the [`RegistrationEngine`] contract and the
//!   convergence predicate.
//! - [`map_store`] – [`MapStore`], the lock-guarded active target, and
//!   [`MapLoader`], which builds targets off the scan path.
//! - [`motion`] – [`MotionPredictor`], the constant-velocity initial guess.
//! - [`localizer`] – [`Localizer`], one registration cycle per scan.
//! - [`health`] – [`HealthBoard`], the shared [`HealthSnapshot`][scanloc_types::HealthSnapshot].
//! - [`diagnostics`] – [`DiagnosticsReporter`], fixed-rate status reports.

pub mod diagnostics;
pub mod health;
pub mod localizer;
pub mod map_store;
pub mod motion;
pub mod registration;

pub use diagnostics::{DiagnosticsConfig, DiagnosticsReporter};
pub use health::{HealthBoard, HealthReader};
pub use localizer::{CycleOutcome, CycleReport, Localizer, LocalizerConfig, SkipReason};
pub use map_store::{MapLoader, MapStore, TargetGuard};
pub use motion::MotionPredictor;
pub use registration::{
    is_converged, RegistrationEngine, RegistrationError, RegistrationParams, RegistrationResult, RegistrationTarget,
    ITERATION_SLACK,
};
