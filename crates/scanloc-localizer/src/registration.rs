//! Contract between the localizer and the scan-registration primitive.
//!
//! The optimizer itself lives behind [`RegistrationEngine`]: the localizer
//! asks it to index a map once ([`RegistrationEngine::build_target`]) and
//! then to align every scan against that index
//! ([`RegistrationEngine::align`]).  Whether a returned alignment is trusted
//! is decided here, by [`is_converged`], not by the engine.
//!
//! # Example
//!
//! ```rust
//! use scanloc_localizer::registration::{is_converged, RegistrationResult};
//! use scanloc_types::Transform;
//!
//! let result = RegistrationResult {
//!     pose: Transform::identity(),
//!     fit_score: 4.2,
//!     iterations: 31,
//! };
//! // max_iterations = 30 still accepts 31 iterations.
//! assert!(is_converged(&result, 30, 3.0));
//! ```

use scanloc_types::{PointCloud, Transform};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Iterations an engine may run past its configured maximum before the
/// result is rejected.
pub const ITERATION_SLACK: u32 = 2;

// ────────────────────────────────────────────────────────────────────────────
// Parameters / results
// ────────────────────────────────────────────────────────────────────────────

/// Parameters a target is built with.  They travel with the target so the
/// convergence check always uses the values the active map was built from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    /// Minimum transform change between iterations before the optimizer stops.
    pub transformation_epsilon: f64,
    /// Maximum step length of a line-search iteration.
    pub step_size: f64,
    /// Voxel resolution of the distribution grid built over the map.
    pub resolution: f32,
    pub max_iterations: u32,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            transformation_epsilon: 0.01,
            step_size: 0.1,
            resolution: 2.0,
            max_iterations: 30,
        }
    }
}

/// Outcome of one alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationResult {
    /// Body pose in the map frame.
    pub pose: Transform,
    /// Transform probability; higher is a better fit.
    pub fit_score: f64,
    pub iterations: u32,
}

impl RegistrationResult {
    /// A result that no threshold accepts: the guess is returned untouched.
    pub fn zero_confidence(guess: Transform) -> Self {
        Self {
            pose: guess,
            fit_score: 0.0,
            iterations: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Target Build Failed: {0}")]
    Build(String),

    #[error("Alignment Failed: {0}")]
    Alignment(String),

    #[error("Source cloud is empty")]
    EmptySource,
}

// ────────────────────────────────────────────────────────────────────────────
// Traits
// ────────────────────────────────────────────────────────────────────────────

/// Precomputed, immutable index over a map.
pub trait RegistrationTarget: Send + 'static {
    fn params(&self) -> &RegistrationParams;
}

/// Scan-to-map alignment primitive.
pub trait RegistrationEngine: Send + Sync + 'static {
    type Target: RegistrationTarget;

    /// Index `map` for repeated alignment.  May be slow; never called while
    /// the active target is locked.
    fn build_target(&self, map: &PointCloud, params: &RegistrationParams) -> Result<Self::Target, RegistrationError>;

    /// Align `source` (body frame) against `target`, starting at
    /// `initial_guess`.
    fn align(
        &self,
        source: &PointCloud,
        initial_guess: &Transform,
        target: &Self::Target,
    ) -> Result<RegistrationResult, RegistrationError>;
}

/// A result is trusted unless the engine ran `max_iterations +`
/// [`ITERATION_SLACK`] iterations or more, or its fit score is below
/// `fit_threshold`.
pub fn is_converged(result: &RegistrationResult, max_iterations: u32, fit_threshold: f64) -> bool {
    let iteration_limit = max_iterations.saturating_add(ITERATION_SLACK);
    result.iterations < iteration_limit && result.fit_score >= fit_threshold
}
