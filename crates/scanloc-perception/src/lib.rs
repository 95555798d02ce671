//! `scanloc-perception` – geometry in front of the localizer.
//!
//! # Modules
//!
//! - [`transform`] – [`TfEngine`][transform::TfEngine]: graph of named
//!   reference frames, and [`FrameResolver`][transform::FrameResolver], which
//!   answers "what is the transform between these two frames right now" and
//!   falls back to identity instead of stalling when the graph cannot.
//! - [`preprocess`] – [`Preprocessor`][preprocess::Preprocessor]: planar range
//!   cropping followed by voxel-grid averaging of raw scans.

pub mod preprocess;
pub mod transform;

pub use preprocess::{Preprocessor, PreprocessorConfig, MIN_VOXEL_EDGE_LENGTH};
pub use transform::{FrameResolver, LookupError, Resolved, TfEngine, TransformGraph};
