//! `scanloc-types` – shared vocabulary of the scan-matching localizer.
//!
//! Every crate in the workspace speaks in these types: rigid transforms,
//! point clouds and stamped scans flow in, stamped poses, metrics and
//! diagnostic reports flow out through the [`Event`] envelope.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nalgebra::{Isometry3, Point3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Rigid 3-D transform (rotation + translation).
///
/// Used both for poses (relative to the map frame) and for frame-to-frame
/// calibration transforms.
pub type Transform = Isometry3<f32>;

// ────────────────────────────────────────────────────────────────────────────
// Point clouds
// ────────────────────────────────────────────────────────────────────────────

/// An unordered list of 3-D points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Point3<f32>>,
}

impl PointCloud {
    /// Create an empty cloud.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing point list.
    pub fn from_points(points: Vec<Point3<f32>>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: Point3<f32>) {
        self.points.push(point);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point3<f32>> {
        self.points.iter()
    }

    /// Apply `transform` to every point, returning a new cloud.
    pub fn transformed(&self, transform: &Transform) -> Self {
        self.points
            .iter()
            .map(|p| transform.transform_point(p))
            .collect()
    }
}

impl FromIterator<Point3<f32>> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point3<f32>>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// A timestamped point cloud together with the name of the frame it was
/// captured in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFrame {
    /// Sensor-assigned sequence number.
    pub seq: u64,
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub cloud: PointCloud,
}

impl ScanFrame {
    pub fn new(seq: u64, stamp: DateTime<Utc>, frame_id: impl Into<String>, cloud: PointCloud) -> Self {
        Self {
            seq,
            stamp,
            frame_id: frame_id.into(),
            cloud,
        }
    }

    /// Same header, different points.
    pub fn with_cloud(&self, cloud: PointCloud) -> Self {
        Self {
            seq: self.seq,
            stamp: self.stamp,
            frame_id: self.frame_id.clone(),
            cloud,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stamped messages
// ────────────────────────────────────────────────────────────────────────────

/// A pose expressed in a named frame at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseStamped {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub pose: Transform,
}

/// A transform between two named frames, as broadcast to the transform graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStamped {
    pub stamp: DateTime<Utc>,
    pub parent_frame: String,
    pub child_frame: String,
    pub transform: Transform,
}

/// Per-cycle alignment figures, published whether or not the cycle converged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentMetrics {
    pub seq: u64,
    pub stamp: DateTime<Utc>,
    /// Wall-clock time spent inside the registration engine.
    pub align_time_ms: f64,
    /// Wall-clock time of the whole cycle.
    pub exe_time_ms: f64,
    pub fit_score: f64,
    pub iterations: u32,
    pub converged: bool,
    pub consecutive_rejections: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Lifecycle & health
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of the localizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LocalizerState {
    /// No map loaded yet.
    #[default]
    Idle,
    /// Map loaded, no registration accepted yet.
    Initializing,
    /// Steady state.
    Tracking,
    /// Tracking, but too many consecutive registrations were rejected.
    Degraded,
}

impl LocalizerState {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalizerState::Idle => "Idle",
            LocalizerState::Initializing => "Initializing",
            LocalizerState::Tracking => "Tracking",
            LocalizerState::Degraded => "Degraded",
        }
    }
}

impl fmt::Display for LocalizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed health state shared between the scan-processing path and the
/// diagnostics reporter.
///
/// Cheap to copy; readers always receive a consistent value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: LocalizerState,
    /// Sequence number of the most recently processed scan.
    pub seq: u64,
    pub last_fit_score: Option<f64>,
    pub last_iterations: Option<u32>,
    pub consecutive_rejections: u32,
    /// Scans dropped before registration (no map, unresolved frame).
    pub skipped_scans: u64,
    pub accepted_poses: u64,
    /// Frame lookups that fell back to identity.
    pub frame_fallbacks: u64,
    pub last_align_ms: Option<f64>,
    pub last_cycle_ms: Option<f64>,
}

impl HealthSnapshot {
    /// Flatten the snapshot into the key/value list carried by a
    /// [`DiagnosticReport`].  Fields that have never been set are omitted.
    pub fn key_values(&self) -> Vec<KeyValue> {
        let mut values = vec![
            KeyValue::new("state", self.state.as_str()),
            KeyValue::new("seq", self.seq.to_string()),
        ];
        if let Some(score) = self.last_fit_score {
            values.push(KeyValue::new("transform_probability", format!("{score:.6}")));
        }
        if let Some(iterations) = self.last_iterations {
            values.push(KeyValue::new("iteration_num", iterations.to_string()));
        }
        values.push(KeyValue::new(
            "skipping_publish_num",
            self.consecutive_rejections.to_string(),
        ));
        values.push(KeyValue::new("skipped_scans", self.skipped_scans.to_string()));
        values.push(KeyValue::new("accepted_poses", self.accepted_poses.to_string()));
        values.push(KeyValue::new("frame_fallbacks", self.frame_fallbacks.to_string()));
        if let Some(ms) = self.last_align_ms {
            values.push(KeyValue::new("align_time_ms", format!("{ms:.3}")));
        }
        if let Some(ms) = self.last_cycle_ms {
            values.push(KeyValue::new("exe_time_ms", format!("{ms:.3}")));
        }
        values
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ────────────────────────────────────────────────────────────────────────────

/// Three-level status attached to every [`DiagnosticReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Structured status report emitted on a fixed cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub stamp: DateTime<Utc>,
    pub name: String,
    pub hardware_id: String,
    pub level: DiagnosticLevel,
    pub message: String,
    pub values: Vec<KeyValue>,
}

impl DiagnosticReport {
    /// Look up a value by key.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified envelope for everything published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"scanloc::localizer"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a fresh envelope stamped with the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Outputs produced by the localizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Accepted pose in the map frame.
    Pose(PoseStamped),
    /// Map → body transform, broadcast alongside an accepted pose.
    Transform(TransformStamped),
    /// The scan re-expressed in the map frame.
    AlignedPoints(Arc<ScanFrame>),
    Metrics(AlignmentMetrics),
    Diagnostics(DiagnosticReport),
}

/// Errors that cross crate boundaries.
#[derive(Error, Debug)]
pub enum LocError {
    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Map Build Failed: {0}")]
    MapBuild(String),

    #[error("Localizer input queue closed")]
    InputClosed,

    #[error("Worker Task Failed: {0}")]
    Task(String),
}
