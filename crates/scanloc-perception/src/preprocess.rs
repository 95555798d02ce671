//! Scan preprocessing: planar range cropping and voxel-grid averaging.
//!
//! Registration cost grows with the number of source points, so raw scans
//! are thinned before they reach the localizer:
//!
//! 1. **Range filter** – keep points whose planar distance
//!    `sqrt(x² + y²)` lies in `[min_range, max_range]` (both inclusive).
//! 2. **Voxel grid** – bucket the survivors into cubes of
//!    `voxel_edge_length` and replace each occupied cube by the centroid of
//!    its points.
//!
//! Degenerate settings are not errors: `min_range >= max_range` disables the
//! range filter, and an edge length below [`MIN_VOXEL_EDGE_LENGTH`] disables
//! the voxel grid.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use nalgebra::Point3;
//! use scanloc_perception::preprocess::{Preprocessor, PreprocessorConfig};
//! use scanloc_types::{PointCloud, ScanFrame};
//!
//! let pre = Preprocessor::new(PreprocessorConfig {
//!     min_range: 0.0,
//!     max_range: 10.0,
//!     voxel_edge_length: 1.0,
//! });
//!
//! let raw = ScanFrame::new(1, Utc::now(), "velodyne", PointCloud::from_points(vec![
//!     Point3::new(0.2, 0.2, 0.0),
//!     Point3::new(0.4, 0.4, 0.0),   // same voxel as the first point
//!     Point3::new(50.0, 0.0, 0.0),  // out of range
//! ]));
//!
//! let filtered = pre.downsample(&raw);
//! assert_eq!(filtered.cloud.len(), 1);
//! assert!((filtered.cloud.points[0].x - 0.3).abs() < 1e-5);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::{Point3, Vector3};
use scanloc_types::{PointCloud, ScanFrame};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Smallest voxel edge length the grid filter operates at; below it the
/// filter is a no-op.
pub const MIN_VOXEL_EDGE_LENGTH: f32 = 0.1;

/// Default maximum planar measurement range.
pub const DEFAULT_MAX_RANGE: f32 = 120.0;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    /// Minimum planar range (inclusive).
    pub min_range: f32,
    /// Maximum planar range (inclusive).
    pub max_range: f32,
    /// Voxel edge length used for averaging.
    pub voxel_edge_length: f32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            min_range: 0.0,
            max_range: DEFAULT_MAX_RANGE,
            voxel_edge_length: 2.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Preprocessor
// ────────────────────────────────────────────────────────────────────────────

/// Range filter + voxel-grid downsampler.
#[derive(Debug)]
pub struct Preprocessor {
    config: PreprocessorConfig,
    /// Set once the bad-range-bounds error has been logged.
    range_error_logged: AtomicBool,
}

impl Preprocessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        info!(
            min_range = config.min_range,
            max_range = config.max_range,
            voxel_edge_length = config.voxel_edge_length,
            "scan preprocessor configured"
        );
        Self {
            config,
            range_error_logged: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PreprocessorConfig {
        &self.config
    }

    /// Range-filter then voxel-average `raw`, keeping its header.
    pub fn downsample(&self, raw: &ScanFrame) -> ScanFrame {
        let narrowed = self.filter_by_range(&raw.cloud);
        let cloud = if self.config.voxel_edge_length >= MIN_VOXEL_EDGE_LENGTH {
            voxel_downsample(&narrowed, self.config.voxel_edge_length)
        } else {
            narrowed
        };
        raw.with_cloud(cloud)
    }

    /// Keep points with `min_range² <= x² + y² <= max_range²`.
    ///
    /// Returns the input unchanged when `min_range >= max_range`.
    pub fn filter_by_range(&self, cloud: &PointCloud) -> PointCloud {
        let PreprocessorConfig {
            min_range,
            max_range,
            ..
        } = self.config;

        if min_range >= max_range {
            if !self.range_error_logged.swap(true, Ordering::Relaxed) {
                error!(min_range, max_range, "min_range >= max_range; range filter disabled");
            }
            return cloud.clone();
        }

        let square_min = f64::from(min_range) * f64::from(min_range);
        let square_max = f64::from(max_range) * f64::from(max_range);

        cloud
            .iter()
            .filter(|p| {
                let (x, y) = (f64::from(p.x), f64::from(p.y));
                let square_distance = x * x + y * y;
                square_min <= square_distance && square_distance <= square_max
            })
            .copied()
            .collect()
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(PreprocessorConfig::default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Voxel grid
// ────────────────────────────────────────────────────────────────────────────

/// Replace every occupied cube of edge `edge` by the centroid of its points.
///
/// Cells are anchored at the origin (`floor(p / edge)`), non-finite points
/// are dropped, and output order follows the cell index (z, then y, then x)
/// so the result is deterministic.
pub fn voxel_downsample(cloud: &PointCloud, edge: f32) -> PointCloud {
    let inverse = 1.0 / f64::from(edge);
    let mut cells: BTreeMap<(i64, i64, i64), (Vector3<f64>, u32)> = BTreeMap::new();

    for p in cloud.iter() {
        if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
            continue;
        }
        let v = Vector3::new(f64::from(p.x), f64::from(p.y), f64::from(p.z));
        let key = (
            (v.z * inverse).floor() as i64,
            (v.y * inverse).floor() as i64,
            (v.x * inverse).floor() as i64,
        );
        let cell = cells.entry(key).or_insert((Vector3::zeros(), 0));
        cell.0 += v;
        cell.1 += 1;
    }

    cells
        .into_values()
        .map(|(sum, count)| {
            let c = sum / f64::from(count);
            Point3::new(c.x as f32, c.y as f32, c.z as f32)
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scan(points: Vec<Point3<f32>>) -> ScanFrame {
        ScanFrame::new(3, Utc::now(), "velodyne", PointCloud::from_points(points))
    }

    fn config(min_range: f32, max_range: f32, voxel_edge_length: f32) -> PreprocessorConfig {
        PreprocessorConfig {
            min_range,
            max_range,
            voxel_edge_length,
        }
    }

    #[test]
    fn default_config_matches_measurement_limits() {
        let cfg = PreprocessorConfig::default();
        assert_eq!(cfg.min_range, 0.0);
        assert_eq!(cfg.max_range, 120.0);
        assert!(cfg.voxel_edge_length >= MIN_VOXEL_EDGE_LENGTH);
    }

    #[test]
    fn point_at_max_range_is_kept() {
        let pre = Preprocessor::new(config(0.0, 120.0, 0.0));
        let out = pre.filter_by_range(&PointCloud::from_points(vec![
            Point3::new(120.0, 0.0, 5.0),
            Point3::new(0.0, -120.0, -3.0),
        ]));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn point_beyond_max_range_is_dropped() {
        let pre = Preprocessor::new(config(0.0, 120.0, 0.0));
        let out = pre.filter_by_range(&PointCloud::from_points(vec![
            Point3::new(120.001, 0.0, 0.0),
            Point3::new(10.0, 0.0, 0.0),
        ]));
        assert_eq!(out.len(), 1);
        assert_eq!(out.points[0].x, 10.0);
    }

    #[test]
    fn range_uses_planar_distance_only() {
        let pre = Preprocessor::new(config(0.0, 10.0, 0.0));
        // Far above the sensor, but planar distance is 1.
        let out = pre.filter_by_range(&PointCloud::from_points(vec![Point3::new(1.0, 0.0, 500.0)]));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn min_range_is_inclusive_and_drops_closer_points() {
        let pre = Preprocessor::new(config(2.0, 10.0, 0.0));
        let out = pre.filter_by_range(&PointCloud::from_points(vec![
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
        ]));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn inverted_range_bounds_pass_through() {
        let pre = Preprocessor::new(config(50.0, 10.0, 0.0));
        let cloud = PointCloud::from_points(vec![
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(500.0, 0.0, 0.0),
        ]);
        assert_eq!(pre.filter_by_range(&cloud), cloud);
        // Second call hits the already-logged branch; still a pass-through.
        assert_eq!(pre.filter_by_range(&cloud), cloud);
    }

    #[test]
    fn sub_minimum_voxel_is_idempotent_noop() {
        let pre = Preprocessor::new(config(0.0, 120.0, 0.05));
        let raw = scan(vec![
            Point3::new(0.01, 0.01, 0.0),
            Point3::new(0.02, 0.02, 0.0),
            Point3::new(200.0, 0.0, 0.0),
        ]);
        let expected = pre.filter_by_range(&raw.cloud);

        let first = pre.downsample(&raw);
        let second = pre.downsample(&raw);
        assert_eq!(first.cloud, expected);
        assert_eq!(second.cloud, expected);
        assert_eq!(first.cloud.len(), 2);
    }

    #[test]
    fn voxel_grid_averages_points_per_cell() {
        let cloud = PointCloud::from_points(vec![
            Point3::new(0.1, 0.1, 0.1),
            Point3::new(0.3, 0.5, 0.7),
            Point3::new(1.5, 0.5, 0.5),
        ]);
        let out = voxel_downsample(&cloud, 1.0);
        assert_eq!(out.len(), 2);
        let first = out.points[0];
        assert!((first.x - 0.2).abs() < 1e-5);
        assert!((first.y - 0.3).abs() < 1e-5);
        assert!((first.z - 0.4).abs() < 1e-5);
        assert!((out.points[1].x - 1.5).abs() < 1e-5);
    }

    #[test]
    fn voxel_grid_separates_negative_cells() {
        let cloud = PointCloud::from_points(vec![Point3::new(-0.5, 0.0, 0.0), Point3::new(0.5, 0.0, 0.0)]);
        assert_eq!(voxel_downsample(&cloud, 1.0).len(), 2);
    }

    #[test]
    fn voxel_grid_drops_non_finite_points() {
        let cloud = PointCloud::from_points(vec![
            Point3::new(f32::NAN, 0.0, 0.0),
            Point3::new(0.0, f32::INFINITY, 0.0),
            Point3::new(0.5, 0.5, 0.5),
        ]);
        assert_eq!(voxel_downsample(&cloud, 1.0).len(), 1);
    }

    #[test]
    fn downsample_keeps_header() {
        let pre = Preprocessor::default();
        let raw = scan(vec![Point3::new(1.0, 1.0, 0.0)]);
        let out = pre.downsample(&raw);
        assert_eq!(out.seq, raw.seq);
        assert_eq!(out.stamp, raw.stamp);
        assert_eq!(out.frame_id, "velodyne");
    }

    #[test]
    fn empty_scan_stays_empty() {
        let pre = Preprocessor::default();
        assert!(pre.downsample(&scan(vec![])).cloud.is_empty());
    }
}
