//! Transform Frame (TF) graph and frame resolution.
//!
//! [`TfEngine`] keeps a graph of named reference frames and the rigid
//! transforms that relate them.  Edges are stored parent → child but can be
//! walked in either direction, so any two connected frames can be related by
//! composing the chain found with BFS.
//!
//! [`FrameResolver`] sits on top of any [`TransformGraph`] and applies the
//! localizer's policy: identical frames short-circuit to identity, and a
//! failed lookup degrades to identity ([`Resolved::Fallback`]) rather than
//! aborting the cycle.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use scanloc_perception::transform::{FrameResolver, TfEngine};
//! use scanloc_types::Transform;
//!
//! let mut tf = TfEngine::new();
//! // LiDAR mounted 1.2 m above the base.
//! tf.set_static_transform("base_link", "velodyne", Transform::translation(0.0, 0.0, 1.2));
//!
//! let resolver = FrameResolver::new(Arc::new(tf));
//! let resolved = resolver.resolve("base_link", "velodyne", Utc::now());
//! assert!(!resolved.is_fallback());
//! assert!((resolved.transform().translation.vector.z - 1.2).abs() < 1e-6);
//!
//! // Unknown frames degrade to identity.
//! let missing = resolver.resolve("base_link", "camera", Utc::now());
//! assert!(missing.is_fallback());
//! assert_eq!(missing.transform(), Transform::identity());
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use scanloc_types::Transform;
use thiserror::Error;
use tracing::warn;

/// Default tolerance between a dynamic edge's stamp and the query time, in
/// milliseconds.
pub const DEFAULT_STALE_TOLERANCE_MS: i64 = 1_000;

// ────────────────────────────────────────────────────────────────────────────
// Errors & graph contract
// ────────────────────────────────────────────────────────────────────────────

/// Why a transform lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("frame '{0}' does not exist in the transform graph")]
    UnknownFrame(String),

    #[error("no transform chain connects '{target_frame}' and '{source_frame}'")]
    NoPath { target_frame: String, source_frame: String },

    #[error("transform '{parent}' -> '{child}' is stale by {age_ms} ms")]
    Stale {
        parent: String,
        child: String,
        age_ms: i64,
    },
}

/// A service able to relate two named frames at a point in time.
///
/// `lookup(target, source, at)` returns the transform that maps points
/// expressed in `source` into `target`.
pub trait TransformGraph: Send + Sync {
    fn lookup(&self, target: &str, source: &str, at: DateTime<Utc>) -> Result<Transform, LookupError>;
}

// ────────────────────────────────────────────────────────────────────────────
// TfEngine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Edge {
    /// Maps points in the child frame into the parent frame.
    transform: Transform,
    /// `None` for static (calibration) edges, which never go stale.
    stamp: Option<DateTime<Utc>>,
}

/// In-process transform graph.
///
/// Static edges hold calibration transforms (sensor mounts).  Dynamic edges
/// carry a stamp and are rejected by lookups whose query time is further
/// than the stale tolerance away from it.
#[derive(Debug)]
pub struct TfEngine {
    /// `children[parent][child] = Edge`
    children: HashMap<String, HashMap<String, Edge>>,
    /// `parents[child] = {parent, ..}`
    parents: HashMap<String, HashSet<String>>,
    tolerance: TimeDelta,
}

impl Default for TfEngine {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            parents: HashMap::new(),
            tolerance: TimeDelta::milliseconds(DEFAULT_STALE_TOLERANCE_MS),
        }
    }
}

impl TfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the stale tolerance applied to dynamic edges.
    pub fn with_stale_tolerance(mut self, tolerance: TimeDelta) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Register or replace a calibration transform `parent ← child`.
    pub fn set_static_transform(&mut self, parent: &str, child: &str, transform: Transform) {
        self.insert(parent, child, Edge { transform, stamp: None });
    }

    /// Register or replace a time-stamped transform `parent ← child`.
    pub fn set_transform(&mut self, parent: &str, child: &str, transform: Transform, stamp: DateTime<Utc>) {
        self.insert(
            parent,
            child,
            Edge {
                transform,
                stamp: Some(stamp),
            },
        );
    }

    /// `true` if `frame` appears on either end of any edge.
    pub fn has_frame(&self, frame: &str) -> bool {
        self.children.contains_key(frame) || self.parents.contains_key(frame)
    }

    fn insert(&mut self, parent: &str, child: &str, edge: Edge) {
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string(), edge);
        self.parents
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    fn check_fresh(&self, parent: &str, child: &str, edge: &Edge, at: DateTime<Utc>) -> Result<(), LookupError> {
        match edge.stamp {
            Some(stamp) if at.signed_duration_since(stamp).abs() > self.tolerance => Err(LookupError::Stale {
                parent: parent.to_string(),
                child: child.to_string(),
                age_ms: at.signed_duration_since(stamp).num_milliseconds(),
            }),
            _ => Ok(()),
        }
    }

    /// Compose the chain mapping points in `source` into `target`.
    ///
    /// BFS starts at `target`; each queue item carries the transform from
    /// the current node into `target`.  Walking parent → child composes the
    /// edge, walking child → parent composes its inverse.
    pub fn lookup(&self, target: &str, source: &str, at: DateTime<Utc>) -> Result<Transform, LookupError> {
        if target == source {
            return Ok(Transform::identity());
        }
        for frame in [target, source] {
            if !self.has_frame(frame) {
                return Err(LookupError::UnknownFrame(frame.to_string()));
            }
        }

        let mut queue: VecDeque<(&str, Transform)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stale: Option<LookupError> = None;

        queue.push_back((target, Transform::identity()));
        visited.insert(target);

        while let Some((current, accumulated)) = queue.pop_front() {
            let mut steps: Vec<(&str, Transform)> = Vec::new();

            if let Some(children) = self.children.get(current) {
                for (child, edge) in children {
                    match self.check_fresh(current, child, edge, at) {
                        Ok(()) => steps.push((child.as_str(), edge.transform)),
                        Err(e) => stale = Some(e),
                    }
                }
            }
            if let Some(parents) = self.parents.get(current) {
                for parent in parents {
                    let Some(edge) = self.children.get(parent).and_then(|c| c.get(current)) else {
                        continue;
                    };
                    match self.check_fresh(parent, current, edge, at) {
                        Ok(()) => steps.push((parent.as_str(), edge.transform.inverse())),
                        Err(e) => stale = Some(e),
                    }
                }
            }

            for (next, step) in steps {
                if visited.contains(next) {
                    continue;
                }
                let composed = accumulated * step;
                if next == source {
                    return Ok(composed);
                }
                visited.insert(next);
                queue.push_back((next, composed));
            }
        }

        Err(stale.unwrap_or_else(|| LookupError::NoPath {
            target_frame: target.to_string(),
            source_frame: source.to_string(),
        }))
    }
}

impl TransformGraph for TfEngine {
    fn lookup(&self, target: &str, source: &str, at: DateTime<Utc>) -> Result<Transform, LookupError> {
        TfEngine::lookup(self, target, source, at)
    }
}

/// Shared engine: writers take the lock to broadcast transforms, the
/// resolver takes a read lock per lookup.
impl TransformGraph for RwLock<TfEngine> {
    fn lookup(&self, target: &str, source: &str, at: DateTime<Utc>) -> Result<Transform, LookupError> {
        let engine = self.read().unwrap_or_else(PoisonError::into_inner);
        engine.lookup(target, source, at)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FrameResolver
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of [`FrameResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Source and target are the same frame; the graph was not consulted.
    Identical,
    /// The graph returned a transform.
    Found(Transform),
    /// The graph could not answer; identity is used in its place.
    Fallback(LookupError),
}

impl Resolved {
    /// The transform to apply: identity for [`Resolved::Identical`] and
    /// [`Resolved::Fallback`].
    pub fn transform(&self) -> Transform {
        match self {
            Resolved::Found(t) => *t,
            Resolved::Identical | Resolved::Fallback(_) => Transform::identity(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Resolved::Fallback(_))
    }
}

/// Resolves transforms between named frames with an identity fallback.
#[derive(Clone)]
pub struct FrameResolver {
    graph: Arc<dyn TransformGraph>,
}

impl FrameResolver {
    pub fn new(graph: Arc<dyn TransformGraph>) -> Self {
        Self { graph }
    }

    /// Typed lookup without the fallback policy.
    pub fn lookup(&self, target: &str, source: &str, at: DateTime<Utc>) -> Result<Transform, LookupError> {
        if target == source {
            return Ok(Transform::identity());
        }
        self.graph.lookup(target, source, at)
    }

    /// Resolve `target ← source`, never failing.
    ///
    /// Lookup failures are logged and reported as [`Resolved::Fallback`],
    /// whose transform is identity.
    pub fn resolve(&self, target: &str, source: &str, at: DateTime<Utc>) -> Resolved {
        if target == source {
            return Resolved::Identical;
        }
        match self.graph.lookup(target, source, at) {
            Ok(transform) => Resolved::Found(transform),
            Err(e) => {
                warn!(
                    error = %e,
                    target_frame = target,
                    source_frame = source,
                    hint = %format_args!("Please publish TF {target} to {source}"),
                    "transform lookup failed; falling back to identity"
                );
                Resolved::Fallback(e)
            }
        }
    }
}

impl std::fmt::Debug for FrameResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameResolver").finish_non_exhaustive()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
