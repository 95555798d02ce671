//! [`Localizer`] – per-scan pose-tracking state machine.
//!
//! Each call to [`Localizer::process`] runs one cycle:
//!
//! 1. lock the active map (skip the scan when none is loaded),
//! 2. bring the scan into the body frame,
//! 3. seed the alignment from the motion model,
//! 4. align against the map while still holding the lock,
//! 5. accept or reject the result ([`is_converged`]),
//! 6. publish pose / transform (accepted only), the aligned scan and the
//!    metrics, and update the [`HealthBoard`] once.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──map loaded──▶ Initializing ──accepted──▶ Tracking ◀──accepted── Degraded
//!                            ▲                        │                      ▲
//!                            └──── initial pose ──────┤                      │
//!                                                     └──N rejections in a row┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use scanloc_middleware::EventBus;
use scanloc_perception::FrameResolver;
use scanloc_types::{
    AlignmentMetrics, Event, EventPayload, LocalizerState, PoseStamped, ScanFrame, Transform, TransformStamped,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};

use crate::health::HealthBoard;
use crate::map_store::MapStore;
use crate::motion::MotionPredictor;
use crate::registration::{is_converged, RegistrationEngine, RegistrationResult, RegistrationTarget};

/// `source` field of every event the localizer publishes.
pub const EVENT_SOURCE: &str = "scanloc::localizer";

const NO_MAP_WARNING_PERIOD: Duration = Duration::from_secs(1);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    /// Fixed frame every pose is expressed in.
    pub map_frame: String,
    /// Frame the registration aligns (the platform body).
    pub body_frame: String,
    /// Minimum fit score for a result to be accepted.
    pub convergence_fit_threshold: f64,
    /// Consecutive rejections that move Tracking to Degraded.
    pub degraded_rejection_threshold: u32,
    /// Skip the scan instead of assuming identity when body ← scan cannot be
    /// resolved.
    pub skip_on_frame_fallback: bool,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            map_frame: "map".to_string(),
            body_frame: "base_link".to_string(),
            convergence_fit_threshold: 3.0,
            degraded_rejection_threshold: 5,
            skip_on_frame_fallback: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Cycle outcome
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No map has been loaded yet.
    NoMap,
    /// The scan frame could not be related to the body frame.
    FrameUnresolved,
}

/// What a registered cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Pose returned by the engine (published only when accepted).
    pub pose: Transform,
    pub initial_guess: Transform,
    pub metrics: AlignmentMetrics,
    /// The scan in the map frame, placed with `pose`.
    pub aligned: Arc<ScanFrame>,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Accepted(CycleReport),
    Rejected(CycleReport),
}

impl CycleOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CycleOutcome::Accepted(_))
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Accepted(report) | CycleOutcome::Rejected(report) => Some(report),
            CycleOutcome::Skipped(_) => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Localizer
// ────────────────────────────────────────────────────────────────────────────

/// Orchestrates one registration per incoming scan.
pub struct Localizer<E: RegistrationEngine> {
    config: LocalizerConfig,
    engine: Arc<E>,
    map_store: Arc<MapStore<E::Target>>,
    frames: FrameResolver,
    predictor: MotionPredictor,
    /// Operator-supplied pose used while the predictor is uninitialized.
    prior: Transform,
    bus: EventBus,
    health: HealthBoard,
    last_no_map_warning: Option<Instant>,
}

impl<E: RegistrationEngine> Localizer<E> {
    pub fn new(
        config: LocalizerConfig,
        engine: Arc<E>,
        map_store: Arc<MapStore<E::Target>>,
        frames: FrameResolver,
        bus: EventBus,
        health: HealthBoard,
    ) -> Self {
        Self {
            config,
            engine,
            map_store,
            frames,
            predictor: MotionPredictor::new(),
            prior: Transform::identity(),
            bus,
            health,
            last_no_map_warning: None,
        }
    }

    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }

    pub fn state(&self) -> LocalizerState {
        self.health.snapshot().state
    }

    pub fn health(&self) -> &HealthBoard {
        &self.health
    }

    pub fn predictor(&self) -> &MotionPredictor {
        &self.predictor
    }

    /// Run one scan cycle.  Never fails; problems are reported through the
    /// outcome, the health snapshot and the log.
    pub fn process(&mut self, scan: &ScanFrame) -> CycleOutcome {
        let span = info_span!("scan_cycle", seq = scan.seq);
        let _entered = span.enter();
        let cycle_started = Instant::now();

        let store = Arc::clone(&self.map_store);
        let guard = store.borrow_for_registration();
        let Some(target) = guard.target() else {
            self.warn_no_map();
            self.health.modify(|s| s.skipped_scans += 1);
            return CycleOutcome::Skipped(SkipReason::NoMap);
        };

        let resolved = self.frames.resolve(&self.config.body_frame, &scan.frame_id, scan.stamp);
        let fell_back = resolved.is_fallback();
        if fell_back && self.config.skip_on_frame_fallback {
            self.health.modify(|s| {
                s.frame_fallbacks += 1;
                s.skipped_scans += 1;
            });
            return CycleOutcome::Skipped(SkipReason::FrameUnresolved);
        }
        let body_cloud = scan.cloud.transformed(&resolved.transform());

        let initial_guess = self.predictor.initial_guess(self.prior);
        let max_iterations = target.params().max_iterations;

        let align_started = Instant::now();
        let result = match self.engine.align(&body_cloud, &initial_guess, target) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "registration engine fault; cycle treated as zero confidence");
                RegistrationResult::zero_confidence(initial_guess)
            }
        };
        let align_time_ms = millis(align_started.elapsed());
        drop(guard);

        let converged = is_converged(&result, max_iterations, self.config.convergence_fit_threshold);
        let aligned = Arc::new(ScanFrame::new(
            scan.seq,
            scan.stamp,
            self.config.map_frame.clone(),
            body_cloud.transformed(&result.pose),
        ));

        if converged {
            self.predictor.on_accepted(result.pose);
        }
        let exe_time_ms = millis(cycle_started.elapsed());

        let rejection_limit = self.config.degraded_rejection_threshold;
        let mut previous_state = LocalizerState::Idle;
        let snapshot = self.health.modify(|s| {
            previous_state = s.state;
            if fell_back {
                s.frame_fallbacks += 1;
            }
            s.seq = scan.seq;
            s.last_fit_score = Some(result.fit_score);
            s.last_iterations = Some(result.iterations);
            s.last_align_ms = Some(align_time_ms);
            s.last_cycle_ms = Some(exe_time_ms);
            if converged {
                s.accepted_poses += 1;
                s.consecutive_rejections = 0;
                s.state = LocalizerState::Tracking;
            } else {
                s.consecutive_rejections = s.consecutive_rejections.saturating_add(1);
                if s.state == LocalizerState::Tracking && s.consecutive_rejections >= rejection_limit {
                    s.state = LocalizerState::Degraded;
                }
            }
        });
        log_transition(previous_state, snapshot.state, snapshot.consecutive_rejections);

        let metrics = AlignmentMetrics {
            seq: scan.seq,
            stamp: scan.stamp,
            align_time_ms,
            exe_time_ms,
            fit_score: result.fit_score,
            iterations: result.iterations,
            converged,
            consecutive_rejections: snapshot.consecutive_rejections,
        };

        if converged {
            self.publish_pose(scan, &result.pose);
            if let Some(delta) = self.predictor.delta() {
                let (roll, pitch, yaw) = delta.rotation.euler_angles();
                let t = delta.translation.vector;
                debug!(dx = t.x, dy = t.y, dz = t.z, roll, pitch, yaw, "motion delta");
            }
        }
        self.bus
            .emit(Event::new(EVENT_SOURCE, EventPayload::AlignedPoints(Arc::clone(&aligned))));
        self.bus.emit(Event::new(EVENT_SOURCE, EventPayload::Metrics(metrics)));

        debug!(
            points = scan.cloud.len(),
            align_time_ms,
            exe_time_ms,
            fit_score = result.fit_score,
            iterations = result.iterations,
            converged,
            skipping_publish_num = snapshot.consecutive_rejections,
            "scan cycle finished"
        );

        let report = CycleReport {
            pose: result.pose,
            initial_guess,
            metrics,
            aligned,
        };
        if converged {
            CycleOutcome::Accepted(report)
        } else {
            CycleOutcome::Rejected(report)
        }
    }

    /// Restart tracking from an operator-supplied pose.
    ///
    /// The pose is brought into the map frame, the motion model forgets its
    /// history and a tracking localizer drops back to Initializing.
    pub fn set_initial_pose(&mut self, pose: &PoseStamped) {
        let to_map = self.frames.resolve(&self.config.map_frame, &pose.frame_id, pose.stamp);
        self.prior = to_map.transform() * pose.pose;
        self.predictor.reset();

        let mut previous_state = LocalizerState::Idle;
        let snapshot = self.health.modify(|s| {
            previous_state = s.state;
            if matches!(s.state, LocalizerState::Tracking | LocalizerState::Degraded) {
                s.state = LocalizerState::Initializing;
            }
            s.consecutive_rejections = 0;
        });

        let t = self.prior.translation.vector;
        info!(x = t.x, y = t.y, z = t.z, frame = %pose.frame_id, "initial pose set");
        log_transition(previous_state, snapshot.state, 0);
    }

    fn publish_pose(&self, scan: &ScanFrame, pose: &Transform) {
        let pose_msg = PoseStamped {
            stamp: scan.stamp,
            frame_id: self.config.map_frame.clone(),
            pose: *pose,
        };
        let transform_msg = TransformStamped {
            stamp: scan.stamp,
            parent_frame: self.config.map_frame.clone(),
            child_frame: self.config.body_frame.clone(),
            transform: *pose,
        };
        self.bus.emit(Event::new(EVENT_SOURCE, EventPayload::Pose(pose_msg)));
        self.bus.emit(Event::new(EVENT_SOURCE, EventPayload::Transform(transform_msg)));
    }

    fn warn_no_map(&mut self) {
        let due = self
            .last_no_map_warning
            .is_none_or(|last| last.elapsed() >= NO_MAP_WARNING_PERIOD);
        if due {
            warn!("No map loaded; skipping scan");
            self.last_no_map_warning = Some(Instant::now());
        }
    }
}

fn log_transition(from: LocalizerState, to: LocalizerState, consecutive_rejections: u32) {
    if from == to {
        return;
    }
    match to {
        LocalizerState::Degraded => {
            warn!(%from, %to, consecutive_rejections, "localizer degraded")
        }
        _ => info!(%from, %to, "localizer state changed"),
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
