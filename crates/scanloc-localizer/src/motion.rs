//! Constant-velocity motion model used to seed each registration.
//!
//! The predictor remembers the last accepted pose and the rigid motion
//! between the last two accepted poses, and assumes the platform repeats
//! that motion during the next scan period.

use scanloc_types::Transform;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum PredictorState {
    #[default]
    Uninitialized,
    Tracking { previous: Transform, delta: Transform },
}

/// Produces initial guesses from the accepted-pose history.
///
/// # Example
///
/// ```rust
/// use scanloc_localizer::motion::MotionPredictor;
/// use scanloc_types::Transform;
///
/// let mut predictor = MotionPredictor::new();
/// let prior = Transform::translation(1.0, 0.0, 0.0);
///
/// // First guess is the prior itself.
/// assert_eq!(predictor.initial_guess(prior), prior);
///
/// // Moving 1 m along x per scan is extrapolated.
/// predictor.on_accepted(Transform::translation(2.0, 0.0, 0.0));
/// let next = predictor.initial_guess(prior);
/// assert!((next.translation.vector.x - 3.0).abs() < 1e-5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MotionPredictor {
    state: PredictorState,
}

impl MotionPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guess for the next alignment.
    ///
    /// Uninitialized: returns `prior` and starts tracking from it with zero
    /// motion.  Tracking: `previous · delta`.
    pub fn initial_guess(&mut self, prior: Transform) -> Transform {
        match self.state {
            PredictorState::Uninitialized => {
                self.state = PredictorState::Tracking {
                    previous: prior,
                    delta: Transform::identity(),
                };
                prior
            }
            PredictorState::Tracking { previous, delta } => previous * delta,
        }
    }

    /// Record an accepted pose: `delta = previous⁻¹ · pose`, `previous = pose`.
    pub fn on_accepted(&mut self, pose: Transform) {
        let delta = match self.state {
            PredictorState::Tracking { previous, .. } => previous.inverse() * pose,
            PredictorState::Uninitialized => Transform::identity(),
        };
        self.state = PredictorState::Tracking { previous: pose, delta };
    }

    pub fn reset(&mut self) {
        self.state = PredictorState::Uninitialized;
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.state, PredictorState::Tracking { .. })
    }

    /// Last accepted pose, if any.
    pub fn previous(&self) -> Option<Transform> {
        match self.state {
            PredictorState::Tracking { previous, .. } => Some(previous),
            PredictorState::Uninitialized => None,
        }
    }

    /// Motion between the last two accepted poses.
    pub fn delta(&self) -> Option<Transform> {
        match self.state {
            PredictorState::Tracking { delta, .. } => Some(delta),
            PredictorState::Uninitialized => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};

    fn pose(x: f32, y: f32, yaw: f32) -> Transform {
        Transform::from_parts(Translation3::new(x, y, 0.0), UnitQuaternion::from_euler_angles(0.0, 0.0, yaw))
    }

    fn assert_close(a: &Transform, b: &Transform) {
        assert!((a.translation.vector - b.translation.vector).norm() < 1e-5, "{a} != {b}");
        assert!(a.rotation.angle_to(&b.rotation) < 1e-5, "{a} != {b}");
    }

    #[test]
    fn first_guess_is_prior() {
        let mut p = MotionPredictor::new();
        let prior = pose(4.0, -1.0, 0.3);
        assert_eq!(p.initial_guess(prior), prior);
        assert!(p.is_tracking());
        assert_eq!(p.delta(), Some(Transform::identity()));
    }

    #[test]
    fn guess_without_accepts_repeats_prior() {
        let mut p = MotionPredictor::new();
        let prior = pose(1.0, 2.0, 0.1);
        p.initial_guess(prior);
        assert_close(&p.initial_guess(pose(9.0, 9.0, 0.0)), &prior);
    }

    #[test]
    fn accepted_pose_updates_delta() {
        let mut p = MotionPredictor::new();
        let p0 = pose(0.0, 0.0, 0.0);
        let p1 = pose(1.0, 0.5, 0.2);
        p.initial_guess(p0);
        p.on_accepted(p1);

        assert_close(&p.delta().expect("tracking"), &(p0.inverse() * p1));
        assert_eq!(p.previous(), Some(p1));
    }

    #[test]
    fn guess_extrapolates_with_rotation() {
        let mut p = MotionPredictor::new();
        let p0 = pose(0.0, 0.0, 0.0);
        let p1 = pose(1.0, 0.0, std::f32::consts::FRAC_PI_2);
        p.initial_guess(p0);
        p.on_accepted(p1);

        // Turned left 90° after moving 1 m: repeating the motion goes +y.
        let guess = p.initial_guess(p0);
        assert_close(&guess, &(p1 * (p0.inverse() * p1)));
        assert!((guess.translation.vector.x - 1.0).abs() < 1e-5);
        assert!((guess.translation.vector.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn reset_returns_to_prior() {
        let mut p = MotionPredictor::new();
        p.initial_guess(pose(0.0, 0.0, 0.0));
        p.on_accepted(pose(5.0, 0.0, 0.0));
        p.reset();
        assert!(!p.is_tracking());

        let prior = pose(-3.0, 2.0, 1.0);
        assert_eq!(p.initial_guess(prior), prior);
    }
}
