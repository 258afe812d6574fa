//! Pose interpolation for remote replicas.
//!
//! Remote players and foreign-authored apps are not simulated locally;
//! their poses ease toward the latest received target over one network
//! interval. A teleport re-latches the interpolator at the new pose so the
//! replica snaps instead of gliding across the world.

use nalgebra::{UnitQuaternion, Vector3};

use crate::math::Pose;

/// Interpolates position and orientation toward the most recent target.
#[derive(Debug, Clone)]
pub struct PoseInterpolator {
    current: Pose,
    from: Pose,
    target: Pose,
    /// Seconds since the current segment started.
    elapsed: f64,
    /// Seconds the current segment spans (one network interval).
    span: f64,
    /// Counts teleports so observers can detect force-snaps.
    teleport_count: u64,
}

impl PoseInterpolator {
    /// Start latched at `pose`.
    pub fn new(pose: Pose, span: f64) -> Self {
        Self {
            current: pose,
            from: pose,
            target: pose,
            elapsed: 0.0,
            span: span.max(1e-3),
            teleport_count: 0,
        }
    }

    /// Enqueue a normal target: ease from the current pose over one span.
    pub fn push_target(&mut self, target: Pose) {
        self.from = self.current;
        self.target = target;
        self.elapsed = 0.0;
    }

    /// Teleport: re-latch everything at `pose`; the next frame renders it
    /// exactly.
    pub fn snap(&mut self, pose: Pose) {
        self.current = pose;
        self.from = pose;
        self.target = pose;
        self.elapsed = 0.0;
        self.teleport_count += 1;
    }

    /// Advance by `dt` seconds and return the interpolated pose.
    pub fn advance(&mut self, dt: f64) -> Pose {
        self.elapsed += dt;
        let t = (self.elapsed / self.span).clamp(0.0, 1.0);
        self.current = Pose {
            position: self.from.position.lerp(&self.target.position, t),
            rotation: self
                .from
                .rotation
                .try_slerp(&self.target.rotation, t, 1e-9)
                .unwrap_or(self.target.rotation),
        };
        self.current
    }

    /// The pose as of the last advance.
    pub fn current(&self) -> Pose {
        self.current
    }

    /// How many teleports this interpolator has absorbed.
    pub fn teleport_count(&self) -> u64 {
        self.teleport_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_at(x: f64) -> Pose {
        Pose {
            position: Vector3::new(x, 0.0, 0.0),
            rotation: UnitQuaternion::identity(),
        }
    }

    #[test]
    fn eases_toward_target_over_the_span() {
        let mut interp = PoseInterpolator::new(pose_at(0.0), 0.125);
        interp.push_target(pose_at(1.0));

        let mid = interp.advance(0.0625);
        assert!((mid.position.x - 0.5).abs() < 1e-9, "{}", mid.position.x);

        let done = interp.advance(0.0625);
        assert!((done.position.x - 1.0).abs() < 1e-9);

        // Past the span the pose holds at the target.
        let held = interp.advance(1.0);
        assert_eq!(held.position.x, 1.0);
    }

    #[test]
    fn new_target_restarts_from_current_pose() {
        let mut interp = PoseInterpolator::new(pose_at(0.0), 0.1);
        interp.push_target(pose_at(1.0));
        interp.advance(0.05); // halfway, at x=0.5

        interp.push_target(pose_at(0.0));
        let back = interp.advance(0.05);
        assert!(
            (back.position.x - 0.25).abs() < 1e-9,
            "should ease back from 0.5, got {}",
            back.position.x
        );
    }

    #[test]
    fn snap_skips_interpolation_and_counts() {
        let mut interp = PoseInterpolator::new(pose_at(0.0), 0.1);
        interp.push_target(pose_at(1.0));
        interp.advance(0.01);

        interp.snap(pose_at(50.0));
        assert_eq!(interp.teleport_count(), 1);
        let pose = interp.advance(0.001);
        assert_eq!(pose.position.x, 50.0, "teleport must not glide");
    }

    #[test]
    fn orientation_slerps() {
        let mut interp = PoseInterpolator::new(pose_at(0.0), 0.1);
        let target = Pose {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::from_axis_angle(
                &Vector3::y_axis(),
                std::f64::consts::FRAC_PI_2,
            ),
        };
        interp.push_target(target);
        let mid = interp.advance(0.05);
        let angle = mid.rotation.angle();
        assert!(
            (angle - std::f64::consts::FRAC_PI_4).abs() < 1e-6,
            "expected quarter-pi at midpoint, got {angle}"
        );
    }
}
