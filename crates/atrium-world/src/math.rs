//! Math vocabulary: poses and the wire/nalgebra conversions.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A world-space pose: position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position in meters.
    pub position: Vector3<f64>,
    /// Orientation.
    pub rotation: UnitQuaternion<f64>,
}

impl Pose {
    /// The origin with identity orientation.
    pub fn identity() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Build from wire arrays.
    pub fn from_wire(position: [f64; 3], quaternion: [f64; 4]) -> Self {
        Self {
            position: Vector3::new(position[0], position[1], position[2]),
            rotation: quat_from_wire(quaternion),
        }
    }

    /// Position as a wire array.
    pub fn position_wire(&self) -> [f64; 3] {
        [self.position.x, self.position.y, self.position.z]
    }

    /// Orientation as a wire array (x, y, z, w).
    pub fn rotation_wire(&self) -> [f64; 4] {
        quat_to_wire(&self.rotation)
    }

    /// As a rapier isometry.
    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }

    /// From a rapier isometry.
    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self {
            position: iso.translation.vector,
            rotation: iso.rotation,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Wire quaternion (x, y, z, w) to nalgebra.
pub fn quat_from_wire(q: [f64; 4]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(q[3], q[0], q[1], q[2]))
}

/// nalgebra quaternion to wire (x, y, z, w).
pub fn quat_to_wire(q: &UnitQuaternion<f64>) -> [f64; 4] {
    [q.i, q.j, q.k, q.w]
}

/// The yaw-only part of a rotation: projection onto rotation about +Y.
/// Used when porting platform rotation onto the avatar base, which must
/// never tilt.
pub fn yaw_of(rotation: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    let forward = rotation * Vector3::z();
    let flat = Vector3::new(forward.x, 0.0, forward.z);
    if flat.norm_squared() < 1e-12 {
        return UnitQuaternion::identity();
    }
    let yaw = flat.x.atan2(flat.z);
    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn wire_roundtrip() {
        let pose = Pose::from_wire([1.0, 2.0, 3.0], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(pose.position_wire(), [1.0, 2.0, 3.0]);
        assert_eq!(pose.rotation_wire(), [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn yaw_extraction_ignores_tilt() {
        let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2);
        let tilt = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.4);
        let extracted = yaw_of(&(yaw * tilt));
        let angle = extracted.angle_to(&yaw);
        assert!(angle < 0.2, "extracted yaw deviates by {angle}");
    }

    #[test]
    fn yaw_of_identity_is_identity() {
        assert_eq!(yaw_of(&UnitQuaternion::identity()), UnitQuaternion::identity());
    }
}
