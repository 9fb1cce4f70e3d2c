//! Rotation helpers shared by the parameter state and the projection model.
//!
//! The calibrated rotation is stored as the vector part `(q1, q2, q3)` of a
//! unit quaternion relative to a fixed 180° flip about the field x axis. With
//! a zero vector part the camera looks straight down onto the field plane, so
//! the scalar part `q0` stays well away from zero for any realistic mounting
//! and can always be derived instead of stored.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// The fixed correction rotation: 180° about the x axis.
///
/// Maps field coordinates `(x, y, z)` to `(x, -y, -z)`, i.e. a camera with its
/// optical axis along `+z` is turned to look down along the field's `-z`.
#[inline]
pub fn q_rotate180() -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(0.0, 1.0, 0.0, 0.0))
}

/// Build the unit quaternion whose vector part is `(q1, q2, q3)`.
///
/// `q0` is derived as `sqrt(1 - q1² - q2² - q3²)`. A vector part longer than
/// one is rescaled to unit length, giving `q0 = 0`.
pub fn quaternion_from_vector_part(q1: f64, q2: f64, q3: f64) -> UnitQuaternion<f64> {
    let v = Vector3::new(q1, q2, q3);
    let sq = v.norm_squared();
    if sq > 1.0 {
        let v = v / sq.sqrt();
        return UnitQuaternion::new_unchecked(Quaternion::new(0.0, v.x, v.y, v.z));
    }
    let q0 = (1.0 - sq).max(0.0).sqrt();
    UnitQuaternion::new_unchecked(Quaternion::new(q0, q1, q2, q3))
}

/// Derived scalar part for a given vector part.
#[inline]
pub fn derived_q0(q1: f64, q2: f64, q3: f64) -> f64 {
    quaternion_from_vector_part(q1, q2, q3).w
}

/// Rotation taking field coordinates into the camera frame.
#[inline]
pub fn field_to_camera_rotation(free: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    free * q_rotate180()
}

/// Inverse of [`field_to_camera_rotation`].
#[inline]
pub fn free_rotation(field_to_camera: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    field_to_camera * q_rotate180().inverse()
}

/// Vector part of `q` after flipping its sign so that `q0 >= 0`.
///
/// `q` and `-q` encode the same rotation; only the representative with a
/// non-negative scalar part can be rebuilt by [`quaternion_from_vector_part`].
pub fn canonical_vector_part(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let v = q.imag();
    if q.w < 0.0 {
        -v
    } else {
        v
    }
}

/// Rotation about the camera's optical axis by `angle` radians.
#[inline]
pub(crate) fn yaw_about_optical_axis(angle: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate180_flips_y_and_z() {
        let p = q_rotate180() * Vector3::new(1.0, 2.0, 3.0);
        assert!((p - Vector3::new(1.0, -2.0, -3.0)).norm() < 1e-12);
    }

    #[test]
    fn vector_part_derives_unit_norm() {
        let q = quaternion_from_vector_part(0.1, -0.2, 0.3);
        let n = q.w * q.w + q.i * q.i + q.j * q.j + q.k * q.k;
        assert!((n - 1.0).abs() < 1e-12);
        assert!(q.w > 0.0);

        let q = quaternion_from_vector_part(2.0, 0.0, 0.0);
        assert_eq!(q.w, 0.0);
        assert!((q.i - 1.0).abs() < 1e-12);
    }

    #[test]
    fn canonical_part_round_trips_through_flip() {
        let free = quaternion_from_vector_part(0.05, 0.02, -0.7);
        let full = field_to_camera_rotation(&free);
        let back = free_rotation(&full);
        let v = canonical_vector_part(&back);
        assert!((v - free.imag()).norm() < 1e-12);
    }
}
