//! Field ↔ image projection for one parameter vector.

use nalgebra::{base::storage::Owned, Point3, SMatrix, UnitQuaternion, Vector2, Vector3, U1, U3};

use cam_geom::{
    coordinate_system::CameraFrame, ExtrinsicParameters, IntrinsicParameters, Pixels, Points,
    WorldFrame,
};

use crate::intrinsics::{FieldCameraIntrinsics, RadialDistortion};
use crate::math::{field_to_camera_rotation, quaternion_from_vector_part};
use crate::parameters::{ParamIndex, StateVector};
use crate::{Error, Result};

/// Points closer to the camera plane than this (in mm) are rejected.
const MIN_DEPTH: f64 = 1e-9;

/// Rays whose direction has a smaller relative `z` component than this are
/// treated as parallel to the field plane.
const MIN_RAY_SLOPE: f64 = 1e-9;

type CameraPoint = Points<CameraFrame, f64, U1, Owned<f64, U1, U3>>;

/// A complete camera model for one parameter vector.
///
/// The pose maps a field point `p` into the camera frame as
/// `q * q_rotate180 * p + t`, where `q` is the free rotation of the parameter
/// vector and `t = (tx, ty, tz)`.
#[derive(Debug, Clone)]
pub struct FieldCamera {
    camera: cam_geom::Camera<f64, FieldCameraIntrinsics<f64>>,
    rotation: UnitQuaternion<f64>,
    translation: Vector3<f64>,
    camcenter: Vector3<f64>,
}

impl FieldCamera {
    /// Build the camera described by a full state vector.
    pub fn from_state(state: &StateVector) -> Self {
        let intrinsics = FieldCameraIntrinsics::from_params(
            state[ParamIndex::FocalLength as usize],
            state[ParamIndex::PrincipalPointX as usize],
            state[ParamIndex::PrincipalPointY as usize],
            RadialDistortion::new(state[ParamIndex::Distortion as usize]),
        );
        let free = quaternion_from_vector_part(
            state[ParamIndex::Q1 as usize],
            state[ParamIndex::Q2 as usize],
            state[ParamIndex::Q3 as usize],
        );
        let rotation = field_to_camera_rotation(&free);
        let translation = Vector3::new(
            state[ParamIndex::Tx as usize],
            state[ParamIndex::Ty as usize],
            state[ParamIndex::Tz as usize],
        );
        let camcenter = -rotation.inverse_transform_vector(&translation);
        let extrinsics = ExtrinsicParameters::from_rotation_and_camcenter(
            rotation,
            Point3::from(camcenter),
        );
        Self {
            camera: cam_geom::Camera::new(intrinsics, extrinsics),
            rotation,
            translation,
            camcenter,
        }
    }

    /// The intrinsic parameters.
    #[inline]
    pub fn intrinsics(&self) -> &FieldCameraIntrinsics<f64> {
        self.camera.intrinsics()
    }

    /// The underlying `cam_geom` camera.
    #[inline]
    pub fn as_cam_geom(&self) -> &cam_geom::Camera<f64, FieldCameraIntrinsics<f64>> {
        &self.camera
    }

    /// Rotation taking field coordinates into the camera frame.
    #[inline]
    pub fn rotation(&self) -> &UnitQuaternion<f64> {
        &self.rotation
    }

    /// Translation `(tx, ty, tz)` applied after the rotation.
    #[inline]
    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Camera center in field coordinates.
    #[inline]
    pub fn camera_center(&self) -> &Vector3<f64> {
        &self.camcenter
    }

    /// Field point in camera coordinates, rejecting points behind the camera.
    fn field_to_camera(&self, p_field: &Vector3<f64>) -> Result<CameraPoint> {
        let world = Points::<WorldFrame, _, _, _>::new(SMatrix::<f64, 1, 3>::new(
            p_field.x, p_field.y, p_field.z,
        ));
        let cam = self.camera.extrinsics().world_to_camera(&world);
        let depth = cam.data[(0, 2)];
        if !(depth > MIN_DEPTH) {
            return Err(Error::BehindCamera);
        }
        Ok(cam)
    }

    /// Project a field point into the (distorted) image.
    pub fn field2image(&self, p_field: &Vector3<f64>) -> Result<Vector2<f64>> {
        let cam = self.field_to_camera(p_field)?;
        let px = self.intrinsics().camera_to_pixel(&cam);
        Ok(Vector2::new(px.data[(0, 0)], px.data[(0, 1)]))
    }

    /// Project a field point into undistorted pixel coordinates.
    ///
    /// Straight field lines stay straight in this space.
    pub fn field2undistorted(&self, p_field: &Vector3<f64>) -> Result<Vector2<f64>> {
        let cam = self.field_to_camera(p_field)?;
        let px = self.intrinsics().camera_to_undistorted_pixel(&cam);
        Ok(Vector2::new(px.data[(0, 0)], px.data[(0, 1)]))
    }

    /// Remove lens distortion from an observed pixel.
    #[inline]
    pub fn undistort_image_point(&self, p_image: &Vector2<f64>) -> Vector2<f64> {
        let (u, v) = self.intrinsics().undistort_pixel(p_image.x, p_image.y);
        Vector2::new(u, v)
    }

    /// Back-project a pixel onto the field plane at height `z`.
    ///
    /// Returns `Err(Error::RayParallelToPlane)` if the viewing ray does not
    /// cross the plane and `Err(Error::BehindCamera)` if it crosses behind the
    /// camera. Neither case is worth retrying with the same parameters.
    pub fn image2field(&self, p_image: &Vector2<f64>, z: f64) -> Result<Vector3<f64>> {
        let pixels = Pixels::new(SMatrix::<f64, 1, 2>::new(p_image.x, p_image.y));
        let rays = self.intrinsics().pixel_to_camera(&pixels);
        let dir_cam = Vector3::new(rays.data[(0, 0)], rays.data[(0, 1)], rays.data[(0, 2)]);
        let dir = self.rotation.inverse_transform_vector(&dir_cam);

        if dir.z.abs() <= MIN_RAY_SLOPE * dir.norm() {
            return Err(Error::RayParallelToPlane);
        }
        let s = (z - self.camcenter.z) / dir.z;
        if !(s > 0.0) {
            return Err(Error::BehindCamera);
        }
        Ok(self.camcenter + dir * s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::canonical_vector_part;

    fn tilted_state() -> StateVector {
        let free = UnitQuaternion::from_euler_angles(0.08, -0.05, 0.6);
        let v = canonical_vector_part(&free);
        StateVector::from_column_slice(&[
            510.0, 385.0, 295.0, 0.15, v.x, v.y, v.z, -1400.0, 120.0, 3900.0,
        ])
    }

    #[test]
    fn field_image_field_round_trip() {
        let cam = FieldCamera::from_state(&tilted_state());
        for &(x, y, z) in &[
            (0.0, 0.0, 0.0),
            (1500.0, 1000.0, 0.0),
            (3025.0, -2025.0, 0.0),
            (800.0, 300.0, 150.0),
        ] {
            let p = Vector3::new(x, y, z);
            let img = cam.field2image(&p).unwrap();
            let back = cam.image2field(&img, z).unwrap();
            assert!((back - p).norm() < 1e-6, "{} vs {}", back, p);
        }
    }

    #[test]
    fn straight_down_camera_centers_the_origin() {
        let mut state = StateVector::zeros();
        state[ParamIndex::FocalLength as usize] = 500.0;
        state[ParamIndex::PrincipalPointX as usize] = 390.0;
        state[ParamIndex::PrincipalPointY as usize] = 290.0;
        state[ParamIndex::Tz as usize] = 4000.0;
        let cam = FieldCamera::from_state(&state);
        let img = cam.field2image(&Vector3::zeros()).unwrap();
        assert!((img - Vector2::new(390.0, 290.0)).norm() < 1e-9);
        assert!((cam.camera_center() - Vector3::new(0.0, 0.0, 4000.0)).norm() < 1e-9);
        // field +y appears towards the top of the image
        let img = cam.field2image(&Vector3::new(0.0, 1000.0, 0.0)).unwrap();
        assert!(img.y < 290.0);
    }

    #[test]
    fn points_above_the_camera_are_rejected() {
        let cam = FieldCamera::from_state(&tilted_state());
        let p = Vector3::new(0.0, 0.0, 10_000.0);
        assert!(matches!(cam.field2image(&p), Err(Error::BehindCamera)));
    }

    #[test]
    fn horizon_pixel_has_no_field_point() {
        let mut state = StateVector::zeros();
        state[ParamIndex::FocalLength as usize] = 500.0;
        state[ParamIndex::Tz as usize] = 4000.0;
        // tilt the optical axis to be parallel with the field plane
        let free = UnitQuaternion::from_euler_angles(std::f64::consts::FRAC_PI_2, 0.0, 0.0);
        let v = canonical_vector_part(&free);
        state[ParamIndex::Q1 as usize] = v.x;
        state[ParamIndex::Q2 as usize] = v.y;
        state[ParamIndex::Q3 as usize] = v.z;
        let cam = FieldCamera::from_state(&state);
        let res = cam.image2field(&Vector2::new(0.0, 0.0), 0.0);
        assert!(matches!(res, Err(Error::RayParallelToPlane)));
    }
}
