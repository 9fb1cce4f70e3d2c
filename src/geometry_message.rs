//! Flat wire record of a calibrated camera.

#[cfg(feature = "serde-serialize")]
use std::io::{Read, Write};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::{Quaternion, UnitQuaternion};

use crate::math::{canonical_vector_part, free_rotation};
use crate::parameters::{CameraParameters, ParamIndex, StateVector};
use crate::{Error, Result};

/// Calibration of one camera as exchanged with other processes.
///
/// The quaternion `(q0, q1, q2, q3)` is the full rotation taking field
/// coordinates into the camera frame. `camera_id` identifies the camera and is
/// not part of the parameter vector.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct GeometryCameraCalibration {
    /// Focal length in pixels.
    pub focal_length: f64,
    /// Principal point x in pixels.
    pub principal_point_x: f64,
    /// Principal point y in pixels.
    pub principal_point_y: f64,
    /// Radial distortion coefficient.
    pub distortion: f64,
    /// Scalar part of the field-to-camera rotation.
    pub q0: f64,
    /// First vector component of the field-to-camera rotation.
    pub q1: f64,
    /// Second vector component of the field-to-camera rotation.
    pub q2: f64,
    /// Third vector component of the field-to-camera rotation.
    pub q3: f64,
    /// Translation x (mm).
    pub tx: f64,
    /// Translation y (mm).
    pub ty: f64,
    /// Translation z (mm).
    pub tz: f64,
    /// Camera identifier.
    pub camera_id: u32,
}

impl CameraParameters {
    /// Encode the current parameters for camera `camera_id`.
    pub fn to_geometry_message(&self, camera_id: u32) -> GeometryCameraCalibration {
        let q = self.field_to_camera_rotation();
        let t = self.translation();
        GeometryCameraCalibration {
            focal_length: self.focal_length(),
            principal_point_x: self.principal_point_x(),
            principal_point_y: self.principal_point_y(),
            distortion: self.distortion(),
            q0: q.w,
            q1: q.i,
            q2: q.j,
            q3: q.k,
            tx: t.x,
            ty: t.y,
            tz: t.z,
            camera_id,
        }
    }

    /// Load parameters from a message.
    ///
    /// The quaternion is normalized and converted back to the stored
    /// representation. Returns `Err(Error::InvalidInput)` for a zero
    /// quaternion and `Err(Error::OutOfBounds)` if any value is outside its
    /// bounds; in both cases nothing is changed.
    pub fn from_geometry_message(&mut self, msg: &GeometryCameraCalibration) -> Result<()> {
        let q = Quaternion::new(msg.q0, msg.q1, msg.q2, msg.q3);
        let norm = q.norm();
        if !(norm.is_finite() && norm > f64::EPSILON) {
            return Err(Error::InvalidInput);
        }
        let full = UnitQuaternion::from_quaternion(q);
        let v = canonical_vector_part(&free_rotation(&full));

        let mut state = StateVector::zeros();
        state[ParamIndex::FocalLength as usize] = msg.focal_length;
        state[ParamIndex::PrincipalPointX as usize] = msg.principal_point_x;
        state[ParamIndex::PrincipalPointY as usize] = msg.principal_point_y;
        state[ParamIndex::Distortion as usize] = msg.distortion;
        state[ParamIndex::Q1 as usize] = v.x;
        state[ParamIndex::Q2 as usize] = v.y;
        state[ParamIndex::Q3 as usize] = v.z;
        state[ParamIndex::Tx as usize] = msg.tx;
        state[ParamIndex::Ty as usize] = msg.ty;
        state[ParamIndex::Tz as usize] = msg.tz;
        self.set_state_vector(state)?;
        log::debug!("loaded geometry of camera {}", msg.camera_id);
        Ok(())
    }
}

/// Read a [`GeometryCameraCalibration`] from a YAML document.
///
/// Requires the `serde-serialize` feature.
#[cfg(feature = "serde-serialize")]
pub fn geometry_from_yaml<Rd: Read>(reader: Rd) -> Result<GeometryCameraCalibration> {
    Ok(serde_yaml::from_reader(reader)?)
}

/// Write a [`GeometryCameraCalibration`] as a YAML document.
///
/// Requires the `serde-serialize` feature.
#[cfg(feature = "serde-serialize")]
pub fn geometry_to_yaml<W: Write>(msg: &GeometryCameraCalibration, writer: W) -> Result<()> {
    serde_yaml::to_writer(writer, msg)?;
    Ok(())
}
