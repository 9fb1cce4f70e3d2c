//! Calibration of fixed overhead cameras against a known field layout
//!
//! # About
//!
//! This crate models a camera mounted above a planar playing field and
//! estimates its parameters from a few known field landmarks and from points
//! detected on the field lines. The model is a pinhole camera with a single
//! radial distortion coefficient; the pose is a rotation relative to a fixed
//! 180° flip (so that the reset camera looks straight down) plus a
//! translation whose `z` component is the camera height.
//!
//! In greater detail:
//!
//! - [`CameraParameters`] holds the ten free parameters as a single
//!   [`StateVector`] with named accessors, seeds in
//!   [`AdditionalCalibrationInformation`] and the line observations in
//!   [`LSCalibrationData`].
//! - [`CameraParameters::field2image`] and [`CameraParameters::image2field`]
//!   project between field and image coordinates. The intrinsic model,
//!   [`FieldCameraIntrinsics`], implements [the `IntrinsicParameters` trait
//!   from the `cam-geom`
//!   crate](https://docs.rs/cam-geom/latest/cam_geom/trait.IntrinsicParameters.html),
//!   and [`FieldCamera`] wraps a
//!   [`cam_geom::Camera`](https://docs.rs/cam-geom/latest/cam_geom/struct.Camera.html).
//! - [`CameraParameters::calibrate`] runs a Levenberg-Marquardt fit for a
//!   [`CalibrationType`]: the pose from four landmarks
//!   ([`CalibrationType::FOUR_POINT_INITIAL`]) or every parameter including
//!   line residuals ([`CalibrationType::FULL_ESTIMATION`]).
//! - [`SharedCameraParameters`] lets other threads project while a
//!   calibration runs.
//! - [`GeometryCameraCalibration`] is the flat record exchanged with other
//!   processes. When compiled with the `serde-serialize` feature, it can be
//!   read and written as YAML with [`geometry_from_yaml`] and
//!   [`geometry_to_yaml`].
//!
//! # Example - recover the pose of a camera from the four landmarks
//!
//! ```
//! use std::sync::Arc;
//!
//! use field_camera_calib::{CalibrationField, CalibrationType, CameraParameters, ParamIndex};
//!
//! let field = Arc::new(CalibrationField::default());
//!
//! // A camera above the middle of the half field, turned a little about its
//! // optical axis. Its images of the landmarks stand in for hand-placed
//! // points.
//! let mut truth = CameraParameters::new(field.clone());
//! truth.set(ParamIndex::Tx, -1500.0)?;
//! truth.set(ParamIndex::Q3, 0.1)?;
//! let mut image_points = Vec::new();
//! for p in field.landmarks().iter() {
//!     image_points.push(truth.field2image(p)?);
//! }
//!
//! let mut params = CameraParameters::new(field.clone());
//! let report = params.calibrate(
//!     &field.landmarks(),
//!     &image_points,
//!     CalibrationType::FOUR_POINT_INITIAL,
//! )?;
//! assert!(report.final_chisqr < 1e-6);
//!
//! let corner = params.image2field(&image_points[0], 0.0)?;
//! assert!((corner - field.left_corner()).norm() < 1e-3);
//! # Ok::<(), field_camera_calib::Error>(())
//! ```
//!
//! # testing
//!
//! Run unit tests with:
//!
//! ```text
//! cargo test
//! cargo test --features serde-serialize
//! ```

#![deny(rust_2018_idioms, unsafe_code, missing_docs)]

mod bounded;
mod calibration;
mod camera;
mod field;
mod geometry_message;
mod intrinsics;
mod line_data;
pub mod math;
mod parameters;
mod shared;

pub use bounded::{BoundedScalar, Bounds, Setting};
pub use calibration::{
    CalibrationOutcome, CalibrationReport, CalibrationSolution, CalibrationState,
    CalibrationType, SolverOptions,
};
pub use camera::FieldCamera;
pub use field::{CalibrationField, FieldLine};
pub use geometry_message::GeometryCameraCalibration;
#[cfg(feature = "serde-serialize")]
pub use geometry_message::{geometry_from_yaml, geometry_to_yaml};
pub use intrinsics::{FieldCameraIntrinsics, RadialDistortion, UndistortedPixels};
pub use line_data::{CorridorSample, LSCalibrationData, LinePoint};
pub use parameters::{
    AdditionalCalibrationInformation, CameraParameters, ParamIndex, ParamMask, StateVector,
    STATE_SPACE_DIMENSION,
};
pub use shared::SharedCameraParameters;

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid input")]
    /// invalid input
    InvalidInput,
    #[error("error parsing YAML")]
    /// error parsing YAML
    YamlParseError,
    #[error("underdetermined: {residuals} residuals for {parameters} parameters")]
    /// fewer residuals than estimated parameters
    Underdetermined {
        /// number of residuals available
        residuals: usize,
        /// number of parameters to estimate
        parameters: usize,
    },
    #[error("degenerate configuration")]
    /// the observations do not constrain every estimated parameter
    Degenerate,
    #[error("viewing ray is parallel to the plane")]
    /// viewing ray is parallel to the plane
    RayParallelToPlane,
    #[error("point is behind the camera")]
    /// point is behind the camera
    BehindCamera,
    #[error("{name} = {value} is outside [{min}, {max}]")]
    /// value outside its bounds
    OutOfBounds {
        /// name of the value
        name: String,
        /// rejected value
        value: f64,
        /// lower bound
        min: f64,
        /// upper bound
        max: f64,
    },
    #[error("unknown setting {0}")]
    /// no setting with this name
    UnknownSetting(String),
    #[error("setting {0} is read only")]
    /// setting is derived and cannot be written
    ReadOnlySetting(String),
}

#[cfg(feature = "serde-serialize")]
impl std::convert::From<serde_yaml::Error> for Error {
    #[inline]
    fn from(_orig: serde_yaml::Error) -> Self {
        Error::YamlParseError
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
