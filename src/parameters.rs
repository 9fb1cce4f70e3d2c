//! The calibration state of one camera.

use std::sync::Arc;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::{SVector, UnitQuaternion, Vector2, Vector3};

use crate::bounded::{BoundedScalar, Bounds, Setting};
use crate::calibration::{CalibrationState, SolverOptions};
use crate::camera::FieldCamera;
use crate::field::CalibrationField;
use crate::line_data::{CorridorSample, LSCalibrationData};
use crate::math::{derived_q0, field_to_camera_rotation, quaternion_from_vector_part};
use crate::{Error, Result};

/// Number of free scalars in the parameter vector.
pub const STATE_SPACE_DIMENSION: usize = 10;

/// The free parameters, in state vector order.
pub type StateVector = SVector<f64, STATE_SPACE_DIMENSION>;

/// Index of a free parameter in the [`StateVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum ParamIndex {
    /// Focal length in pixels.
    FocalLength = 0,
    /// Principal point, x coordinate in pixels.
    PrincipalPointX,
    /// Principal point, y coordinate in pixels.
    PrincipalPointY,
    /// Radial distortion coefficient.
    Distortion,
    /// Quaternion vector part, first component.
    Q1,
    /// Quaternion vector part, second component.
    Q2,
    /// Quaternion vector part, third component.
    Q3,
    /// Translation along camera x (mm).
    Tx,
    /// Translation along camera y (mm).
    Ty,
    /// Translation along camera z; the camera height (mm).
    Tz,
}

impl ParamIndex {
    /// All parameters in state vector order.
    pub const ALL: [ParamIndex; STATE_SPACE_DIMENSION] = [
        ParamIndex::FocalLength,
        ParamIndex::PrincipalPointX,
        ParamIndex::PrincipalPointY,
        ParamIndex::Distortion,
        ParamIndex::Q1,
        ParamIndex::Q2,
        ParamIndex::Q3,
        ParamIndex::Tx,
        ParamIndex::Ty,
        ParamIndex::Tz,
    ];

    /// Settings name of the parameter.
    pub fn name(self) -> &'static str {
        match self {
            ParamIndex::FocalLength => "focal_length",
            ParamIndex::PrincipalPointX => "principal_point_x",
            ParamIndex::PrincipalPointY => "principal_point_y",
            ParamIndex::Distortion => "distortion",
            ParamIndex::Q1 => "q1",
            ParamIndex::Q2 => "q2",
            ParamIndex::Q3 => "q3",
            ParamIndex::Tx => "tx",
            ParamIndex::Ty => "ty",
            ParamIndex::Tz => "tz",
        }
    }

    /// Look a parameter up by its settings name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    /// Admissible range of the parameter.
    pub fn bounds(self) -> Bounds {
        match self {
            ParamIndex::FocalLength => Bounds::new(10.0, 10_000.0),
            ParamIndex::PrincipalPointX | ParamIndex::PrincipalPointY => Bounds::new(0.0, 5_000.0),
            ParamIndex::Distortion => Bounds::new(0.0, 2.0),
            ParamIndex::Q1 | ParamIndex::Q2 | ParamIndex::Q3 => Bounds::new(-1.0, 1.0),
            ParamIndex::Tx | ParamIndex::Ty => Bounds::new(-20_000.0, 20_000.0),
            ParamIndex::Tz => Bounds::new(0.0, 20_000.0),
        }
    }

    /// Value used by [`CameraParameters::reset`] for the intrinsic
    /// parameters; extrinsics are seeded from
    /// [`AdditionalCalibrationInformation`].
    fn default_value(self) -> f64 {
        match self {
            ParamIndex::FocalLength => 500.0,
            ParamIndex::PrincipalPointX => 390.0,
            ParamIndex::PrincipalPointY => 290.0,
            _ => 0.0,
        }
    }

    #[inline]
    pub(crate) fn is_quaternion(self) -> bool {
        matches!(self, ParamIndex::Q1 | ParamIndex::Q2 | ParamIndex::Q3)
    }
}

/// A fixed-size mask over the free parameters.
///
/// Selects which parameters a calibration run may modify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamMask([bool; STATE_SPACE_DIMENSION]);

impl ParamMask {
    /// No parameter selected.
    #[inline]
    pub const fn empty() -> Self {
        ParamMask([false; STATE_SPACE_DIMENSION])
    }

    /// Every parameter selected.
    #[inline]
    pub const fn all() -> Self {
        ParamMask([true; STATE_SPACE_DIMENSION])
    }

    /// Mask selecting exactly `params`.
    pub fn of(params: &[ParamIndex]) -> Self {
        let mut mask = Self::empty();
        for p in params {
            mask.insert(*p);
        }
        mask
    }

    /// Select `p`.
    #[inline]
    pub fn insert(&mut self, p: ParamIndex) {
        self.0[p as usize] = true;
    }

    /// `true` if `p` is selected.
    #[inline]
    pub fn contains(&self, p: ParamIndex) -> bool {
        self.0[p as usize]
    }

    /// Union of two masks.
    pub fn union(self, other: Self) -> Self {
        let mut out = self;
        for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
            *a |= *b;
        }
        out
    }

    /// Number of selected parameters.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|b| **b).count()
    }

    /// `true` if nothing is selected.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Selected parameters in state vector order.
    pub fn iter(&self) -> impl Iterator<Item = ParamIndex> + '_ {
        ParamIndex::ALL.iter().copied().filter(move |p| self.contains(*p))
    }
}

/// Seeds and detection-assist values used by calibration.
///
/// The four image landmarks are the pixel positions of the field landmarks
/// returned by [`CalibrationField::landmarks`], usually placed by hand.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct AdditionalCalibrationInformation {
    /// Image x of the left corner.
    pub left_corner_image_x: BoundedScalar,
    /// Image y of the left corner.
    pub left_corner_image_y: BoundedScalar,
    /// Image x of the right corner.
    pub right_corner_image_x: BoundedScalar,
    /// Image y of the right corner.
    pub right_corner_image_y: BoundedScalar,
    /// Image x of the left end of the half-way line.
    pub left_centerline_image_x: BoundedScalar,
    /// Image y of the left end of the half-way line.
    pub left_centerline_image_y: BoundedScalar,
    /// Image x of the right end of the half-way line.
    pub right_centerline_image_x: BoundedScalar,
    /// Image y of the right end of the half-way line.
    pub right_centerline_image_y: BoundedScalar,
    /// Distortion coefficient restored by reset.
    pub initial_distortion: BoundedScalar,
    /// Camera height (mm) restored by reset.
    pub camera_height: BoundedScalar,
    /// Half-width in pixels of the band searched around a projected line.
    pub line_search_corridor_width: BoundedScalar,
    /// Wall-clock bound on one calibration run, in seconds.
    pub convergence_timeout: BoundedScalar,
    /// Variance (px²) of landmark x observations.
    pub cov_corner_x: BoundedScalar,
    /// Variance (px²) of landmark y observations.
    pub cov_corner_y: BoundedScalar,
    /// Variance (px²) of line point x observations.
    pub cov_ls_x: BoundedScalar,
    /// Variance (px²) of line point y observations.
    pub cov_ls_y: BoundedScalar,
}

impl Default for AdditionalCalibrationInformation {
    fn default() -> Self {
        const IMG: (f64, f64) = (0.0, 5_000.0);
        const COV: (f64, f64) = (1e-6, 1e6);
        Self {
            left_corner_image_x: BoundedScalar::new(700.0, IMG.0, IMG.1),
            left_corner_image_y: BoundedScalar::new(40.0, IMG.0, IMG.1),
            right_corner_image_x: BoundedScalar::new(700.0, IMG.0, IMG.1),
            right_corner_image_y: BoundedScalar::new(540.0, IMG.0, IMG.1),
            left_centerline_image_x: BoundedScalar::new(80.0, IMG.0, IMG.1),
            left_centerline_image_y: BoundedScalar::new(40.0, IMG.0, IMG.1),
            right_centerline_image_x: BoundedScalar::new(80.0, IMG.0, IMG.1),
            right_centerline_image_y: BoundedScalar::new(540.0, IMG.0, IMG.1),
            initial_distortion: BoundedScalar::new(0.0, 0.0, 2.0),
            camera_height: BoundedScalar::new(4_000.0, 0.0, 20_000.0),
            line_search_corridor_width: BoundedScalar::new(10.0, 1.0, 200.0),
            convergence_timeout: BoundedScalar::new(20.0, 0.0, 600.0),
            cov_corner_x: BoundedScalar::new(1.0, COV.0, COV.1),
            cov_corner_y: BoundedScalar::new(1.0, COV.0, COV.1),
            cov_ls_x: BoundedScalar::new(1.0, COV.0, COV.1),
            cov_ls_y: BoundedScalar::new(1.0, COV.0, COV.1),
        }
    }
}

impl AdditionalCalibrationInformation {
    fn scalars(&self) -> [(&'static str, &BoundedScalar); 16] {
        [
            ("left_corner_image_x", &self.left_corner_image_x),
            ("left_corner_image_y", &self.left_corner_image_y),
            ("right_corner_image_x", &self.right_corner_image_x),
            ("right_corner_image_y", &self.right_corner_image_y),
            ("left_centerline_image_x", &self.left_centerline_image_x),
            ("left_centerline_image_y", &self.left_centerline_image_y),
            ("right_centerline_image_x", &self.right_centerline_image_x),
            ("right_centerline_image_y", &self.right_centerline_image_y),
            ("initial_distortion", &self.initial_distortion),
            ("camera_height", &self.camera_height),
            ("line_search_corridor_width", &self.line_search_corridor_width),
            ("convergence_timeout", &self.convergence_timeout),
            ("cov_corner_x", &self.cov_corner_x),
            ("cov_corner_y", &self.cov_corner_y),
            ("cov_ls_x", &self.cov_ls_x),
            ("cov_ls_y", &self.cov_ls_y),
        ]
    }

    fn scalar_mut(&mut self, name: &str) -> Option<&mut BoundedScalar> {
        let s = match name {
            "left_corner_image_x" => &mut self.left_corner_image_x,
            "left_corner_image_y" => &mut self.left_corner_image_y,
            "right_corner_image_x" => &mut self.right_corner_image_x,
            "right_corner_image_y" => &mut self.right_corner_image_y,
            "left_centerline_image_x" => &mut self.left_centerline_image_x,
            "left_centerline_image_y" => &mut self.left_centerline_image_y,
            "right_centerline_image_x" => &mut self.right_centerline_image_x,
            "right_centerline_image_y" => &mut self.right_centerline_image_y,
            "initial_distortion" => &mut self.initial_distortion,
            "camera_height" => &mut self.camera_height,
            "line_search_corridor_width" => &mut self.line_search_corridor_width,
            "convergence_timeout" => &mut self.convergence_timeout,
            "cov_corner_x" => &mut self.cov_corner_x,
            "cov_corner_y" => &mut self.cov_corner_y,
            "cov_ls_x" => &mut self.cov_ls_x,
            "cov_ls_y" => &mut self.cov_ls_y,
            _ => return None,
        };
        Some(s)
    }

    /// Named view of every scalar.
    pub fn settings(&self) -> Vec<Setting> {
        self.scalars()
            .iter()
            .map(|(name, s)| Setting::from_scalar(name, s))
            .collect()
    }

    /// Write one scalar by name, rejecting out-of-range values.
    pub fn set_setting(&mut self, name: &str, value: f64) -> Result<()> {
        let scalar = self
            .scalar_mut(name)
            .ok_or_else(|| Error::UnknownSetting(name.to_string()))?;
        scalar.set(name, value)
    }

    /// The four landmark pixels in [`CalibrationField::landmarks`] order.
    pub fn landmark_image_points(&self) -> [Vector2<f64>; 4] {
        [
            Vector2::new(self.left_corner_image_x.get(), self.left_corner_image_y.get()),
            Vector2::new(self.right_corner_image_x.get(), self.right_corner_image_y.get()),
            Vector2::new(
                self.left_centerline_image_x.get(),
                self.left_centerline_image_y.get(),
            ),
            Vector2::new(
                self.right_centerline_image_x.get(),
                self.right_centerline_image_y.get(),
            ),
        ]
    }
}

/// Intrinsic and extrinsic parameters of a fixed overhead camera.
///
/// The state vector is the single source of truth; named accessors such as
/// [`focal_length`](Self::focal_length) are views of it and `q0` is derived
/// on every read.
///
/// Readers and the calibration writer must not overlap. Use
/// [`SharedCameraParameters`](crate::SharedCameraParameters) when the
/// projections are used from other threads.
#[derive(Debug, Clone)]
pub struct CameraParameters {
    state: StateVector,
    p_to_est: ParamMask,
    field: Arc<CalibrationField>,
    calibration_state: CalibrationState,
    /// Line segments used by full estimation.
    pub line_segment_data: Vec<LSCalibrationData>,
    /// Seeds and detection-assist values.
    pub additional_calibration_information: AdditionalCalibrationInformation,
    /// Iteration control of the solver.
    pub solver_options: SolverOptions,
}

impl CameraParameters {
    /// Create parameters for a camera looking at `field`, in the reset state.
    pub fn new(field: Arc<CalibrationField>) -> Self {
        let mut params = Self {
            state: StateVector::zeros(),
            p_to_est: ParamMask::empty(),
            field,
            calibration_state: CalibrationState::Uninitialized,
            line_segment_data: Vec::new(),
            additional_calibration_information: AdditionalCalibrationInformation::default(),
            solver_options: SolverOptions::default(),
        };
        params.reset();
        params
    }

    /// Restore default intrinsics and the seeded pose.
    ///
    /// The camera looks straight down from `camera_height` above the field
    /// origin with `initial_distortion`. The estimation mask and line data are
    /// cleared.
    pub fn reset(&mut self) {
        let info = &self.additional_calibration_information;
        for p in ParamIndex::ALL {
            self.state[p as usize] = p.default_value();
        }
        self.state[ParamIndex::Distortion as usize] = info.initial_distortion.get();
        self.state[ParamIndex::Tz as usize] = info.camera_height.get();
        self.p_to_est = ParamMask::empty();
        self.line_segment_data.clear();
        self.calibration_state = CalibrationState::Uninitialized;
        log::debug!("camera parameters reset");
    }

    /// The field layout these parameters are calibrated against.
    #[inline]
    pub fn field(&self) -> &CalibrationField {
        &self.field
    }

    /// Shared handle to the field layout.
    #[inline]
    pub fn field_arc(&self) -> &Arc<CalibrationField> {
        &self.field
    }

    /// The free parameters.
    #[inline]
    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    /// Replace the whole parameter vector.
    ///
    /// Every entry must be within its bounds and `q1² + q2² + q3² <= 1`;
    /// otherwise nothing is changed.
    pub fn set_state_vector(&mut self, state: StateVector) -> Result<()> {
        for p in ParamIndex::ALL {
            p.bounds().check(p.name(), state[p as usize])?;
        }
        check_quaternion_vector(&state)?;
        self.state = state;
        Ok(())
    }

    /// Current value of a free parameter.
    #[inline]
    pub fn get(&self, p: ParamIndex) -> f64 {
        self.state[p as usize]
    }

    /// Set one free parameter, rejecting out-of-range values.
    pub fn set(&mut self, p: ParamIndex, value: f64) -> Result<()> {
        p.bounds().check(p.name(), value)?;
        let mut candidate = self.state;
        candidate[p as usize] = value;
        if p.is_quaternion() {
            check_quaternion_vector(&candidate)?;
        }
        self.state = candidate;
        Ok(())
    }

    /// Parameters the last calibration was allowed to modify.
    #[inline]
    pub fn p_to_est(&self) -> ParamMask {
        self.p_to_est
    }

    /// Progress of the calibration session.
    #[inline]
    pub fn calibration_state(&self) -> CalibrationState {
        self.calibration_state
    }

    pub(crate) fn commit_state(
        &mut self,
        state: StateVector,
        mask: ParamMask,
        calibration_state: CalibrationState,
    ) {
        self.state = state;
        self.p_to_est = mask;
        self.calibration_state = calibration_state;
    }

    /// Focal length in pixels.
    #[inline]
    pub fn focal_length(&self) -> f64 {
        self.get(ParamIndex::FocalLength)
    }

    /// Principal point x in pixels.
    #[inline]
    pub fn principal_point_x(&self) -> f64 {
        self.get(ParamIndex::PrincipalPointX)
    }

    /// Principal point y in pixels.
    #[inline]
    pub fn principal_point_y(&self) -> f64 {
        self.get(ParamIndex::PrincipalPointY)
    }

    /// Radial distortion coefficient.
    #[inline]
    pub fn distortion(&self) -> f64 {
        self.get(ParamIndex::Distortion)
    }

    /// Scalar part of the free rotation, derived from `q1..q3`.
    #[inline]
    pub fn q0(&self) -> f64 {
        derived_q0(self.q1(), self.q2(), self.q3())
    }

    /// First vector component of the free rotation.
    #[inline]
    pub fn q1(&self) -> f64 {
        self.get(ParamIndex::Q1)
    }

    /// Second vector component of the free rotation.
    #[inline]
    pub fn q2(&self) -> f64 {
        self.get(ParamIndex::Q2)
    }

    /// Third vector component of the free rotation.
    #[inline]
    pub fn q3(&self) -> f64 {
        self.get(ParamIndex::Q3)
    }

    /// The free rotation, relative to the fixed 180° flip.
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        quaternion_from_vector_part(self.q1(), self.q2(), self.q3())
    }

    /// Rotation taking field coordinates into the camera frame.
    pub fn field_to_camera_rotation(&self) -> UnitQuaternion<f64> {
        field_to_camera_rotation(&self.quaternion())
    }

    /// Translation `(tx, ty, tz)`.
    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(
            self.get(ParamIndex::Tx),
            self.get(ParamIndex::Ty),
            self.get(ParamIndex::Tz),
        )
    }

    /// Camera model for the current parameters.
    #[inline]
    pub fn camera(&self) -> FieldCamera {
        FieldCamera::from_state(&self.state)
    }

    /// Project a field point into the image.
    pub fn field2image(&self, p_field: &Vector3<f64>) -> Result<Vector2<f64>> {
        self.camera().field2image(p_field)
    }

    /// Back-project an image point onto the field plane at height `z`.
    pub fn image2field(&self, p_image: &Vector2<f64>, z: f64) -> Result<Vector3<f64>> {
        self.camera().image2field(p_image, z)
    }

    /// Replace the line data with one empty entry per field line.
    pub fn init_line_segment_data(&mut self) {
        self.line_segment_data = self
            .field
            .field_lines()
            .iter()
            .map(LSCalibrationData::from_field_line)
            .collect();
    }

    /// Search corridors for every entry of `line_segment_data`, `samples` per
    /// line and `line_search_corridor_width` pixels to each side.
    pub fn line_search_corridors(&self, samples: usize) -> Result<Vec<Vec<CorridorSample>>> {
        let cam = self.camera();
        let half_width = self
            .additional_calibration_information
            .line_search_corridor_width
            .get();
        self.line_segment_data
            .iter()
            .map(|line| line.line_search_corridor(&cam, samples, half_width))
            .collect()
    }

    /// Re-flag the line observations against the current parameters. Points
    /// farther than `line_search_corridor_width` from their projected line
    /// become outliers. Returns the total inlier count.
    pub fn flag_line_outliers(&mut self) -> Result<usize> {
        let cam = self.camera();
        let max_distance = self
            .additional_calibration_information
            .line_search_corridor_width
            .get();
        let mut count = 0;
        for line in self.line_segment_data.iter_mut() {
            count += line.flag_outliers(&cam, max_distance)?;
        }
        Ok(count)
    }

    /// Named view of the free parameters plus the derived `q0`.
    pub fn settings(&self) -> Vec<Setting> {
        let mut out: Vec<Setting> = ParamIndex::ALL
            .iter()
            .map(|p| {
                let b = p.bounds();
                Setting {
                    name: p.name(),
                    value: self.get(*p),
                    min: b.min,
                    max: b.max,
                    writable: true,
                }
            })
            .collect();
        out.insert(
            ParamIndex::Q1 as usize,
            Setting {
                name: "q0",
                value: self.q0(),
                min: 0.0,
                max: 1.0,
                writable: false,
            },
        );
        out
    }

    /// Write one parameter by settings name.
    pub fn set_setting(&mut self, name: &str, value: f64) -> Result<()> {
        if name == "q0" {
            return Err(Error::ReadOnlySetting(name.to_string()));
        }
        let p = ParamIndex::from_name(name).ok_or_else(|| Error::UnknownSetting(name.to_string()))?;
        self.set(p, value)
    }
}

fn check_quaternion_vector(state: &StateVector) -> Result<()> {
    let v = Vector3::new(
        state[ParamIndex::Q1 as usize],
        state[ParamIndex::Q2 as usize],
        state[ParamIndex::Q3 as usize],
    );
    let sq = v.norm_squared();
    if sq > 1.0 {
        return Err(Error::OutOfBounds {
            name: "q1² + q2² + q3²".to_string(),
            value: sq,
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}
