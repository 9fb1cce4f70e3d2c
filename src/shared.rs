//! Thread-safe handle for using the projection while calibrating.

use std::sync::Arc;

use nalgebra::{Vector2, Vector3};
use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::calibration::{CalibrationReport, CalibrationType};
use crate::parameters::CameraParameters;
use crate::Result;

/// Shared ownership of [`CameraParameters`] with a single writer.
///
/// Projections take a read lock. A calibration run solves under an upgradable
/// read lock, so projections keep working, and only takes the write lock to
/// store the result. Readers never see a partially updated parameter vector.
#[derive(Debug, Clone)]
pub struct SharedCameraParameters {
    inner: Arc<RwLock<CameraParameters>>,
}

impl SharedCameraParameters {
    /// Wrap `params`.
    pub fn new(params: CameraParameters) -> Self {
        Self {
            inner: Arc::new(RwLock::new(params)),
        }
    }

    /// Read access to the parameters.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, CameraParameters> {
        self.inner.read()
    }

    /// Exclusive access, for settings changes and line data updates.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, CameraParameters> {
        self.inner.write()
    }

    /// Project a field point under the current parameters.
    pub fn field2image(&self, p_field: &Vector3<f64>) -> Result<Vector2<f64>> {
        self.inner.read().field2image(p_field)
    }

    /// Back-project an image point under the current parameters.
    pub fn image2field(&self, p_image: &Vector2<f64>, z: f64) -> Result<Vector3<f64>> {
        self.inner.read().image2field(p_image, z)
    }

    /// Calibrate and store the result atomically.
    pub fn calibrate(
        &self,
        field_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        cal_type: CalibrationType,
    ) -> Result<CalibrationReport> {
        let guard = self.inner.upgradable_read();
        let solution = guard.solve(field_points, image_points, cal_type)?;
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        guard.commit(&solution);
        Ok(solution.report)
    }

    /// Calibrate against the stored landmarks and line data.
    pub fn do_calibration(&self, cal_type: CalibrationType) -> Result<CalibrationReport> {
        let guard = self.inner.upgradable_read();
        let (field_points, image_points) = guard.landmark_correspondences();
        let solution = guard.solve(&field_points, &image_points, cal_type)?;
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        guard.commit(&solution);
        Ok(solution.report)
    }

    /// Restore the reset state.
    pub fn reset(&self) {
        self.inner.write().reset();
    }
}

impl From<CameraParameters> for SharedCameraParameters {
    fn from(params: CameraParameters) -> Self {
        Self::new(params)
    }
}
