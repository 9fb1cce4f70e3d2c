//! Image observations of straight field lines.

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::{Vector2, Vector3};

use crate::camera::FieldCamera;
use crate::field::FieldLine;
use crate::{Error, Result};

/// Below this length (in pixels) a projected line has no usable direction.
const MIN_PROJECTED_LENGTH: f64 = 1e-9;

/// Horizontal lines whose projected `|dx|` is below this fraction of their
/// length fall back to the perpendicular distance.
const MIN_HORIZONTAL_RUN: f64 = 1e-6;

/// An image point observed on a field line.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct LinePoint {
    /// Observed (distorted) pixel position.
    pub image: Vector2<f64>,
    /// Only inliers contribute residuals.
    pub inlier: bool,
}

/// One point of the band searched around a projected field line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorridorSample {
    /// Projected (distorted) pixel position of the line sample.
    pub center: Vector2<f64>,
    /// Unit image-space normal of the projected line at `center`.
    pub normal: Vector2<f64>,
    /// Search half-width along `normal`, in pixels.
    pub half_width: f64,
}

/// A field line segment together with its image observations.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct LSCalibrationData {
    /// First endpoint in field coordinates.
    pub p1: Vector3<f64>,
    /// Second endpoint in field coordinates.
    pub p2: Vector3<f64>,
    /// Measure the error vertically rather than perpendicularly.
    pub horizontal: bool,
    /// Observed points, in detection order.
    pub pts_on_line: Vec<LinePoint>,
}

impl LSCalibrationData {
    /// An empty observation set for the segment `p1`–`p2`.
    pub fn new(p1: Vector3<f64>, p2: Vector3<f64>, horizontal: bool) -> Self {
        Self {
            p1,
            p2,
            horizontal,
            pts_on_line: Vec::new(),
        }
    }

    /// An empty observation set for a known field line.
    pub fn from_field_line(line: &FieldLine) -> Self {
        Self::new(line.p1, line.p2, line.horizontal)
    }

    /// Append an observation.
    pub fn add_point(&mut self, image: Vector2<f64>, inlier: bool) {
        self.pts_on_line.push(LinePoint { image, inlier });
    }

    /// Observations flagged as inliers.
    pub fn inliers(&self) -> impl Iterator<Item = &LinePoint> + '_ {
        self.pts_on_line.iter().filter(|p| p.inlier)
    }

    /// Number of inlier observations, which is also the number of residuals
    /// this segment contributes.
    pub fn inlier_count(&self) -> usize {
        self.inliers().count()
    }

    /// Sample the projected line for the feature detector.
    ///
    /// `samples` points are spread evenly from `p1` to `p2`; samples behind the
    /// camera are skipped.
    pub fn line_search_corridor(
        &self,
        camera: &FieldCamera,
        samples: usize,
        half_width: f64,
    ) -> Result<Vec<CorridorSample>> {
        if samples < 2 || !(half_width > 0.0) {
            return Err(Error::InvalidInput);
        }
        let dir = self.p2 - self.p1;
        let eps = 1e-3;
        let mut out = Vec::with_capacity(samples);
        for i in 0..samples {
            let t = i as f64 / (samples - 1) as f64;
            let p = self.p1 + dir * t;
            let (a, b) = match (
                camera.field2image(&(p - dir * eps)),
                camera.field2image(&(p + dir * eps)),
            ) {
                (Ok(a), Ok(b)) => (a, b),
                _ => continue,
            };
            let center = match camera.field2image(&p) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let tangent = b - a;
            let len = tangent.norm();
            if len < MIN_PROJECTED_LENGTH {
                continue;
            }
            out.push(CorridorSample {
                center,
                normal: Vector2::new(-tangent.y, tangent.x) / len,
                half_width,
            });
        }
        Ok(out)
    }

    /// Re-flag every observation: inlier iff its distance to the projected
    /// line is at most `max_distance` pixels. Returns the inlier count.
    pub fn flag_outliers(&mut self, camera: &FieldCamera, max_distance: f64) -> Result<usize> {
        let (a, n) = self.projected_line(camera)?;
        let mut count = 0;
        for pt in self.pts_on_line.iter_mut() {
            let u = camera.undistort_image_point(&pt.image);
            pt.inlier = n.dot(&(u - a)).abs() <= max_distance;
            if pt.inlier {
                count += 1;
            }
        }
        log::debug!(
            "{} of {} line points within {} px",
            count,
            self.pts_on_line.len(),
            max_distance
        );
        Ok(count)
    }

    /// Append one weighted residual per inlier to `out`.
    ///
    /// Distances are measured in undistorted pixel space, where the projected
    /// field line is straight. Horizontal lines use the vertical distance
    /// weighted by `cov_y`, other lines the perpendicular distance weighted by
    /// the covariance along the line normal.
    pub fn residuals(
        &self,
        camera: &FieldCamera,
        cov_x: f64,
        cov_y: f64,
        out: &mut Vec<f64>,
    ) -> Result<()> {
        if self.inlier_count() == 0 {
            return Ok(());
        }
        let a = camera.field2undistorted(&self.p1)?;
        let b = camera.field2undistorted(&self.p2)?;
        let d = b - a;
        let len = d.norm();
        if len < MIN_PROJECTED_LENGTH {
            return Err(Error::Degenerate);
        }

        if self.horizontal && d.x.abs() > MIN_HORIZONTAL_RUN * len {
            let slope = d.y / d.x;
            let sigma = cov_y.sqrt();
            for pt in self.inliers() {
                let u = camera.undistort_image_point(&pt.image);
                let y_line = a.y + (u.x - a.x) * slope;
                out.push((u.y - y_line) / sigma);
            }
        } else {
            let n = Vector2::new(-d.y, d.x) / len;
            let sigma = (n.x * n.x * cov_x + n.y * n.y * cov_y).sqrt();
            for pt in self.inliers() {
                let u = camera.undistort_image_point(&pt.image);
                out.push(n.dot(&(u - a)) / sigma);
            }
        }
        Ok(())
    }

    /// Point on and unit normal of the projected line, in undistorted pixels.
    fn projected_line(&self, camera: &FieldCamera) -> Result<(Vector2<f64>, Vector2<f64>)> {
        let a = camera.field2undistorted(&self.p1)?;
        let b = camera.field2undistorted(&self.p2)?;
        let d = b - a;
        let len = d.norm();
        if len < MIN_PROJECTED_LENGTH {
            return Err(Error::Degenerate);
        }
        Ok((a, Vector2::new(-d.y, d.x) / len))
    }
}
