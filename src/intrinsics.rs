//! Pinhole intrinsics with a single radial distortion coefficient.

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::{
    allocator::Allocator,
    base::storage::{Owned, Storage},
    convert, one, zero, DefaultAllocator, Dim, OMatrix, RealField, U1, U2, U3,
};

use cam_geom::{
    coordinate_system::CameraFrame, ray_bundle_types::SharedOriginRayBundle, Bundle,
    IntrinsicParameters, Pixels, Points, RayBundle,
};

/// Number of Newton steps used to polish the closed-form distortion root.
const DISTORT_NEWTON_STEPS: usize = 2;

/// One-coefficient radial distortion on the normalized image plane.
///
/// With `r_d` the distorted and `r_u` the undistorted radius (both in units of
/// focal length), undistortion is the polynomial
///
/// ```text
/// r_u = r_d * (1 + k * r_d²)
/// ```
///
/// and distortion is its inverse, the unique real root of
/// `k r_d³ + r_d - r_u = 0` for `k >= 0`. The root is computed with Cardano's
/// formula and polished with Newton steps, so distorting and undistorting are
/// exact inverses up to rounding. A positive `k` models barrel distortion.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RadialDistortion<R: RealField>(R);

impl<R: RealField> RadialDistortion<R> {
    /// Construct from the coefficient `k`.
    #[inline]
    pub fn new(k: R) -> Self {
        RadialDistortion(k)
    }

    /// No distortion.
    #[inline]
    pub fn zero() -> Self {
        RadialDistortion(zero())
    }

    /// The coefficient `k`.
    #[inline]
    pub fn coefficient(&self) -> R {
        self.0.clone()
    }

    /// Return `true` if there is approximately zero distortion.
    pub fn is_linear(&self) -> bool {
        self.0.clone().abs() < convert(1e-16)
    }

    /// Undistorted radius for a distorted radius.
    #[inline]
    pub fn undistort_radius(&self, rd: R) -> R {
        let one: R = one();
        rd.clone() * (one + self.0.clone() * rd.clone() * rd)
    }

    /// Distorted radius for an undistorted radius.
    pub fn distort_radius(&self, ru: R) -> R {
        let k = self.0.clone();
        let one: R = one();
        let mut rd = if self.is_linear() || k.clone() < zero() {
            // pincushion has no closed form here; Newton from ru
            ru.clone()
        } else {
            // r³ + p r + q = 0 with p = 1/k, q = -ru/k
            let two: R = convert(2.0);
            let three: R = convert(3.0);
            let p = one.clone() / k.clone();
            let q = -ru.clone() / k.clone();
            let half_q = q / two;
            let disc = half_q.clone() * half_q.clone()
                + p.clone() * p.clone() * p.clone() / convert(27.0);
            let u = (-half_q + disc.sqrt()).cbrt();
            if u.clone().abs() < convert(1e-300) {
                ru.clone()
            } else {
                u.clone() - p / (three * u)
            }
        };
        for _ in 0..DISTORT_NEWTON_STEPS {
            let f = k.clone() * rd.clone() * rd.clone() * rd.clone() + rd.clone() - ru.clone();
            let df = convert::<f64, R>(3.0) * k.clone() * rd.clone() * rd.clone() + one.clone();
            rd = rd.clone() - f / df;
        }
        rd
    }

    /// Distort a point on the normalized image plane.
    pub fn distort_normalized(&self, x: R, y: R) -> (R, R) {
        let ru = (x.clone() * x.clone() + y.clone() * y.clone()).sqrt();
        if ru.clone() <= zero() || self.is_linear() {
            return (x, y);
        }
        let scale = self.distort_radius(ru.clone()) / ru;
        (x * scale.clone(), y * scale)
    }

    /// Undistort a point on the normalized image plane.
    pub fn undistort_normalized(&self, x: R, y: R) -> (R, R) {
        let one: R = one();
        let r2 = x.clone() * x.clone() + y.clone() * y.clone();
        let scale = one + self.0.clone() * r2;
        (x * scale.clone(), y * scale)
    }
}

/// Undistorted 2D pixel locations
///
/// Pixel coordinates a distortion-free pinhole camera with the same focal
/// length and principal point would have observed.
///
/// This is a newtype wrapping an `nalgebra::Matrix`.
pub struct UndistortedPixels<R: RealField, NPTS: Dim, STORAGE> {
    /// The undistorted pixel coordinates.
    pub data: nalgebra::Matrix<R, NPTS, U2, STORAGE>,
}

/// Intrinsic parameters of an overhead field camera.
///
/// A pinhole model with square pixels (a single focal length), a principal
/// point and [`RadialDistortion`]. Implements the
/// [`IntrinsicParameters`](cam_geom::IntrinsicParameters) trait so it can be
/// combined with `cam_geom::ExtrinsicParameters` into a `cam_geom::Camera`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FieldCameraIntrinsics<R: RealField> {
    focal_length: R,
    cx: R,
    cy: R,
    distortion: RadialDistortion<R>,
}

impl<R: RealField> FieldCameraIntrinsics<R> {
    /// Construct intrinsics from individual parameters.
    ///
    /// `focal_length` is in pixels, `(cx, cy)` is the principal point in pixel
    /// coordinates.
    pub fn from_params(focal_length: R, cx: R, cy: R, distortion: RadialDistortion<R>) -> Self {
        Self {
            focal_length,
            cx,
            cy,
            distortion,
        }
    }

    /// Focal length in pixels.
    #[inline]
    pub fn focal_length(&self) -> R {
        self.focal_length.clone()
    }

    /// Principal point `(cx, cy)` in pixels.
    #[inline]
    pub fn principal_point(&self) -> (R, R) {
        (self.cx.clone(), self.cy.clone())
    }

    /// The distortion model.
    #[inline]
    pub fn distortion(&self) -> &RadialDistortion<R> {
        &self.distortion
    }

    /// Distort a single undistorted pixel.
    pub fn distort_pixel(&self, u: R, v: R) -> (R, R) {
        let f = self.focal_length.clone();
        let x = (u - self.cx.clone()) / f.clone();
        let y = (v - self.cy.clone()) / f.clone();
        let (xd, yd) = self.distortion.distort_normalized(x, y);
        (
            xd * f.clone() + self.cx.clone(),
            yd * f + self.cy.clone(),
        )
    }

    /// Undistort a single observed pixel.
    pub fn undistort_pixel(&self, u: R, v: R) -> (R, R) {
        let f = self.focal_length.clone();
        let x = (u - self.cx.clone()) / f.clone();
        let y = (v - self.cy.clone()) / f.clone();
        let (xu, yu) = self.distortion.undistort_normalized(x, y);
        (
            xu * f.clone() + self.cx.clone(),
            yu * f + self.cy.clone(),
        )
    }

    /// Convert undistorted pixel coordinates to distorted pixel coordinates.
    pub fn distort<NPTS, IN>(
        &self,
        undistorted: &UndistortedPixels<R, NPTS, IN>,
    ) -> Pixels<R, NPTS, Owned<R, NPTS, U2>>
    where
        NPTS: Dim,
        IN: Storage<R, NPTS, U2>,
        DefaultAllocator: Allocator<NPTS, U2>,
    {
        let mut result = Pixels::new(OMatrix::zeros_generic(
            NPTS::from_usize(undistorted.data.nrows()),
            U2::from_usize(2),
        ));
        for i in 0..undistorted.data.nrows() {
            let (u, v) = self.distort_pixel(
                undistorted.data[(i, 0)].clone(),
                undistorted.data[(i, 1)].clone(),
            );
            result.data[(i, 0)] = u;
            result.data[(i, 1)] = v;
        }
        result
    }

    /// Convert distorted pixel coordinates to undistorted pixel coordinates.
    pub fn undistort<NPTS, IN>(
        &self,
        distorted: &Pixels<R, NPTS, IN>,
    ) -> UndistortedPixels<R, NPTS, Owned<R, NPTS, U2>>
    where
        NPTS: Dim,
        IN: Storage<R, NPTS, U2>,
        DefaultAllocator: Allocator<NPTS, U2>,
    {
        let mut result = UndistortedPixels {
            data: OMatrix::zeros_generic(
                NPTS::from_usize(distorted.data.nrows()),
                U2::from_usize(2),
            ),
        };
        for i in 0..distorted.data.nrows() {
            let (u, v) = self.undistort_pixel(
                distorted.data[(i, 0)].clone(),
                distorted.data[(i, 1)].clone(),
            );
            result.data[(i, 0)] = u;
            result.data[(i, 1)] = v;
        }
        result
    }

    /// Convert 3D coordinates in `CameraFrame` to undistorted pixel coords.
    ///
    /// Points at or behind the camera center produce non-finite coordinates.
    pub fn camera_to_undistorted_pixel<IN, NPTS>(
        &self,
        camera: &Points<CameraFrame, R, NPTS, IN>,
    ) -> UndistortedPixels<R, NPTS, Owned<R, NPTS, U2>>
    where
        IN: Storage<R, NPTS, U3>,
        NPTS: Dim,
        DefaultAllocator: Allocator<NPTS, U2>,
        DefaultAllocator: Allocator<U1, U2>,
    {
        let mut result = UndistortedPixels {
            data: OMatrix::zeros_generic(NPTS::from_usize(camera.data.nrows()), U2::from_usize(2)),
        };
        let f = self.focal_length.clone();
        for i in 0..camera.data.nrows() {
            let z = camera.data[(i, 2)].clone();
            result.data[(i, 0)] = f.clone() * camera.data[(i, 0)].clone() / z.clone() + self.cx.clone();
            result.data[(i, 1)] = f.clone() * camera.data[(i, 1)].clone() / z + self.cy.clone();
        }
        result
    }

    /// Convert undistorted pixel coordinates to 3D coords in the `CameraFrame`.
    ///
    /// The returned rays share the camera center as origin and have unit
    /// depth.
    pub fn undistorted_pixel_to_camera<IN, NPTS>(
        &self,
        undistorteds: &UndistortedPixels<R, NPTS, IN>,
    ) -> RayBundle<CameraFrame, SharedOriginRayBundle<R>, R, NPTS, Owned<R, NPTS, U3>>
    where
        IN: Storage<R, NPTS, U2>,
        NPTS: Dim,
        DefaultAllocator: Allocator<NPTS, U3>,
        DefaultAllocator: Allocator<U1, U2>,
    {
        let mut result = RayBundle::new_shared_zero_origin(OMatrix::zeros_generic(
            NPTS::from_usize(undistorteds.data.nrows()),
            U3::from_usize(3),
        ));
        let f = self.focal_length.clone();
        for i in 0..undistorteds.data.nrows() {
            result.data[(i, 0)] = (undistorteds.data[(i, 0)].clone() - self.cx.clone()) / f.clone();
            result.data[(i, 1)] = (undistorteds.data[(i, 1)].clone() - self.cy.clone()) / f.clone();
            result.data[(i, 2)] = one();
        }
        result
    }
}

impl<R: RealField> IntrinsicParameters<R> for FieldCameraIntrinsics<R> {
    type BundleType = SharedOriginRayBundle<R>;

    fn pixel_to_camera<IN, NPTS>(
        &self,
        pixels: &Pixels<R, NPTS, IN>,
    ) -> RayBundle<CameraFrame, Self::BundleType, R, NPTS, Owned<R, NPTS, U3>>
    where
        Self::BundleType: Bundle<R>,
        IN: Storage<R, NPTS, U2>,
        NPTS: Dim,
        DefaultAllocator: Allocator<NPTS, U2>,
        DefaultAllocator: Allocator<NPTS, U3>,
        DefaultAllocator: Allocator<U1, U2>,
    {
        let undistorted = self.undistort::<NPTS, IN>(pixels);
        self.undistorted_pixel_to_camera(&undistorted)
    }

    fn camera_to_pixel<IN, NPTS>(
        &self,
        camera: &Points<CameraFrame, R, NPTS, IN>,
    ) -> Pixels<R, NPTS, Owned<R, NPTS, U2>>
    where
        IN: Storage<R, NPTS, U3>,
        NPTS: Dim,
        DefaultAllocator: Allocator<NPTS, U2>,
    {
        let undistorted = self.camera_to_undistorted_pixel(camera);
        self.distort(&undistorted)
    }
}
