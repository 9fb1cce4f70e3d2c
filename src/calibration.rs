//! Least-squares estimation of the camera parameters.
//!
//! A calibration run minimizes the chi-square of weighted reprojection
//! residuals over a masked subset of the [`StateVector`] with a damped
//! Gauss-Newton (Levenberg-Marquardt) iteration. Runs are split into a pure
//! [`CameraParameters::solve`] that returns a [`CalibrationSolution`] and a
//! [`CameraParameters::commit`] that stores it, so a caller holding a lock can
//! keep readers running while the solver works.

use std::time::{Duration, Instant};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use bitflags::bitflags;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, SymmetricEigen, Vector2, Vector3};

use crate::camera::FieldCamera;
use crate::line_data::LSCalibrationData;
use crate::math::{canonical_vector_part, field_to_camera_rotation, yaw_about_optical_axis};
use crate::parameters::{CameraParameters, ParamIndex, ParamMask, StateVector};
use crate::{Error, Result};

/// Smallest eigenvalue ratio of the normalized normal matrix accepted as
/// non-singular.
const MIN_CONDITION: f64 = 1e-14;

const POSE: [ParamIndex; 6] = [
    ParamIndex::Q1,
    ParamIndex::Q2,
    ParamIndex::Q3,
    ParamIndex::Tx,
    ParamIndex::Ty,
    ParamIndex::Tz,
];

const QUATERNION: [ParamIndex; 3] = [ParamIndex::Q1, ParamIndex::Q2, ParamIndex::Q3];

bitflags! {
    /// Which calibration to run. Flags may be combined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CalibrationType: u32 {
        /// Pose from the four hand-placed landmarks; intrinsics held fixed.
        const FOUR_POINT_INITIAL = 1;
        /// All parameters, with line residuals folded in.
        const FULL_ESTIMATION = 2;
    }
}

impl ParamMask {
    /// Parameters estimated by `cal_type`.
    pub fn from_calibration_type(cal_type: CalibrationType) -> Self {
        let mut mask = ParamMask::empty();
        if cal_type.contains(CalibrationType::FOUR_POINT_INITIAL) {
            mask = mask.union(ParamMask::of(&POSE));
        }
        if cal_type.contains(CalibrationType::FULL_ESTIMATION) {
            mask = mask.union(ParamMask::all());
        }
        mask
    }
}

/// Iteration control of the solver.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SolverOptions {
    /// Maximum number of accepted steps.
    pub max_iterations: usize,
    /// Stop when an accepted step improves chi-square by less than this
    /// fraction.
    pub chisqr_tolerance: f64,
    /// Stop when chi-square falls below this value.
    pub chisqr_floor: f64,
    /// Initial damping factor.
    pub initial_damping: f64,
    /// Damping is multiplied by this after a rejected step.
    pub damping_increase: f64,
    /// Damping is divided by this after an accepted step.
    pub damping_decrease: f64,
    /// Damping above which the run ends as
    /// [`Stalled`](CalibrationOutcome::Stalled).
    pub max_damping: f64,
    /// Relative step of the finite differences.
    pub finite_difference_step: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            chisqr_tolerance: 1e-10,
            chisqr_floor: 1e-18,
            initial_damping: 1e-3,
            damping_increase: 10.0,
            damping_decrease: 10.0,
            max_damping: 1e12,
            finite_difference_step: 1e-6,
        }
    }
}

/// How a calibration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum CalibrationOutcome {
    /// The chi-square stopped improving.
    Converged,
    /// `convergence_timeout` elapsed; the best parameters so far are returned.
    Timeout,
    /// `max_iterations` steps were taken.
    IterationLimit,
    /// No step lowered the chi-square before the damping reached
    /// `max_damping`.
    Stalled,
}

/// Summary of a calibration run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CalibrationReport {
    /// How the run ended.
    pub outcome: CalibrationOutcome,
    /// Number of accepted steps.
    pub iterations: usize,
    /// Chi-square of the parameters the run started from.
    pub initial_chisqr: f64,
    /// Chi-square of the returned parameters.
    pub final_chisqr: f64,
    /// Number of residuals.
    pub residuals: usize,
    /// Number of estimated parameters.
    pub parameters: usize,
}

impl CalibrationReport {
    /// `true` if `convergence_timeout` cut the run short.
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.outcome == CalibrationOutcome::Timeout
    }
}

/// Progress of a calibration session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum CalibrationState {
    /// Nothing has been estimated since the last reset.
    #[default]
    Uninitialized,
    /// The pose was estimated from the four landmarks.
    CoarseCalibrated,
    /// All parameters were refined using line data.
    Refined,
}

/// Result of [`CameraParameters::solve`], to be stored with
/// [`CameraParameters::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSolution {
    /// The estimated parameters. Entries outside `mask` are unchanged.
    pub state: StateVector,
    /// The estimated subset.
    pub mask: ParamMask,
    /// Whether line residuals took part.
    pub used_lines: bool,
    /// Run summary.
    pub report: CalibrationReport,
}

/// Observations and weights for one run.
struct Observations<'a> {
    field_points: &'a [Vector3<f64>],
    image_points: &'a [Vector2<f64>],
    lines: &'a [LSCalibrationData],
    cov_corner: (f64, f64),
    cov_ls: (f64, f64),
}

impl Observations<'_> {
    fn residual_count(&self) -> usize {
        2 * self.field_points.len()
            + self
                .lines
                .iter()
                .map(LSCalibrationData::inlier_count)
                .sum::<usize>()
    }

    fn residuals(&self, p: &StateVector) -> Result<DVector<f64>> {
        let cam = FieldCamera::from_state(p);
        let (sx, sy) = (self.cov_corner.0.sqrt(), self.cov_corner.1.sqrt());
        let mut out = Vec::with_capacity(self.residual_count());
        for (pf, pi) in self.field_points.iter().zip(self.image_points.iter()) {
            let proj = cam.field2image(pf)?;
            out.push((pi.x - proj.x) / sx);
            out.push((pi.y - proj.y) / sy);
        }
        for line in self.lines {
            line.residuals(&cam, self.cov_ls.0, self.cov_ls.1, &mut out)?;
        }
        if out.iter().any(|r| !r.is_finite()) {
            return Err(Error::Degenerate);
        }
        Ok(DVector::from_vec(out))
    }

    /// Chi-square, `+inf` for parameters that cannot see every observation.
    fn chisqr(&self, p: &StateVector) -> f64 {
        match self.residuals(p) {
            Ok(r) => r.norm_squared(),
            Err(_) => f64::INFINITY,
        }
    }

    /// Finite-difference Jacobian over the masked parameters.
    ///
    /// Central differences inside the bounds, one-sided where a central step
    /// would leave them.
    fn jacobian(&self, p: &StateVector, mask: &ParamMask, rel_step: f64) -> Result<DMatrix<f64>> {
        let free: Vec<ParamIndex> = mask.iter().collect();
        let mut jac = DMatrix::zeros(self.residual_count(), free.len());
        for (col, param) in free.iter().enumerate() {
            let i = *param as usize;
            let bounds = param.bounds();
            let h = rel_step * p[i].abs().max(1.0);
            let (lo, hi) = match (bounds.contains(p[i] - h), bounds.contains(p[i] + h)) {
                (true, true) => (p[i] - h, p[i] + h),
                (false, true) => (p[i], p[i] + h),
                (true, false) => (p[i] - h, p[i]),
                (false, false) => return Err(Error::Degenerate),
            };
            let mut xp = *p;
            let mut xm = *p;
            xp[i] = hi;
            xm[i] = lo;
            let (rp, rm) = match (self.residuals(&xp), self.residuals(&xm)) {
                (Ok(rp), Ok(rm)) => (rp, rm),
                _ => return Err(Error::Degenerate),
            };
            jac.set_column(col, &((rp - rm) / (hi - lo)));
        }
        Ok(jac)
    }
}

/// Fail if some direction of the parameter space does not change the
/// residuals.
fn check_conditioning(jac: &DMatrix<f64>) -> Result<()> {
    let mut normalized = jac.clone();
    for mut col in normalized.column_iter_mut() {
        let n = col.norm();
        if !(n > f64::EPSILON) {
            return Err(Error::Degenerate);
        }
        col /= n;
    }
    let jtj = normalized.transpose() * &normalized;
    let eigen = SymmetricEigen::new(jtj);
    let max = eigen.eigenvalues.max();
    let min = eigen.eigenvalues.min();
    if !(max > 0.0) || min / max < MIN_CONDITION {
        return Err(Error::Degenerate);
    }
    Ok(())
}

/// Solve `(JᵀJ + λ diag(JᵀJ)) δ = Jᵀr`. Falls back to LU when the damped
/// matrix is not numerically positive definite.
fn damped_step(jtj: &DMatrix<f64>, g: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
    let mut a = jtj.clone();
    for k in 0..a.nrows() {
        a[(k, k)] += lambda * jtj[(k, k)].max(f64::EPSILON);
    }
    match a.clone().cholesky() {
        Some(c) => Some(c.solve(g)),
        None => a.lu().solve(g),
    }
}

/// Clamp masked entries into their bounds and keep `q1² + q2² + q3² <= 1` by
/// shrinking the masked quaternion components.
fn project_to_bounds(p: &mut StateVector, mask: &ParamMask) {
    for param in mask.iter() {
        p[param as usize] = param.bounds().clamp(p[param as usize]);
    }
    let (mut fixed, mut free) = (0.0, 0.0);
    for q in QUATERNION {
        let v = p[q as usize];
        if mask.contains(q) {
            free += v * v;
        } else {
            fixed += v * v;
        }
    }
    if fixed + free > 1.0 && free > 0.0 {
        let scale = ((1.0 - fixed).max(0.0) / free).sqrt();
        for q in QUATERNION {
            if mask.contains(q) {
                p[q as usize] *= scale;
            }
        }
    }
}

impl CameraParameters {
    fn observations<'a>(
        &'a self,
        field_points: &'a [Vector3<f64>],
        image_points: &'a [Vector2<f64>],
        use_lines: bool,
    ) -> Result<Observations<'a>> {
        if field_points.len() != image_points.len() {
            return Err(Error::InvalidInput);
        }
        let info = &self.additional_calibration_information;
        Ok(Observations {
            field_points,
            image_points,
            lines: if use_lines {
                self.line_segment_data.as_slice()
            } else {
                &[]
            },
            cov_corner: (info.cov_corner_x.get(), info.cov_corner_y.get()),
            cov_ls: (info.cov_ls_x.get(), info.cov_ls_y.get()),
        })
    }

    /// Chi-square of the residuals `cal_type` uses, for parameter vector `p`.
    ///
    /// Parameters that put an observation behind the camera score `+inf`.
    pub fn calc_chisqr(
        &self,
        field_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        p: &StateVector,
        cal_type: CalibrationType,
    ) -> Result<f64> {
        let use_lines = cal_type.contains(CalibrationType::FULL_ESTIMATION);
        let obs = self.observations(field_points, image_points, use_lines)?;
        Ok(obs.chisqr(p))
    }

    /// Estimate the parameters selected by `cal_type` without storing them.
    pub fn solve(
        &self,
        field_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        cal_type: CalibrationType,
    ) -> Result<CalibrationSolution> {
        self.solve_subset(
            field_points,
            image_points,
            ParamMask::from_calibration_type(cal_type),
            cal_type.contains(CalibrationType::FULL_ESTIMATION),
        )
    }

    /// Estimate an arbitrary parameter subset without storing it.
    ///
    /// Returns `Err(Error::Underdetermined)` before doing any work if there are
    /// fewer residuals than estimated parameters.
    pub fn solve_subset(
        &self,
        field_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        mask: ParamMask,
        use_lines: bool,
    ) -> Result<CalibrationSolution> {
        if mask.is_empty() {
            return Err(Error::InvalidInput);
        }
        let obs = self.observations(field_points, image_points, use_lines)?;
        let n_res = obs.residual_count();
        let n_par = mask.count();
        if n_res < n_par {
            return Err(Error::Underdetermined {
                residuals: n_res,
                parameters: n_par,
            });
        }

        let opts = &self.solver_options;
        let timeout = Duration::try_from_secs_f64(
            self.additional_calibration_information
                .convergence_timeout
                .get(),
        )
        .unwrap_or(Duration::ZERO);
        let start = Instant::now();

        let mut x = *self.state_vector();
        let initial_chisqr = obs.chisqr(&x);
        let finish = |state, outcome, iterations, final_chisqr| CalibrationSolution {
            state,
            mask,
            used_lines: use_lines,
            report: CalibrationReport {
                outcome,
                iterations,
                initial_chisqr,
                final_chisqr,
                residuals: n_res,
                parameters: n_par,
            },
        };

        if start.elapsed() >= timeout {
            warn!("calibration timed out before the first iteration");
            return Ok(finish(x, CalibrationOutcome::Timeout, 0, initial_chisqr));
        }

        let mut chi = initial_chisqr;
        if let Some(seed) = self.four_point_seed(field_points, image_points, &mask) {
            let seed_chi = obs.chisqr(&seed);
            if seed_chi < chi {
                debug!("closed-form seed: chi2 {:e} -> {:e}", chi, seed_chi);
                x = seed;
                chi = seed_chi;
            }
        }
        if !chi.is_finite() {
            return Err(Error::BehindCamera);
        }

        let mut lambda = opts.initial_damping;
        let mut iterations = 0;
        let outcome = 'outer: loop {
            if start.elapsed() >= timeout {
                warn!(
                    "calibration timed out after {} iterations, chi2 {:e}",
                    iterations, chi
                );
                break CalibrationOutcome::Timeout;
            }
            if chi < opts.chisqr_floor {
                break CalibrationOutcome::Converged;
            }
            if iterations >= opts.max_iterations {
                break CalibrationOutcome::IterationLimit;
            }

            let r = obs.residuals(&x)?;
            let jac = obs.jacobian(&x, &mask, opts.finite_difference_step)?;
            if iterations == 0 {
                if let Err(e) = check_conditioning(&jac) {
                    warn!("normal matrix is singular for the selected parameters");
                    return Err(e);
                }
            }
            let jtj = jac.transpose() * &jac;
            let g = jac.transpose() * &r;

            loop {
                if let Some(step) = damped_step(&jtj, &g, lambda) {
                    let mut candidate = x;
                    for (k, param) in mask.iter().enumerate() {
                        candidate[param as usize] -= step[k];
                    }
                    project_to_bounds(&mut candidate, &mask);
                    let candidate_chi = obs.chisqr(&candidate);
                    if candidate_chi < chi {
                        let improvement = (chi - candidate_chi) / chi;
                        x = candidate;
                        chi = candidate_chi;
                        iterations += 1;
                        lambda = (lambda / opts.damping_decrease).max(f64::EPSILON);
                        debug!(
                            "iteration {}: chi2 {:e}, damping {:e}",
                            iterations, chi, lambda
                        );
                        if improvement < opts.chisqr_tolerance {
                            break 'outer CalibrationOutcome::Converged;
                        }
                        break;
                    }
                }
                lambda *= opts.damping_increase;
                if lambda > opts.max_damping {
                    warn!(
                        "damping saturated after {} iterations, chi2 {:e}",
                        iterations, chi
                    );
                    break 'outer CalibrationOutcome::Stalled;
                }
            }
        };

        Ok(finish(x, outcome, iterations, chi))
    }

    /// Straight-down pose placing the landmark centroid under the image
    /// centroid at the current height, with the yaw taken from the direction
    /// between the first two landmarks.
    fn four_point_seed(
        &self,
        field_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        mask: &ParamMask,
    ) -> Option<StateVector> {
        if field_points.len() < 2 || !POSE.iter().all(|p| mask.contains(*p)) {
            return None;
        }
        let cam = self.camera();
        let undistorted: Vec<Vector2<f64>> = image_points
            .iter()
            .map(|p| cam.undistort_image_point(p))
            .collect();

        let v = field_points[1] - field_points[0];
        let w = undistorted[1] - undistorted[0];
        if v.xy().norm() < f64::EPSILON || w.norm() < f64::EPSILON {
            return None;
        }
        let yaw = w.y.atan2(w.x) - (-v.y).atan2(v.x);
        let free = yaw_about_optical_axis(yaw);
        let q = canonical_vector_part(&free);

        let n = field_points.len() as f64;
        let c = field_points.iter().sum::<Vector3<f64>>() / n;
        let m = undistorted.iter().sum::<Vector2<f64>>() / n;
        let intr = cam.intrinsics();
        let (cx, cy) = intr.principal_point();
        let f = intr.focal_length();
        let height = self.get(ParamIndex::Tz);
        let ray = Vector3::new((m.x - cx) / f, (m.y - cy) / f, 1.0);
        let rotated = field_to_camera_rotation(&free) * c;
        let t = ray * height - rotated;

        let mut seed = *self.state_vector();
        seed[ParamIndex::Q1 as usize] = q.x;
        seed[ParamIndex::Q2 as usize] = q.y;
        seed[ParamIndex::Q3 as usize] = q.z;
        seed[ParamIndex::Tx as usize] = t.x;
        seed[ParamIndex::Ty as usize] = t.y;
        seed[ParamIndex::Tz as usize] = t.z;
        project_to_bounds(&mut seed, mask);
        Some(seed)
    }

    /// Store a solution computed by [`solve`](Self::solve).
    ///
    /// The session state advances when the run lowered the chi-square or
    /// converged. A run that stalled or timed out without progress leaves it
    /// unchanged.
    pub fn commit(&mut self, solution: &CalibrationSolution) {
        let report = &solution.report;
        let advanced = report.final_chisqr < report.initial_chisqr
            || report.outcome == CalibrationOutcome::Converged;
        let next = if !advanced {
            self.calibration_state()
        } else if solution.used_lines {
            CalibrationState::Refined
        } else {
            CalibrationState::CoarseCalibrated
        };
        let mut state = *self.state_vector();
        for p in solution.mask.iter() {
            state[p as usize] = solution.state[p as usize];
        }
        self.commit_state(state, solution.mask, next);
        info!(
            "calibration {:?} after {} iterations: chi2 {:e} -> {:e} ({:?})",
            report.outcome, report.iterations, report.initial_chisqr, report.final_chisqr, next
        );
    }

    /// Estimate the parameters selected by `cal_type` and store them.
    ///
    /// On error nothing is changed. A timeout is not an error: the best
    /// parameters found are stored and the report says so.
    pub fn calibrate(
        &mut self,
        field_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        cal_type: CalibrationType,
    ) -> Result<CalibrationReport> {
        let solution = self.solve(field_points, image_points, cal_type)?;
        self.commit(&solution);
        Ok(solution.report)
    }

    /// Estimate and store an arbitrary parameter subset.
    pub fn calibrate_subset(
        &mut self,
        field_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        mask: ParamMask,
        use_lines: bool,
    ) -> Result<CalibrationReport> {
        let solution = self.solve_subset(field_points, image_points, mask, use_lines)?;
        self.commit(&solution);
        Ok(solution.report)
    }

    /// The four field landmarks and their hand-placed image positions.
    pub fn landmark_correspondences(&self) -> ([Vector3<f64>; 4], [Vector2<f64>; 4]) {
        (
            self.field().landmarks(),
            self.additional_calibration_information
                .landmark_image_points(),
        )
    }

    /// Calibrate against the four landmarks in
    /// [`AdditionalCalibrationInformation`](crate::AdditionalCalibrationInformation)
    /// plus, for full estimation, the stored line data.
    pub fn do_calibration(&mut self, cal_type: CalibrationType) -> Result<CalibrationReport> {
        let (field_points, image_points) = self.landmark_correspondences();
        self.calibrate(&field_points, &image_points, cal_type)
    }
}
