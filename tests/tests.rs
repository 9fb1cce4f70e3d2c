use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use field_camera_calib::math::{canonical_vector_part, field_to_camera_rotation};
use field_camera_calib::*;

fn field() -> Arc<CalibrationField> {
    Arc::new(CalibrationField::default())
}

/// Parameters of a camera above the half field with a slight tilt.
fn truth(field: &Arc<CalibrationField>) -> CameraParameters {
    let mut p = CameraParameters::new(field.clone());
    let free = UnitQuaternion::from_euler_angles(0.05, -0.04, 0.2);
    let v = canonical_vector_part(&free);
    let center = Vector3::new(1500.0, 0.0, 5000.0);
    let t = -(field_to_camera_rotation(&free) * center);
    p.set(ParamIndex::Q1, v.x).unwrap();
    p.set(ParamIndex::Q2, v.y).unwrap();
    p.set(ParamIndex::Q3, v.z).unwrap();
    p.set(ParamIndex::Tx, t.x).unwrap();
    p.set(ParamIndex::Ty, t.y).unwrap();
    p.set(ParamIndex::Tz, t.z).unwrap();
    p
}

/// `truth` with a longer lens and barrel distortion.
fn lens_truth(field: &Arc<CalibrationField>) -> CameraParameters {
    let mut p = truth(field);
    p.set(ParamIndex::FocalLength, 520.0).unwrap();
    p.set(ParamIndex::Distortion, 0.12).unwrap();
    p
}

fn set_landmark_images(params: &mut CameraParameters, image: &[Vector2<f64>]) {
    let names = [
        "left_corner_image",
        "right_corner_image",
        "left_centerline_image",
        "right_centerline_image",
    ];
    for (name, px) in names.iter().zip(image.iter()) {
        let info = &mut params.additional_calibration_information;
        info.set_setting(&format!("{}_x", name), px.x).unwrap();
        info.set_setting(&format!("{}_y", name), px.y).unwrap();
    }
}

fn project_all(params: &CameraParameters, points: &[Vector3<f64>]) -> Vec<Vector2<f64>> {
    points
        .iter()
        .map(|p| params.field2image(p).unwrap())
        .collect()
}

/// Line data observed by `camera`, `per_line` points per field line.
fn observed_lines(camera: &CameraParameters, per_line: usize) -> Vec<LSCalibrationData> {
    camera
        .field()
        .field_lines()
        .iter()
        .map(|line| {
            let mut data = LSCalibrationData::from_field_line(line);
            for i in 1..=per_line {
                let t = i as f64 / (per_line + 1) as f64;
                let p = line.p1 + (line.p2 - line.p1) * t;
                data.add_point(camera.field2image(&p).unwrap(), true);
            }
            data
        })
        .collect()
}

fn unit_norm(params: &CameraParameters) -> f64 {
    params.q0().powi(2) + params.q1().powi(2) + params.q2().powi(2) + params.q3().powi(2)
}

#[test]
fn four_point_recovers_pose() {
    let field = field();
    let truth = truth(&field);
    let landmarks = field.landmarks();
    let image = project_all(&truth, &landmarks);

    let mut params = CameraParameters::new(field.clone());
    let report = params
        .calibrate(&landmarks, &image, CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();

    assert!(!report.timed_out(), "{:?}", report);
    assert!(report.final_chisqr < 1e-8, "{:?}", report);
    assert_eq!(report.residuals, 8);
    assert_eq!(report.parameters, 6);
    let angle = params
        .field_to_camera_rotation()
        .angle_to(&truth.field_to_camera_rotation());
    assert!(angle < 1e-5, "rotation off by {}", angle);
    let dt = (params.translation() - truth.translation()).norm();
    assert!(dt < 0.05, "translation off by {}", dt);
    assert!((unit_norm(&params) - 1.0).abs() < 1e-12);
    assert_eq!(params.calibration_state(), CalibrationState::CoarseCalibrated);

    let chi = params
        .calc_chisqr(
            &landmarks,
            &image,
            params.state_vector(),
            CalibrationType::FOUR_POINT_INITIAL,
        )
        .unwrap();
    assert!(chi < 1e-8);
}

#[test]
fn four_point_leaves_intrinsics_alone() {
    let field = field();
    let landmarks = field.landmarks();
    let image = project_all(&truth(&field), &landmarks);

    let mut params = CameraParameters::new(field.clone());
    params.set(ParamIndex::FocalLength, 480.0).unwrap();
    params.set(ParamIndex::Distortion, 0.05).unwrap();
    let before = *params.state_vector();
    params
        .calibrate(&landmarks, &image, CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();

    let mask = ParamMask::from_calibration_type(CalibrationType::FOUR_POINT_INITIAL);
    for p in ParamIndex::ALL {
        if !mask.contains(p) {
            assert_eq!(params.get(p), before[p as usize], "{:?} changed", p);
        }
    }
    assert_eq!(params.p_to_est(), mask);
}

#[test]
fn chisqr_never_increases() {
    let field = field();
    let landmarks = field.landmarks();
    let noise = [
        Vector2::new(1.5, -0.5),
        Vector2::new(-2.0, 1.0),
        Vector2::new(0.5, 2.5),
        Vector2::new(-1.0, -1.5),
    ];
    let image: Vec<_> = project_all(&truth(&field), &landmarks)
        .iter()
        .zip(noise.iter())
        .map(|(p, n)| p + n)
        .collect();

    let mut params = CameraParameters::new(field.clone());
    let seed = *params.state_vector();
    let report = params
        .calibrate(&landmarks, &image, CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();
    let chi = |p: &StateVector| {
        params
            .calc_chisqr(&landmarks, &image, p, CalibrationType::FOUR_POINT_INITIAL)
            .unwrap()
    };
    assert!(chi(params.state_vector()) <= chi(&seed));
    assert!(report.final_chisqr <= report.initial_chisqr);
    assert!((unit_norm(&params) - 1.0).abs() < 1e-12);
}

#[test]
fn full_estimation_without_data_is_underdetermined() {
    let mut params = CameraParameters::new(field());
    let before = *params.state_vector();
    let res = params.calibrate(&[], &[], CalibrationType::FULL_ESTIMATION);
    match res {
        Err(Error::Underdetermined {
            residuals,
            parameters,
        }) => {
            assert_eq!(residuals, 0);
            assert_eq!(parameters, STATE_SPACE_DIMENSION);
        }
        other => panic!("expected Underdetermined, got {:?}", other),
    }
    assert_eq!(*params.state_vector(), before);
    assert_eq!(params.calibration_state(), CalibrationState::Uninitialized);
}

#[test]
fn zero_timeout_keeps_the_seed() {
    let field = field();
    let landmarks = field.landmarks();
    let image = project_all(&truth(&field), &landmarks);

    let mut params = CameraParameters::new(field.clone());
    params
        .additional_calibration_information
        .set_setting("convergence_timeout", 0.0)
        .unwrap();
    let before = *params.state_vector();
    let report = params
        .calibrate(&landmarks, &image, CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Timeout);
    assert_eq!(report.iterations, 0);
    assert_eq!(*params.state_vector(), before);
    assert_eq!(params.calibration_state(), CalibrationState::Uninitialized);
}

#[test]
fn outliers_do_not_change_chisqr() {
    let field = field();
    let truth = truth(&field);
    let landmarks = field.landmarks();
    let image = project_all(&truth, &landmarks);

    let mut params = CameraParameters::new(field.clone());
    params.line_segment_data = observed_lines(&truth, 5);
    let p = *params.state_vector();
    let full = CalibrationType::FULL_ESTIMATION;
    let without = params.calc_chisqr(&landmarks, &image, &p, full).unwrap();

    params.line_segment_data[0].add_point(Vector2::new(10.0, 10.0), false);
    params.line_segment_data[2].add_point(Vector2::new(600.0, 300.0), false);
    let with = params.calc_chisqr(&landmarks, &image, &p, full).unwrap();
    assert_eq!(with, without);

    let four = CalibrationType::FOUR_POINT_INITIAL;
    let points_only = params.calc_chisqr(&landmarks, &image, &p, four).unwrap();
    assert!(with > points_only);
}

#[test]
fn line_refinement_after_four_point() {
    let field = field();
    let truth = lens_truth(&field);
    let landmarks = field.landmarks();
    let image = project_all(&truth, &landmarks);

    let mut params = CameraParameters::new(field.clone());
    params
        .calibrate(&landmarks, &image, CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();
    assert_eq!(params.calibration_state(), CalibrationState::CoarseCalibrated);

    params.line_segment_data = observed_lines(&truth, 8);
    let mask = ParamMask::of(&[
        ParamIndex::FocalLength,
        ParamIndex::Distortion,
        ParamIndex::Q1,
        ParamIndex::Q2,
        ParamIndex::Q3,
        ParamIndex::Tx,
        ParamIndex::Ty,
        ParamIndex::Tz,
    ]);
    let report = params
        .calibrate_subset(&landmarks, &image, mask, true)
        .unwrap();
    assert!(report.iterations > 0);
    assert!(report.final_chisqr <= report.initial_chisqr);
    assert_eq!(report.residuals, 8 + 4 * 8);
    assert_eq!(params.calibration_state(), CalibrationState::Refined);
    assert_eq!(params.principal_point_x(), 390.0);
    assert_eq!(params.principal_point_y(), 290.0);

    params.reset();
    assert_eq!(params.calibration_state(), CalibrationState::Uninitialized);
    assert!(params.line_segment_data.is_empty());
    assert!((unit_norm(&params) - 1.0).abs() < 1e-12);
}

#[test]
fn full_estimation_from_reset() {
    let field = field();
    let truth = lens_truth(&field);
    let landmarks = field.landmarks();
    let image = project_all(&truth, &landmarks);

    let mut params = CameraParameters::new(field.clone());
    params.reset();
    assert_eq!(params.distortion(), 0.0);
    params
        .calibrate(&landmarks, &image, CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();

    params.line_segment_data = observed_lines(&truth, 8);
    let report = params
        .calibrate(&landmarks, &image, CalibrationType::FULL_ESTIMATION)
        .unwrap();
    assert_eq!(report.parameters, STATE_SPACE_DIMENSION);
    assert_eq!(report.residuals, 8 + 4 * 8);
    assert!(report.iterations > 0, "{:?}", report);
    assert!(report.final_chisqr < 1e-6, "{:?}", report);
    assert_eq!(params.calibration_state(), CalibrationState::Refined);
    assert_eq!(params.p_to_est(), ParamMask::all());

    assert!((params.focal_length() - 520.0).abs() < 0.5, "f = {}", params.focal_length());
    assert!((params.distortion() - 0.12).abs() < 1e-3, "k = {}", params.distortion());
    let angle = params
        .field_to_camera_rotation()
        .angle_to(&truth.field_to_camera_rotation());
    assert!(angle < 1e-4, "rotation off by {}", angle);
    let dt = (params.translation() - truth.translation()).norm();
    assert!(dt < 5.0, "translation off by {}", dt);
    assert!((unit_norm(&params) - 1.0).abs() < 1e-12);
}

#[test]
fn fresh_line_data_re_enters_refined() {
    let field = field();
    let truth = lens_truth(&field);
    let image = project_all(&truth, &field.landmarks());

    let mut params = CameraParameters::new(field.clone());
    set_landmark_images(&mut params, &image);
    params
        .do_calibration(CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();
    params.line_segment_data = observed_lines(&truth, 8);
    params
        .do_calibration(CalibrationType::FULL_ESTIMATION)
        .unwrap();
    assert_eq!(params.calibration_state(), CalibrationState::Refined);

    params.line_segment_data = observed_lines(&truth, 12);
    let report = params
        .do_calibration(CalibrationType::FULL_ESTIMATION)
        .unwrap();
    assert_eq!(report.residuals, 8 + 4 * 12);
    assert!(report.final_chisqr <= report.initial_chisqr);
    assert_eq!(params.calibration_state(), CalibrationState::Refined);
    assert!((params.distortion() - 0.12).abs() < 1e-3, "k = {}", params.distortion());
}

#[test]
fn fit_pinned_at_a_bound_reports_stalled() {
    let field = field();
    let landmarks = field.landmarks();
    let mut params = truth(&field);
    assert_eq!(params.distortion(), 0.0);

    // spread the observations away from the principal point, so the best
    // distortion would be below its lower bound
    let pp = Vector2::new(params.principal_point_x(), params.principal_point_y());
    let image: Vec<_> = project_all(&params, &landmarks)
        .iter()
        .map(|p| pp + (p - pp) * 1.05)
        .collect();

    let before = *params.state_vector();
    let mask = ParamMask::of(&[ParamIndex::Distortion]);
    let report = params
        .calibrate_subset(&landmarks, &image, mask, false)
        .unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Stalled);
    assert_eq!(report.iterations, 0);
    assert_eq!(report.final_chisqr, report.initial_chisqr);
    assert_eq!(*params.state_vector(), before);
    assert_eq!(params.calibration_state(), CalibrationState::Uninitialized);
}

#[test]
fn do_calibration_uses_hand_placed_landmarks() {
    let field = field();
    let truth = truth(&field);
    let image = project_all(&truth, &field.landmarks());

    let mut params = CameraParameters::new(field.clone());
    set_landmark_images(&mut params, &image);
    let report = params
        .do_calibration(CalibrationType::FOUR_POINT_INITIAL)
        .unwrap();
    assert!(report.final_chisqr < 1e-8, "{:?}", report);
    let corner = params.image2field(&image[1], 0.0).unwrap();
    assert!((corner - field.right_corner()).norm() < 0.1);
}

#[test]
fn distortion_above_max_is_rejected() {
    let mut params = CameraParameters::new(field());
    let before = params.distortion();
    assert!(matches!(
        params.set(ParamIndex::Distortion, 2.0001),
        Err(Error::OutOfBounds { .. })
    ));
    assert_eq!(params.distortion(), before);
    let row = params
        .settings()
        .into_iter()
        .find(|s| s.name == "distortion")
        .unwrap();
    assert_eq!(row.max, 2.0);
}

#[test]
fn geometry_message_round_trip() {
    let field = field();
    let mut truth = truth(&field);
    truth.set(ParamIndex::Distortion, 0.3).unwrap();
    let msg = truth.to_geometry_message(2);
    assert_eq!(msg.camera_id, 2);
    let qn = msg.q0 * msg.q0 + msg.q1 * msg.q1 + msg.q2 * msg.q2 + msg.q3 * msg.q3;
    assert!((qn - 1.0).abs() < 1e-12);

    let mut loaded = CameraParameters::new(field.clone());
    loaded.from_geometry_message(&msg).unwrap();
    let diff = loaded.state_vector() - truth.state_vector();
    assert!(diff.amax() < 1e-12, "{}", diff);

    // the sign of the wire quaternion does not matter
    let mut flipped = msg.clone();
    flipped.q0 = -msg.q0;
    flipped.q1 = -msg.q1;
    flipped.q2 = -msg.q2;
    flipped.q3 = -msg.q3;
    let mut loaded = CameraParameters::new(field);
    loaded.from_geometry_message(&flipped).unwrap();
    let diff = loaded.state_vector() - truth.state_vector();
    assert!(diff.amax() < 1e-12, "{}", diff);
}

#[test]
fn shared_parameters_project_during_calibration() {
    let field = field();
    let landmarks = field.landmarks();
    let image = project_all(&truth(&field), &landmarks);
    let shared = SharedCameraParameters::new(CameraParameters::new(field.clone()));

    std::thread::scope(|s| {
        let reader = shared.clone();
        s.spawn(move || {
            for _ in 0..200 {
                let p = reader.field2image(&Vector3::new(1000.0, 0.0, 0.0)).unwrap();
                assert!(p.x.is_finite() && p.y.is_finite());
            }
        });
        let report = shared
            .calibrate(&landmarks, &image, CalibrationType::FOUR_POINT_INITIAL)
            .unwrap();
        assert!(report.final_chisqr < 1e-8);
    });

    let guard = shared.read();
    assert_eq!(guard.calibration_state(), CalibrationState::CoarseCalibrated);
    let px = guard.field2image(&landmarks[0]).unwrap();
    assert!((px - image[0]).norm() < 1e-3);
}

#[test]
fn intrinsics_roundtrip_f64() {
    let cam = FieldCameraIntrinsics::from_params(500.0, 390.0, 290.0, RadialDistortion::new(0.2));
    cam_geom::intrinsic_test_utils::roundtrip_intrinsics(&cam, 780, 580, 5, 65, 1e-6);
}

#[test]
fn intrinsics_roundtrip_f32() {
    let cam = FieldCameraIntrinsics::from_params(
        500.0f32,
        390.0,
        290.0,
        RadialDistortion::new(0.2f32),
    );
    cam_geom::intrinsic_test_utils::roundtrip_intrinsics(&cam, 780, 580, 5, 65, 0.02f32);
}

#[cfg(feature = "serde-serialize")]
mod serde_tests {
    use super::*;

    #[test]
    fn geometry_yaml_round_trip() {
        let field = field();
        let msg = truth(&field).to_geometry_message(7);
        let mut buf = Vec::new();
        geometry_to_yaml(&msg, &mut buf).unwrap();
        let back = geometry_from_yaml(&buf[..]).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn bad_yaml_is_a_parse_error() {
        let res = geometry_from_yaml(&b"focal_length: [1, 2"[..]);
        assert!(matches!(res, Err(Error::YamlParseError)));
    }

    #[test]
    fn solver_options_from_yaml() {
        let opts: SolverOptions = serde_yaml::from_str(
            "max_iterations: 20
chisqr_tolerance: 1.0e-8
chisqr_floor: 1.0e-12
initial_damping: 0.01
damping_increase: 10.0
damping_decrease: 3.0
max_damping: 1.0e10
finite_difference_step: 1.0e-7
",
        )
        .unwrap();
        assert_eq!(opts.max_iterations, 20);
        assert_eq!(opts.damping_decrease, 3.0);
    }
}
