mod common;

use common::{blob, landmarks, B, LANDMARKS};
use voxreg_core::image::world_points;
use voxreg_core::{invert, Point3, RigidTransform, Transform, Vector3};
use voxreg_registration::{
    AffineConfig, CancellationToken, DeformableConfig, EstimateRequest, Estimator, EstimatorConfig, LandmarkConfig,
    LandmarkModel, RegistrationError, RigidConfig,
};

fn estimator(config: EstimatorConfig) -> Estimator {
    Estimator::from_config(&config, &Default::default()).unwrap()
}

#[test]
fn test_rigid_recovers_translation() {
    let shift = [1.0, 0.5, -0.75];
    let center = [10.0, 10.0, 10.0];
    let fixed = blob(20, center, [3.0, 3.5, 4.0], "fixed");
    let moving = blob(
        20,
        [center[0] + shift[0], center[1] + shift[1], center[2] + shift[2]],
        [3.0, 3.5, 4.0],
        "moving",
    );

    let rigid = estimator(EstimatorConfig::Rigid(RigidConfig::default()));
    let estimate = rigid
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap();
    assert_eq!(estimate.transform.source_space().map(|s| s.name()), Some("moving"));
    assert_eq!(estimate.transform.target_space().map(|s| s.name()), Some("fixed"));

    // Fixed points map onto moving points shifted by the known offset.
    let c = Point3::from(center);
    let mapped = estimate.transform.transform_point(&c);
    for a in 0..3 {
        assert!(
            (mapped[a] - c[a] - shift[a]).abs() < 0.1,
            "axis {}: got {:.4}, expected {:.4}",
            a,
            mapped[a] - c[a],
            shift[a]
        );
    }

    // The blob centre of the fixed volume sits at centre + shift in the
    // moving volume; the inverse brings that known location back.
    let inverse = invert(&estimate.transform).unwrap();
    let moved = Point3::new(c.x + shift[0], c.y + shift[1], c.z + shift[2]);
    let back = inverse.transform_point(&moved);
    assert!((back - c).norm() < 0.1, "centre came back at {:?}", back);
    assert!(estimate.diagnostics.final_metric < estimate.diagnostics.initial_metric);
}

#[test]
fn test_rigid_translation_only_dof() {
    let fixed = blob(16, [8.0, 8.0, 8.0], [3.0, 3.0, 3.0], "fixed");
    let moving = blob(16, [8.5, 8.0, 8.0], [3.0, 3.0, 3.0], "moving");
    let config = RigidConfig::default().with_dof(&["tx", "ty", "tz"]);
    let estimate = estimator(EstimatorConfig::Rigid(config))
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap();
    let p = Point3::new(8.0, 8.0, 8.0);
    assert!((estimate.transform.transform_point(&p).x - 8.5).abs() < 0.1);
}

#[test]
fn test_deformable_zero_iterations_fails() {
    let fixed = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "fixed");
    let moving = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "moving");
    let err = estimator(EstimatorConfig::Deformable(DeformableConfig::single_level(0)))
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, RegistrationError::ConvergenceFailure(_)), "{:?}", err);
    assert!(err.is_retryable());
}

#[test]
fn test_rigid_zero_iterations_fails() {
    let fixed = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "fixed");
    let moving = blob(8, [4.5, 4.0, 4.0], [2.0, 2.0, 2.0], "moving");
    let mut config = RigidConfig::default();
    config.optimizer.max_iterations = 0;
    let err = estimator(EstimatorConfig::Rigid(config))
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, RegistrationError::ConvergenceFailure(_)));
}

#[test]
fn test_deformable_on_identical_volumes_is_identity() {
    let fixed = blob(16, [8.0, 7.0, 8.5], [3.0, 2.5, 3.5], "fixed");
    let moving = blob(16, [8.0, 7.0, 8.5], [3.0, 2.5, 3.5], "moving");
    let estimate = estimator(EstimatorConfig::Deformable(DeformableConfig::default()))
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap();
    let points = world_points(fixed.geometry());
    assert!(estimate.transform.is_identity_within(1e-3, &points));
    assert_eq!(estimate.diagnostics.folded_voxels, Some(0));
    assert_eq!(estimate.diagnostics.levels.len(), 3);
}

#[test]
fn test_deformable_reduces_mismatch() {
    let fixed = blob(16, [8.0, 8.0, 8.0], [3.0, 3.0, 3.0], "fixed");
    let moving = blob(16, [8.6, 8.0, 8.0], [3.0, 3.0, 3.0], "moving");
    let mut config = DeformableConfig::single_level(500);
    config.tolerance = 2e-3;
    let estimate = estimator(EstimatorConfig::Deformable(config))
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap();
    let initial = estimate.diagnostics.initial_metric.unwrap();
    let final_ = estimate.diagnostics.final_metric.unwrap();
    assert!(final_ < 0.5 * initial, "mse {} -> {}", initial, final_);

    // On the blob flank the displacement points towards the moving blob.
    let p = Point3::new(6.0, 8.0, 8.0);
    assert!(estimate.transform.transform_point(&p).x - p.x > 0.2);
}

#[test]
fn test_default_deformable_on_shifted_blob() {
    let fixed = blob(20, [10.0, 10.0, 10.0], [3.5, 3.5, 3.5], "fixed");
    let moving = blob(20, [10.6, 9.7, 10.0], [3.5, 3.5, 3.5], "moving");
    let estimate = estimator(EstimatorConfig::Deformable(DeformableConfig::default()))
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap();
    let initial = estimate.diagnostics.initial_metric.unwrap();
    let final_ = estimate.diagnostics.final_metric.unwrap();
    assert!(final_ < initial, "mse {} -> {}", initial, final_);
    assert_eq!(estimate.diagnostics.levels.len(), 3);
}

#[test]
fn test_init_in_wrong_space_is_rejected() {
    let fixed = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "fixed");
    let moving = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "moving");
    let wrong = voxreg_core::Transform::identity_between("atlas".into(), "fixed".into());
    let err = estimator(EstimatorConfig::Affine(AffineConfig::default()))
        .estimate(&fixed, &moving, Some(&wrong), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, RegistrationError::IncompatibleSpace { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_cancelled_before_start() {
    let fixed = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "fixed");
    let moving = blob(8, [4.5, 4.0, 4.0], [2.0, 2.0, 2.0], "moving");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = EstimateRequest::<B>::new(&fixed, &moving).with_cancel(cancel);
    let err = estimator(EstimatorConfig::Rigid(RigidConfig::default()))
        .run(&request)
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Cancelled(_)));
}

#[test]
fn test_mask_in_moving_space_is_rejected() {
    let fixed = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "fixed");
    let moving = blob(8, [4.0, 4.0, 4.0], [2.0, 2.0, 2.0], "moving");
    let request = EstimateRequest::new(&fixed, &moving).with_mask(Some(&moving));
    let err = estimator(EstimatorConfig::Rigid(RigidConfig::default()))
        .run(&request)
        .unwrap_err();
    assert!(matches!(err, RegistrationError::IncompatibleSpace { .. }));
}

#[test]
fn test_landmark_rigid_recovers_label_shift() {
    let fixed = landmarks(16, &LANDMARKS, [0, 0, 0], "fixed");
    let moving = landmarks(16, &LANDMARKS, [2, 1, 0], "moving");
    let estimate = estimator(EstimatorConfig::Landmark(LandmarkConfig::default()))
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap();

    for (_, [i, j, k]) in LANDMARKS {
        let p = Point3::new(i as f64, j as f64, k as f64);
        let mapped = estimate.transform.transform_point(&p);
        assert!((mapped - p - Vector3::new(2.0, 1.0, 0.0)).norm() < 1e-6);
    }
    assert!(estimate.diagnostics.final_metric.unwrap() < 1e-6);
    assert!(estimate.diagnostics.initial_metric.unwrap() > 2.0);
}

#[test]
fn test_landmark_fit_accounts_for_init() {
    let fixed = landmarks(16, &LANDMARKS, [0, 0, 0], "fixed");
    let moving = landmarks(16, &LANDMARKS, [2, 1, 0], "moving");
    let init = Transform::rigid(
        RigidTransform::from_translation(Vector3::new(1.0, 0.0, 0.0)),
        "moving".into(),
        "fixed".into(),
    );
    let estimate = estimator(EstimatorConfig::Landmark(LandmarkConfig::new(LandmarkModel::Affine)))
        .estimate(&fixed, &moving, Some(&init), &CancellationToken::new())
        .unwrap();

    let p = Point3::new(7.0, 6.0, 5.0);
    assert!((estimate.transform.transform_point(&p) - Point3::new(9.0, 7.0, 5.0)).norm() < 1e-6);
    assert_eq!(estimate.transform.source_space().map(|s| s.name()), Some("moving"));
}

#[test]
fn test_landmark_needs_label_maps_and_enough_matches() {
    let fixed = blob(16, [8.0, 8.0, 8.0], [3.0, 3.0, 3.0], "fixed");
    let moving = blob(16, [8.0, 8.0, 8.0], [3.0, 3.0, 3.0], "moving");
    let landmark = estimator(EstimatorConfig::Landmark(LandmarkConfig::default()));
    let err = landmark
        .estimate(&fixed, &moving, None, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidConfiguration(_)));

    let fixed_labels = landmarks(16, &LANDMARKS, [0, 0, 0], "fixed");
    let moving_labels = landmarks(16, &LANDMARKS[..2], [0, 0, 0], "moving");
    let request = EstimateRequest::new(&fixed, &moving).with_labels(Some(&fixed_labels), Some(&moving_labels));
    let err = landmark.run(&request).unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidVolume(_)), "{:?}", err);
}
