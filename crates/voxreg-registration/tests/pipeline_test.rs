mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{blob, landmarks, mismatch, ConstantField, Flaky, Slow, WrongGrid, LANDMARKS};
use voxreg_core::image::world_points;
use voxreg_core::Point3;
use voxreg_registration::error::ErrorKind;
use voxreg_registration::{
    AffineConfig, CancellationToken, DeformableConfig, HistoryCallback, LearnedConfig, Orchestrator,
    PipelineBuilder, PipelineSpec, RigidConfig, RunInputs, RunOptions, RunStatus, StepDescriptor, StepOutcome,
};

fn learned(backend: &str) -> LearnedConfig {
    LearnedConfig::default()
        .with_backend(backend)
        .with_timeout(Duration::from_secs(5))
}

#[test]
fn test_linear_then_deformable_on_identical_volumes() {
    let fixed = blob(16, [8.0, 7.5, 8.0], [3.0, 2.5, 3.5], "fixed");
    let moving = blob(16, [8.0, 7.5, 8.0], [3.0, 2.5, 3.5], "moving");
    let pipeline = PipelineBuilder::from_spec(PipelineSpec::from_chain("rigid -> affine -> deformable").unwrap())
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default().with_inverse());
    assert_eq!(report.status, RunStatus::Succeeded, "{}", report.summary_json().unwrap());
    let transform = report.final_transform.as_ref().unwrap();
    let points = world_points(fixed.geometry());
    assert!(transform.is_identity_within(0.05, &points));

    let inverse = report.inverse.as_ref().unwrap().as_ref().unwrap();
    assert_eq!(inverse.source_space().map(|s| s.name()), Some("fixed"));
    assert!(report.resampled.is_some());
    assert_eq!(report.diagnostics.steps.len(), 3);
    assert!(report
        .diagnostics
        .steps
        .iter()
        .all(|s| s.outcome == StepOutcome::Succeeded && s.attempts == 1));
}

#[test]
fn test_default_chain_on_misaligned_volumes() {
    let fixed = blob(20, [10.0, 10.0, 10.0], [4.0, 3.0, 3.5], "fixed");
    let moving = blob(20, [11.2, 9.2, 10.6], [4.0, 3.0, 3.5], "moving");
    let pipeline = PipelineBuilder::from_spec(PipelineSpec::from_chain("rigid -> affine -> deformable").unwrap())
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default());
    assert_eq!(report.status, RunStatus::Succeeded, "{}", report.summary_json().unwrap());
    assert!(report.diagnostics.steps.iter().all(|s| s.succeeded()));

    let deformable = report.step("deformable").unwrap().diagnostics.as_ref().unwrap();
    assert_eq!(deformable.levels.len(), 3);
    assert!(deformable.levels.iter().all(|l| !l.stop_reason.is_empty()));

    let before = mismatch(&fixed, &moving);
    let after = mismatch(&fixed, report.resampled.as_ref().unwrap());
    assert!(after < 0.25 * before, "mse {} -> {}", before, after);
}

#[test]
fn test_unbounded_run_timeout_returns_report() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let pipeline = PipelineBuilder::new()
        .register_backend("flaky", Arc::new(Flaky::new(0)))
        .learned(learned("flaky"))
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default().with_timeout(Duration::MAX));
    assert_eq!(report.status, RunStatus::Succeeded);

    let options: RunOptions = serde_json::from_str(r#"{"timeout": {"secs": 18446744073709551615, "nanos": 0}}"#).unwrap();
    assert_eq!(options.timeout, Some(Duration::new(u64::MAX, 0)));
    let report = Orchestrator::run(&pipeline, &fixed, &moving, &options);
    assert_eq!(report.status, RunStatus::Succeeded);
}

#[test]
fn test_retry_recovers() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let backend = Arc::new(Flaky::new(1));
    let pipeline = PipelineBuilder::new()
        .register_backend("flaky", backend.clone())
        .learned(learned("flaky"))
        .retries(2)
        .build()
        .unwrap();

    let history = Arc::new(HistoryCallback::new());
    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default().with_progress(history.clone()));
    assert_eq!(report.status, RunStatus::Succeeded);
    let step = report.step("learned").unwrap();
    assert_eq!(step.outcome, StepOutcome::Recovered);
    assert_eq!(step.attempts, 2);
    assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::Inference);
    assert_eq!(backend.calls(), 2);
    assert_eq!(history.errors().len(), 1);
}

#[test]
fn test_mandatory_failure_fails_run() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let pipeline = PipelineBuilder::new()
        .register_backend("flaky", Arc::new(Flaky::new(usize::MAX)))
        .learned(learned("flaky"))
        .retries(1)
        .affine(AffineConfig::default())
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default());
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.final_transform.is_none());
    assert!(report.resampled.is_none());

    let steps = &report.diagnostics.steps;
    assert_eq!(steps[0].outcome, StepOutcome::Failed);
    assert_eq!(steps[0].attempts, 2);
    assert_eq!(steps[1].outcome, StepOutcome::NotRun);
    assert_eq!(steps[1].attempts, 0);
}

#[test]
fn test_optional_failure_degrades_run() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let pipeline = PipelineBuilder::new()
        .register_backend("shift", Arc::new(ConstantField([0.5, 0.0, 0.0])))
        .register_backend("down", Arc::new(Flaky::new(usize::MAX)))
        .step(StepDescriptor::new("shift", voxreg_registration::EstimatorConfig::Learned(learned("shift"))))
        .step(
            StepDescriptor::new("refine", voxreg_registration::EstimatorConfig::Learned(learned("down")))
                .optional()
                .with_retries(0),
        )
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default());
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(report.step("shift").unwrap().outcome, StepOutcome::Succeeded);
    assert_eq!(report.step("refine").unwrap().outcome, StepOutcome::Failed);

    // The best transform so far is the first step's.
    let p = Point3::new(2.0, 3.0, 3.0);
    let mapped = report.final_transform.as_ref().unwrap().transform_point(&p);
    assert!((mapped.x - 2.5).abs() < 1e-9);
    assert!(report.resampled.is_some());
}

#[test]
fn test_optional_failure_without_success_yields_identity() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let pipeline = PipelineBuilder::new()
        .register_backend("down", Arc::new(Flaky::new(usize::MAX)))
        .learned(learned("down"))
        .optional()
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default());
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    let transform = report.final_transform.unwrap();
    assert!(transform.is_identity());
    assert_eq!(transform.source_space().map(|s| s.name()), Some("moving"));
}

#[test]
fn test_geometry_mismatch_aborts_without_retry() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let pipeline = PipelineBuilder::new()
        .register_backend("wrong", Arc::new(WrongGrid))
        .learned(learned("wrong"))
        .optional()
        .retries(3)
        .rigid(RigidConfig::default())
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default());
    assert_eq!(report.status, RunStatus::Failed);
    let first = &report.diagnostics.steps[0];
    assert_eq!(first.attempts, 1);
    assert_eq!(first.error.as_ref().unwrap().kind, ErrorKind::GeometryMismatch);
    assert_eq!(report.diagnostics.steps[1].outcome, StepOutcome::NotRun);
}

#[test]
fn test_learned_timeout_is_retried_with_longer_budget() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let config = LearnedConfig::default()
        .with_backend("slow")
        .with_timeout(Duration::from_millis(40));
    let pipeline = PipelineBuilder::new()
        .register_backend("slow", Arc::new(Slow(Duration::from_millis(150))))
        .step(
            StepDescriptor::new("learned", voxreg_registration::EstimatorConfig::Learned(config))
                .with_retries(2)
                .with_relax_factor(10.0),
        )
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default());
    assert_eq!(report.status, RunStatus::Succeeded);
    let step = report.step("learned").unwrap();
    assert_eq!(step.outcome, StepOutcome::Recovered);
    assert_eq!(step.attempts, 2);
    assert!(step.error.as_ref().unwrap().message.contains("timed out"));
}

#[test]
fn test_cancelled_run_aborts() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.5, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let pipeline = PipelineBuilder::new()
        .rigid(RigidConfig::default())
        .deformable(DeformableConfig::default())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default().with_cancel(cancel));
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.diagnostics.steps[0].error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(report.diagnostics.steps[1].outcome, StepOutcome::NotRun);
}

#[test]
fn test_disabled_step_is_skipped() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let pipeline = PipelineBuilder::new()
        .register_backend("flaky", Arc::new(Flaky::new(0)))
        .step(StepDescriptor::new("off", voxreg_registration::EstimatorConfig::Learned(learned("flaky"))).disabled())
        .learned(learned("flaky"))
        .build()
        .unwrap();

    let report = Orchestrator::run(&pipeline, &fixed, &moving, &RunOptions::default());
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.step("off").unwrap().outcome, StepOutcome::Skipped);
}

#[test]
fn test_labels_resampled_with_nearest() {
    let fixed = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "fixed");
    let moving = blob(6, [3.0, 3.0, 3.0], [1.5, 1.5, 1.5], "moving");
    let labels_values: Vec<f32> = (0..216).map(|i| (i % 3) as f32).collect();
    let labels = moving.with_values(labels_values).unwrap().into_label();
    let pipeline = PipelineBuilder::new()
        .register_backend("shift", Arc::new(ConstantField([0.3, -0.4, 0.2])))
        .learned(learned("shift"))
        .build()
        .unwrap();

    let inputs = RunInputs::new(&fixed, &moving).with_labels(Some(&labels));
    let report = Orchestrator::run_inputs(&pipeline, &inputs, &RunOptions::default());
    assert_eq!(report.status, RunStatus::Succeeded);

    let resampled = report.resampled_labels.as_ref().unwrap().to_vec().unwrap();
    assert!(resampled.iter().all(|v| [0.0, 1.0, 2.0].contains(v)));
    let label_report = report.diagnostics.label_resample.as_ref().unwrap();
    assert!(!label_report.label_override);

    let json = report.summary_json().unwrap();
    assert!(json.contains("\"status\": \"succeeded\""));
    assert!(json.contains("label_resample"));
}

#[test]
fn test_landmark_step_uses_run_label_maps() {
    let fixed = blob(16, [8.0, 8.0, 8.0], [3.0, 3.0, 3.0], "fixed");
    let moving = blob(16, [9.0, 8.0, 9.0], [3.0, 3.0, 3.0], "moving");
    let fixed_labels = landmarks(16, &LANDMARKS, [0, 0, 0], "fixed");
    let moving_labels = landmarks(16, &LANDMARKS, [1, 0, 1], "moving");
    let pipeline = PipelineBuilder::from_spec(PipelineSpec::from_chain("label").unwrap())
        .build()
        .unwrap();

    let inputs = RunInputs::new(&fixed, &moving)
        .with_labels(Some(&moving_labels))
        .with_fixed_labels(Some(&fixed_labels));
    let report = Orchestrator::run_inputs(&pipeline, &inputs, &RunOptions::default());
    assert_eq!(report.status, RunStatus::Succeeded, "{}", report.summary_json().unwrap());

    // Warped moving labels land on the fixed ones.
    let warped = report.resampled_labels.as_ref().unwrap().to_vec().unwrap();
    assert_eq!(warped, fixed_labels.to_vec().unwrap());
    let c = Point3::new(8.0, 8.0, 8.0);
    let mapped = report.final_transform.as_ref().unwrap().transform_point(&c);
    assert!((mapped - Point3::new(9.0, 8.0, 9.0)).norm() < 1e-6);
}
