//! Sequential execution of a pipeline with retries.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use voxreg_core::transform::invert_with;
use voxreg_core::{InversionOptions, Resampler, Transform, Volume};

use crate::cancel::CancellationToken;
use crate::error::{RegistrationError, Result};
use crate::estimator::EstimateRequest;
use crate::progress::{ProgressCallback, ProgressTracker};

use super::builder::{Pipeline, PipelineStep};
use super::diagnostics::{RunDiagnostics, RunStatus, StepError, StepOutcome, StepResult};

/// Per-run options.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Resample the moving volume (and labels) onto the fixed grid.
    pub resample_moving: bool,
    /// Interpolation and fill value for output resampling.
    pub resampler: Resampler,
    pub compute_inverse: bool,
    pub inversion: InversionOptions,
    /// Wall-clock budget of the whole run.
    pub timeout: Option<Duration>,
    #[serde(skip)]
    pub progress: Option<Arc<dyn ProgressCallback>>,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resample_moving: true,
            resampler: Resampler::default(),
            compute_inverse: false,
            inversion: InversionOptions::default(),
            timeout: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("resample_moving", &self.resample_moving)
            .field("resampler", &self.resampler)
            .field("compute_inverse", &self.compute_inverse)
            .field("inversion", &self.inversion)
            .field("timeout", &self.timeout)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl RunOptions {
    pub fn with_inverse(mut self) -> Self {
        self.compute_inverse = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn without_resampling(mut self) -> Self {
        self.resample_moving = false;
        self
    }
}

/// Volumes consumed by one run.
#[derive(Debug, Clone)]
pub struct RunInputs<'a, B: AutodiffBackend> {
    pub fixed: &'a Volume<B>,
    pub moving: &'a Volume<B>,
    /// Label map in the moving space, resampled alongside the moving volume.
    pub moving_labels: Option<&'a Volume<B>>,
    /// Label map in the fixed space; landmark steps match it against `moving_labels`.
    pub fixed_labels: Option<&'a Volume<B>>,
    pub fixed_mask: Option<&'a Volume<B>>,
}

impl<'a, B: AutodiffBackend> RunInputs<'a, B> {
    pub fn new(fixed: &'a Volume<B>, moving: &'a Volume<B>) -> Self {
        Self {
            fixed,
            moving,
            moving_labels: None,
            fixed_labels: None,
            fixed_mask: None,
        }
    }

    pub fn with_labels(mut self, labels: Option<&'a Volume<B>>) -> Self {
        self.moving_labels = labels;
        self
    }

    pub fn with_fixed_labels(mut self, labels: Option<&'a Volume<B>>) -> Self {
        self.fixed_labels = labels;
        self
    }

    pub fn with_mask(mut self, mask: Option<&'a Volume<B>>) -> Self {
        self.fixed_mask = mask;
        self
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport<B: AutodiffBackend> {
    pub status: RunStatus,
    /// Moving space to fixed space; absent when the run failed.
    pub final_transform: Option<Transform>,
    /// Requested inverse (fixed space to moving space).
    pub inverse: Option<Result<Transform>>,
    pub resampled: Option<Volume<B>>,
    pub resampled_labels: Option<Volume<B>>,
    pub diagnostics: RunDiagnostics,
}

impl<B: AutodiffBackend> RunReport<B> {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.diagnostics.step(name)
    }

    /// Diagnostics as pretty JSON.
    pub fn summary_json(&self) -> serde_json::Result<String> {
        self.diagnostics.to_json()
    }
}

/// Runs pipelines.
///
/// Steps execute strictly in order. Each step starts from the composition of
/// every earlier successful step. Retryable failures are retried with a
/// progressively relaxed configuration; fatal failures abort the run and
/// leave the remaining steps unexecuted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Orchestrator;

enum Attempted {
    Done { transform: Transform, result: StepResult },
    Failed { error: RegistrationError, result: StepResult },
}

impl Orchestrator {
    pub fn run<B: AutodiffBackend>(
        pipeline: &Pipeline,
        fixed: &Volume<B>,
        moving: &Volume<B>,
        options: &RunOptions,
    ) -> RunReport<B> {
        Self::run_inputs(pipeline, &RunInputs::new(fixed, moving), options)
    }

    pub fn run_inputs<B: AutodiffBackend>(
        pipeline: &Pipeline,
        inputs: &RunInputs<'_, B>,
        options: &RunOptions,
    ) -> RunReport<B> {
        let started = Instant::now();
        let cancel = match options.timeout {
            Some(timeout) => options.cancel.child_with_timeout(timeout),
            None => options.cancel.child(),
        };

        let mut status = RunStatus::Pending;
        info!(steps = pipeline.len(), ?status, "pipeline run starting");

        let mut results = Vec::with_capacity(pipeline.len());
        let mut current: Option<Transform> = None;
        let mut aborted = false;
        let mut degraded = false;

        for (index, step) in pipeline.steps().iter().enumerate() {
            let descriptor = &step.descriptor;
            let kind = step.estimator.kind();
            if aborted {
                results.push(StepResult::pending(&descriptor.name, kind, StepOutcome::NotRun));
                continue;
            }
            if !descriptor.enabled {
                debug!(step = %descriptor.name, "step disabled, skipping");
                results.push(StepResult::pending(&descriptor.name, kind, StepOutcome::Skipped));
                continue;
            }

            status = RunStatus::Running(index);
            info!(step = %descriptor.name, kind = kind.name(), ?status, "step starting");

            match Self::attempt(step, inputs, current.as_ref(), &cancel, options) {
                Attempted::Done { transform, result } => {
                    info!(
                        step = %descriptor.name,
                        attempts = result.attempts,
                        duration = ?result.duration,
                        "step finished"
                    );
                    current = Some(transform);
                    results.push(result);
                }
                Attempted::Failed { error, result } => {
                    if error.is_fatal() {
                        error!(step = %descriptor.name, error = %error, "fatal step error, aborting run");
                        aborted = true;
                    } else if descriptor.mandatory {
                        error!(step = %descriptor.name, error = %error, "mandatory step failed");
                        aborted = true;
                    } else {
                        warn!(
                            step = %descriptor.name,
                            error = %error,
                            "optional step failed, continuing with the best transform so far"
                        );
                        degraded = true;
                    }
                    results.push(result);
                }
            }
        }

        status = if aborted {
            RunStatus::Failed
        } else if degraded {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        };

        let final_transform = match status {
            RunStatus::Failed => None,
            _ => Some(current.unwrap_or_else(|| {
                Transform::identity_between(inputs.moving.space().clone(), inputs.fixed.space().clone())
            })),
        };

        let mut warnings = Vec::new();
        let inverse = match (&final_transform, options.compute_inverse) {
            (Some(t), true) => {
                let inverse = invert_with(t, &options.inversion).map_err(RegistrationError::from);
                if let Err(e) = &inverse {
                    warn!(error = %e, "final transform could not be inverted");
                    warnings.push(StepError::from(e));
                }
                Some(inverse)
            }
            _ => None,
        };

        let mut resampled = None;
        let mut resampled_labels = None;
        let mut resample = None;
        let mut label_resample = None;
        if let (Some(t), true) = (&final_transform, options.resample_moving) {
            let resampler = options.resampler.clone().with_reference(inputs.fixed.geometry().clone());
            match resampler.apply(inputs.moving, t) {
                Ok(out) => {
                    resample = Some(out.report);
                    resampled = Some(out.volume);
                }
                Err(e) => {
                    let e = RegistrationError::from(e);
                    warn!(error = %e, "resampling the moving volume failed");
                    warnings.push(StepError::from(&e));
                }
            }
            if let Some(labels) = inputs.moving_labels {
                match resampler.apply(labels, t) {
                    Ok(out) => {
                        label_resample = Some(out.report);
                        resampled_labels = Some(out.volume);
                    }
                    Err(e) => {
                        let e = RegistrationError::from(e);
                        warn!(error = %e, "resampling the moving labels failed");
                        warnings.push(StepError::from(&e));
                    }
                }
            }
        }

        let total_duration = started.elapsed();
        match status {
            RunStatus::Failed => error!(?status, duration = ?total_duration, "pipeline run failed"),
            _ => info!(?status, duration = ?total_duration, "pipeline run finished"),
        }

        RunReport {
            status,
            final_transform,
            inverse,
            resampled,
            resampled_labels,
            diagnostics: RunDiagnostics {
                status,
                steps: results,
                total_duration,
                resample,
                label_resample,
                warnings,
            },
        }
    }

    /// Run one step, retrying retryable errors with relaxed configurations.
    fn attempt<B: AutodiffBackend>(
        step: &PipelineStep,
        inputs: &RunInputs<'_, B>,
        init: Option<&Transform>,
        cancel: &CancellationToken,
        options: &RunOptions,
    ) -> Attempted {
        let descriptor = &step.descriptor;
        let started = Instant::now();
        let mut result = StepResult::pending(&descriptor.name, step.estimator.kind(), StepOutcome::Failed);
        let mut estimator = step.estimator.clone();

        for attempt in 0..=descriptor.max_retries {
            result.attempts = attempt + 1;
            let mut tracker = ProgressTracker::new(&descriptor.name, options.progress.clone());
            tracker.start();
            let request = EstimateRequest::new(inputs.fixed, inputs.moving)
                .with_init(init)
                .with_mask(inputs.fixed_mask)
                .with_labels(inputs.fixed_labels, inputs.moving_labels)
                .with_cancel(cancel.clone())
                .with_progress(tracker.clone());

            match estimator.run(&request) {
                Ok(estimate) => {
                    tracker.complete();
                    result.outcome = if attempt == 0 {
                        StepOutcome::Succeeded
                    } else {
                        StepOutcome::Recovered
                    };
                    result.transform = Some(estimate.transform.clone());
                    result.diagnostics = Some(estimate.diagnostics);
                    result.duration = started.elapsed();
                    return Attempted::Done {
                        transform: estimate.transform,
                        result,
                    };
                }
                Err(error) => {
                    tracker.error(&error.to_string());
                    result.error = Some(StepError::from(&error));
                    if error.is_retryable() && attempt < descriptor.max_retries {
                        warn!(
                            step = %descriptor.name,
                            attempt = attempt + 1,
                            error = %error,
                            relax_factor = descriptor.relax_factor,
                            "retrying with relaxed configuration"
                        );
                        estimator = estimator.relaxed(descriptor.relax_factor);
                        continue;
                    }
                    result.duration = started.elapsed();
                    return Attempted::Failed { error, result };
                }
            }
        }

        // max_retries + 1 attempts always end in one of the returns above.
        result.duration = started.elapsed();
        Attempted::Failed {
            error: RegistrationError::convergence_failure(format!(
                "step '{}' made no attempts",
                descriptor.name
            )),
            result,
        }
    }
}
