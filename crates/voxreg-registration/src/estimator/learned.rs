//! Estimation delegated to an external inference collaborator.
//!
//! The collaborator sees plain host data: both grids with their samples and
//! the step's free-form parameters. It answers with either an affine point
//! map or a displacement field on the fixed grid. The call is blocking, so
//! it runs on a dedicated thread while the caller polls for cancellation
//! and the step timeout.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use burn::tensor::backend::{AutodiffBackend, Backend};
use nalgebra::Matrix3x4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use voxreg_core::{AffineTransform, DisplacementField, GridGeometry, Transform, Volume};

use super::{Estimate, EstimateDiagnostics, EstimateRequest, Prepared};
use crate::cancel::CancellationToken;
use crate::error::{RegistrationError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A grid with its samples, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSamples {
    pub geometry: GridGeometry,
    pub values: Vec<f32>,
}

impl VolumeSamples {
    pub fn from_volume<B: Backend>(volume: &Volume<B>) -> Result<Self> {
        Ok(Self {
            geometry: volume.geometry().clone(),
            values: volume.to_vec()?,
        })
    }
}

/// What the collaborator is asked to register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub fixed: VolumeSamples,
    /// Already warped by the step's initial transform.
    pub moving: VolumeSamples,
    pub model: Option<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// What the collaborator answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InferenceOutput {
    /// Row-major `3x4` point map from fixed to moving physical coordinates.
    Affine { matrix: Vec<f64> },
    /// Interleaved `[x, y, z]` displacements on `geometry`.
    Field { geometry: GridGeometry, components: Vec<f64> },
}

/// A learned registration model.
///
/// Implementations may block. They are called from a worker thread and
/// may be abandoned on timeout.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutput>;
}

/// Learned estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedConfig {
    /// Name the backend was registered under.
    pub backend: String,
    pub model: Option<String>,
    pub timeout_ms: u64,
    /// Passed through to the backend untouched.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl Default for LearnedConfig {
    fn default() -> Self {
        Self {
            backend: "default".to_string(),
            model: None,
            timeout_ms: 60_000,
            parameters: BTreeMap::new(),
        }
    }
}

impl LearnedConfig {
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = backend.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.trim().is_empty() {
            return Err(RegistrationError::invalid_configuration("learned step needs a backend name"));
        }
        if self.timeout_ms == 0 {
            return Err(RegistrationError::invalid_configuration("timeout_ms must be positive"));
        }
        Ok(())
    }

    /// A retry gets `factor` times the time budget.
    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            timeout_ms: (self.timeout_ms as f64 * factor).ceil() as u64,
            ..self.clone()
        }
    }
}

/// Learned estimator.
#[derive(Clone)]
pub struct LearnedEstimator {
    config: LearnedConfig,
    backend: Arc<dyn InferenceBackend>,
}

impl fmt::Debug for LearnedEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LearnedEstimator")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl LearnedEstimator {
    pub fn new(config: LearnedConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &LearnedConfig {
        &self.config
    }

    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            config: self.config.relaxed(factor),
            backend: Arc::clone(&self.backend),
        }
    }

    pub fn estimate<B: AutodiffBackend>(&self, request: &EstimateRequest<'_, B>) -> Result<Estimate> {
        let prepared = Prepared::new(request)?;
        let fixed = request.fixed;
        let moving = &prepared.moving;

        let inference = InferenceRequest {
            fixed: VolumeSamples::from_volume(fixed)?,
            moving: VolumeSamples::from_volume(moving)?,
            model: self.config.model.clone(),
            parameters: self.config.parameters.clone(),
        };
        info!(
            step = request.progress.step(),
            backend = self.backend.name(),
            timeout_ms = self.config.timeout_ms,
            "running inference"
        );

        let started = Instant::now();
        let output = call_with_timeout(&self.backend, inference, self.config.timeout(), &request.cancel)?;
        debug!(elapsed = ?started.elapsed(), "inference returned");
        request.progress.update(None, 1, Some(1), f64::NAN, 0.0);

        let source = moving.space().clone();
        let target = fixed.space().clone();
        let mut diagnostics = EstimateDiagnostics {
            iterations: 1,
            stop_reason: Some("inference".to_string()),
            ..EstimateDiagnostics::default()
        };

        let correction = match output {
            InferenceOutput::Affine { matrix } => {
                check_values(&matrix, 12, "affine matrix")?;
                let affine = AffineTransform::new(Matrix3x4::from_row_slice(&matrix));
                if affine.determinant().abs() < 1e-12 {
                    return Err(RegistrationError::inference("backend returned a singular affine matrix"));
                }
                Transform::affine(affine, source, target)
            }
            InferenceOutput::Field { geometry, components } => {
                if !geometry.approx_eq(fixed.geometry(), 1e-6) {
                    return Err(RegistrationError::geometry_mismatch(format!(
                        "backend field grid {:?} does not match the fixed grid {:?}",
                        geometry.shape(),
                        fixed.shape()
                    )));
                }
                check_values(&components, geometry.len() * 3, "displacement field")?;
                let field = DisplacementField::from_components(fixed.geometry().clone(), &components)?;
                let folding = field.folding_report();
                if folding.is_folded() {
                    warn!(
                        step = request.progress.step(),
                        folded_voxels = folding.folded_voxels,
                        min_jacobian = folding.min_jacobian,
                        "inferred field folds"
                    );
                }
                diagnostics.min_jacobian = Some(folding.min_jacobian);
                diagnostics.folded_voxels = Some(folding.folded_voxels);
                Transform::dense_field(field, source, target)
            }
        };

        Ok(Estimate {
            transform: prepared.finish(correction)?,
            diagnostics,
        })
    }
}

fn check_values(values: &[f64], expected: usize, what: &str) -> Result<()> {
    if values.len() != expected {
        return Err(RegistrationError::inference(format!(
            "{} has {} values, expected {}",
            what,
            values.len(),
            expected
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(RegistrationError::inference(format!("{} contains non-finite values", what)));
    }
    Ok(())
}

/// Run `backend.infer` on a worker thread, waiting at most `timeout`.
///
/// A worker that outlives the timeout or a cancellation is detached; its
/// result is dropped when it eventually arrives.
fn call_with_timeout(
    backend: &Arc<dyn InferenceBackend>,
    request: InferenceRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<InferenceOutput> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(backend);
    thread::Builder::new()
        .name(format!("inference-{}", backend.name()))
        .spawn(move || {
            let _ = tx.send(worker.infer(&request));
        })
        .map_err(|e| RegistrationError::inference(format!("failed to start inference worker: {}", e)))?;

    // None: the timeout lies beyond any representable instant.
    let deadline = Instant::now().checked_add(timeout);
    loop {
        cancel.check("inference")?;
        let now = Instant::now();
        let wait = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(RegistrationError::inference(format!(
                    "backend '{}' timed out after {:?}",
                    backend.name(),
                    timeout
                )));
            }
            Some(deadline) => POLL_INTERVAL.min(deadline - now),
            None => POLL_INTERVAL,
        };
        match rx.recv_timeout(wait) {
            Ok(result) => {
                return result.map_err(|e| match e {
                    RegistrationError::Inference(_) => e,
                    other => RegistrationError::inference(format!("backend '{}' failed: {}", backend.name(), other)),
                })
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(RegistrationError::inference(format!(
                    "backend '{}' exited without a result",
                    backend.name()
                )))
            }
        }
    }
}
