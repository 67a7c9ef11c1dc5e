//! Registration estimators.
//!
//! An estimator takes a fixed and a moving volume (plus an optional initial
//! transform and label maps) and produces a transform from the moving space
//! to the fixed space. The variants form a closed set so the orchestrator can reason
//! about every failure mode.

pub mod affine;
pub mod deformable;
pub mod landmark;
pub mod learned;
pub mod parametric;
pub mod rigid;

use std::collections::HashMap;
use std::sync::Arc;

use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use voxreg_core::image::world_points;
use voxreg_core::{compose, GridGeometry, Interpolation, Resampler, Transform, Volume};

use crate::cancel::CancellationToken;
use crate::error::{RegistrationError, Result};
use crate::progress::ProgressTracker;

pub use affine::{AffineConfig, AffineEstimator};
pub use deformable::{DeformableConfig, DeformableEstimator};
pub use landmark::{label_centroids, LandmarkConfig, LandmarkEstimator, LandmarkModel};
pub use learned::{
    InferenceBackend, InferenceOutput, InferenceRequest, LearnedConfig, LearnedEstimator, VolumeSamples,
};
pub use parametric::OptimizerConfig;
pub use rigid::{RigidConfig, RigidEstimator};

/// Estimator variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorKind {
    Rigid,
    Affine,
    Deformable,
    Learned,
    Landmark,
}

impl EstimatorKind {
    pub fn name(self) -> &'static str {
        match self {
            EstimatorKind::Rigid => "rigid",
            EstimatorKind::Affine => "affine",
            EstimatorKind::Deformable => "deformable",
            EstimatorKind::Learned => "learned",
            EstimatorKind::Landmark => "landmark",
        }
    }

    /// Parse a variant name as written in a step chain.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rigid" => Some(EstimatorKind::Rigid),
            "affine" => Some(EstimatorKind::Affine),
            "deformable" | "syn" | "demons" => Some(EstimatorKind::Deformable),
            "learned" => Some(EstimatorKind::Learned),
            "landmark" | "label" => Some(EstimatorKind::Landmark),
            _ => None,
        }
    }
}

/// Declarative estimator configuration, tagged by `kind` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EstimatorConfig {
    Rigid(RigidConfig),
    Affine(AffineConfig),
    Deformable(DeformableConfig),
    Learned(LearnedConfig),
    Landmark(LandmarkConfig),
}

impl EstimatorConfig {
    /// Default configuration of a variant.
    pub fn default_for(kind: EstimatorKind) -> Self {
        match kind {
            EstimatorKind::Rigid => EstimatorConfig::Rigid(RigidConfig::default()),
            EstimatorKind::Affine => EstimatorConfig::Affine(AffineConfig::default()),
            EstimatorKind::Deformable => EstimatorConfig::Deformable(DeformableConfig::default()),
            EstimatorKind::Learned => EstimatorConfig::Learned(LearnedConfig::default()),
            EstimatorKind::Landmark => EstimatorConfig::Landmark(LandmarkConfig::default()),
        }
    }

    pub fn kind(&self) -> EstimatorKind {
        match self {
            EstimatorConfig::Rigid(_) => EstimatorKind::Rigid,
            EstimatorConfig::Affine(_) => EstimatorKind::Affine,
            EstimatorConfig::Deformable(_) => EstimatorKind::Deformable,
            EstimatorConfig::Learned(_) => EstimatorKind::Learned,
            EstimatorConfig::Landmark(_) => EstimatorKind::Landmark,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            EstimatorConfig::Rigid(c) => c.validate(),
            EstimatorConfig::Affine(c) => c.validate(),
            EstimatorConfig::Deformable(c) => c.validate(),
            EstimatorConfig::Learned(c) => c.validate(),
            EstimatorConfig::Landmark(c) => c.validate(),
        }
    }

    /// Retry variant: tolerances scaled by `factor`, iteration caps doubled.
    pub fn relaxed(&self, factor: f64) -> Self {
        match self {
            EstimatorConfig::Rigid(c) => EstimatorConfig::Rigid(c.relaxed(factor)),
            EstimatorConfig::Affine(c) => EstimatorConfig::Affine(c.relaxed(factor)),
            EstimatorConfig::Deformable(c) => EstimatorConfig::Deformable(c.relaxed(factor)),
            EstimatorConfig::Learned(c) => EstimatorConfig::Learned(c.relaxed(factor)),
            EstimatorConfig::Landmark(c) => EstimatorConfig::Landmark(c.relaxed(factor)),
        }
    }
}

/// Per-level summary of a multi-resolution estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelDiagnostics {
    pub level: usize,
    pub shape: [usize; 3],
    pub iterations: usize,
    pub max_update: f64,
    pub metric: f64,
    /// `tolerance`, `stagnation` or `iteration_cap`.
    #[serde(default)]
    pub stop_reason: String,
}

/// What an estimator measured while producing its transform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateDiagnostics {
    /// Metric used (`mse`, `ncc`).
    pub metric: Option<String>,
    pub initial_metric: Option<f64>,
    pub final_metric: Option<f64>,
    pub iterations: usize,
    /// Length of the last parameter (or field) update.
    pub last_step: Option<f64>,
    pub stop_reason: Option<String>,
    /// Smallest Jacobian determinant of a dense field.
    pub min_jacobian: Option<f64>,
    /// Voxels whose Jacobian determinant is not positive.
    pub folded_voxels: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub levels: Vec<LevelDiagnostics>,
}

/// Output of one estimator call.
#[derive(Debug, Clone)]
pub struct Estimate {
    /// Moving space to fixed space, including the initial transform.
    pub transform: Transform,
    pub diagnostics: EstimateDiagnostics,
}

/// Everything one estimator call consumes.
#[derive(Debug, Clone)]
pub struct EstimateRequest<'a, B: Backend> {
    pub fixed: &'a Volume<B>,
    pub moving: &'a Volume<B>,
    /// Moving space to fixed space; identity when absent.
    pub init: Option<&'a Transform>,
    /// Restricts the metric to fixed-space voxels where the mask is non-zero.
    pub fixed_mask: Option<&'a Volume<B>>,
    /// Label maps in the fixed and moving spaces, for landmark matching.
    pub fixed_labels: Option<&'a Volume<B>>,
    pub moving_labels: Option<&'a Volume<B>>,
    pub cancel: CancellationToken,
    pub progress: ProgressTracker,
}

impl<'a, B: Backend> EstimateRequest<'a, B> {
    pub fn new(fixed: &'a Volume<B>, moving: &'a Volume<B>) -> Self {
        Self {
            fixed,
            moving,
            init: None,
            fixed_mask: None,
            fixed_labels: None,
            moving_labels: None,
            cancel: CancellationToken::new(),
            progress: ProgressTracker::disabled(),
        }
    }

    pub fn with_init(mut self, init: Option<&'a Transform>) -> Self {
        self.init = init;
        self
    }

    pub fn with_mask(mut self, mask: Option<&'a Volume<B>>) -> Self {
        self.fixed_mask = mask;
        self
    }

    pub fn with_labels(mut self, fixed: Option<&'a Volume<B>>, moving: Option<&'a Volume<B>>) -> Self {
        self.fixed_labels = fixed;
        self.moving_labels = moving;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }
}

/// A configured estimator.
#[derive(Debug, Clone)]
pub enum Estimator {
    Rigid(RigidEstimator),
    Affine(AffineEstimator),
    Deformable(DeformableEstimator),
    Learned(LearnedEstimator),
    Landmark(LandmarkEstimator),
}

impl Estimator {
    /// Build an estimator from its configuration.
    ///
    /// Learned configurations resolve their backend by name in `backends`.
    pub fn from_config(config: &EstimatorConfig, backends: &HashMap<String, Arc<dyn InferenceBackend>>) -> Result<Self> {
        config.validate()?;
        Ok(match config {
            EstimatorConfig::Rigid(c) => Estimator::Rigid(RigidEstimator::new(c.clone())),
            EstimatorConfig::Affine(c) => Estimator::Affine(AffineEstimator::new(c.clone())),
            EstimatorConfig::Deformable(c) => Estimator::Deformable(DeformableEstimator::new(c.clone())),
            EstimatorConfig::Learned(c) => {
                let backend = backends.get(&c.backend).cloned().ok_or_else(|| {
                    RegistrationError::invalid_configuration(format!(
                        "no inference backend registered under '{}'",
                        c.backend
                    ))
                })?;
                Estimator::Learned(LearnedEstimator::new(c.clone(), backend))
            }
            EstimatorConfig::Landmark(c) => Estimator::Landmark(LandmarkEstimator::new(c.clone())),
        })
    }

    pub fn kind(&self) -> EstimatorKind {
        match self {
            Estimator::Rigid(_) => EstimatorKind::Rigid,
            Estimator::Affine(_) => EstimatorKind::Affine,
            Estimator::Deformable(_) => EstimatorKind::Deformable,
            Estimator::Learned(_) => EstimatorKind::Learned,
            Estimator::Landmark(_) => EstimatorKind::Landmark,
        }
    }

    pub fn config(&self) -> EstimatorConfig {
        match self {
            Estimator::Rigid(e) => EstimatorConfig::Rigid(e.config().clone()),
            Estimator::Affine(e) => EstimatorConfig::Affine(e.config().clone()),
            Estimator::Deformable(e) => EstimatorConfig::Deformable(e.config().clone()),
            Estimator::Learned(e) => EstimatorConfig::Learned(e.config().clone()),
            Estimator::Landmark(e) => EstimatorConfig::Landmark(e.config().clone()),
        }
    }

    /// Same estimator with a relaxed configuration.
    pub fn relaxed(&self, factor: f64) -> Self {
        match self {
            Estimator::Rigid(e) => Estimator::Rigid(RigidEstimator::new(e.config().relaxed(factor))),
            Estimator::Affine(e) => Estimator::Affine(AffineEstimator::new(e.config().relaxed(factor))),
            Estimator::Deformable(e) => Estimator::Deformable(DeformableEstimator::new(e.config().relaxed(factor))),
            Estimator::Learned(e) => Estimator::Learned(e.relaxed(factor)),
            Estimator::Landmark(e) => Estimator::Landmark(LandmarkEstimator::new(e.config().relaxed(factor))),
        }
    }

    /// Estimate the transform from `moving` to `fixed`.
    pub fn estimate<B: AutodiffBackend>(
        &self,
        fixed: &Volume<B>,
        moving: &Volume<B>,
        init: Option<&Transform>,
        cancel: &CancellationToken,
    ) -> Result<Estimate> {
        self.run(&EstimateRequest::new(fixed, moving).with_init(init).with_cancel(cancel.clone()))
    }

    /// Estimate with a fully specified request.
    pub fn run<B: AutodiffBackend>(&self, request: &EstimateRequest<'_, B>) -> Result<Estimate> {
        match self {
            Estimator::Rigid(e) => e.estimate(request),
            Estimator::Affine(e) => e.estimate(request),
            Estimator::Deformable(e) => e.estimate(request),
            Estimator::Learned(e) => e.estimate(request),
            Estimator::Landmark(e) => e.estimate(request),
        }
    }
}

/// Initial transform plus the moving volume the correction is estimated on.
pub(crate) struct Prepared<B: Backend> {
    pub init: Transform,
    /// The moving volume, resampled onto the fixed grid when `init` is not the identity.
    pub moving: Volume<B>,
}

impl<B: Backend> Prepared<B> {
    /// Check spaces and pre-warp the moving volume through `init`.
    pub fn new(request: &EstimateRequest<'_, B>) -> Result<Self> {
        let fixed = request.fixed;
        let moving = request.moving;
        let init = request
            .init
            .cloned()
            .unwrap_or_else(|| Transform::identity_between(moving.space().clone(), fixed.space().clone()));
        init.check_spaces(moving.space(), fixed.space())?;

        if init.is_identity() {
            return Ok(Self {
                init,
                moving: moving.clone(),
            });
        }

        let warped = Resampler::new(Interpolation::Linear)
            .with_reference(fixed.geometry().clone())
            .apply(moving, &init)?
            .volume;
        Ok(Self { init, moving: warped })
    }

    /// Fold the estimated correction into the initial transform.
    ///
    /// `correction` maps the working moving space onto the fixed space.
    pub fn finish(&self, correction: Transform) -> Result<Transform> {
        if self.init.is_identity() {
            return Ok(correction);
        }
        Ok(compose(&self.init, &correction)?)
    }
}

/// Metric weights on `geometry` from an optional fixed-space mask.
///
/// Each grid point takes the nearest mask voxel; points outside the mask
/// grid are excluded.
pub(crate) fn mask_weights<B: Backend>(
    mask: Option<&Volume<B>>,
    fixed: &Volume<B>,
    geometry: &GridGeometry,
) -> Result<Vec<f32>> {
    let Some(mask) = mask else {
        return Ok(vec![1.0; geometry.len()]);
    };
    if mask.space() != fixed.space() {
        return Err(RegistrationError::incompatible_space(fixed.space(), mask.space()));
    }

    let values = mask.to_vec()?;
    let mask_geometry = mask.geometry();
    let shape = mask_geometry.shape();
    let weights: Vec<f32> = world_points(geometry)
        .iter()
        .map(|p| {
            let idx = mask_geometry.world_to_index(p);
            let mut ix = [0usize; 3];
            for a in 0..3 {
                let r = idx[a].round();
                if r < 0.0 || r > (shape[a] - 1) as f64 {
                    return 0.0;
                }
                ix[a] = r as usize;
            }
            if values[mask_geometry.offset(ix)] > 0.5 {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    if weights.iter().all(|&w| w == 0.0) {
        return Err(RegistrationError::invalid_configuration(
            "fixed mask excludes every voxel",
        ));
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use voxreg_core::{Point3, Spacing3};

    type B = NdArray<f32>;

    #[test]
    fn test_config_json_is_tagged_by_kind() {
        let json = r#"{"kind": "rigid", "dof": ["tx", "ty", "tz"], "optimizer": {"max_iterations": 25}}"#;
        let config: EstimatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), EstimatorKind::Rigid);
        match config {
            EstimatorConfig::Rigid(c) => {
                assert_eq!(c.optimizer.max_iterations, 25);
                assert_eq!(c.dof.len(), 3);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!(EstimatorKind::parse(" Affine "), Some(EstimatorKind::Affine));
        assert_eq!(EstimatorKind::parse("label"), Some(EstimatorKind::Landmark));
        assert_eq!(EstimatorKind::parse("bspline"), None);
    }

    #[test]
    fn test_learned_backend_must_be_registered() {
        let config = EstimatorConfig::Learned(LearnedConfig::default());
        let err = Estimator::from_config(&config, &HashMap::new()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_mask_weights_nearest() {
        let device = Default::default();
        let geometry = GridGeometry::unit([4, 4, 4]).unwrap();
        let fixed = Volume::<B>::zeros(geometry.clone(), "fixed".into(), &device);

        let mut values = vec![0.0f32; 64];
        values[geometry.offset([1, 1, 1])] = 1.0;
        let mask = fixed.with_values(values).unwrap();

        let coarse = GridGeometry::axis_aligned([2, 2, 2], Point3::new(1.0, 1.0, 1.0), Spacing3::repeat(2.0)).unwrap();
        let weights = mask_weights(Some(&mask), &fixed, &coarse).unwrap();
        assert_eq!(weights.iter().sum::<f32>(), 1.0);
        assert_eq!(weights[0], 1.0);
    }

    #[test]
    fn test_mask_in_wrong_space() {
        let device = Default::default();
        let geometry = GridGeometry::unit([2, 2, 2]).unwrap();
        let fixed = Volume::<B>::zeros(geometry.clone(), "fixed".into(), &device);
        let mask = Volume::<B>::zeros(geometry.clone(), "moving".into(), &device);
        let err = mask_weights(Some(&mask), &fixed, &geometry).unwrap_err();
        assert!(matches!(err, RegistrationError::IncompatibleSpace { .. }));
    }
}
