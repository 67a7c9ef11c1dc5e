//! Affine (twelve parameter) estimator.

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use tracing::info;
use voxreg_core::{AffineTransform, CoordinateSpace, Point3, Transform, Vector3};

use super::parametric::{about_center, center_of_mass_offset, optimize, LinearModel, OptimizerConfig};
use super::{mask_weights, Estimate, EstimateRequest, Prepared};
use crate::error::{RegistrationError, Result};

/// Affine estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AffineConfig {
    pub optimizer: OptimizerConfig,
    pub center_of_mass_init: bool,
}

impl AffineConfig {
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()
    }

    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            optimizer: self.optimizer.relaxed(factor),
            ..self.clone()
        }
    }
}

/// `x ↦ A (x - c) + c + t`; parameters are `A` row-major then `t`.
struct AffineModel {
    center: Point3,
    translation: Vector3,
}

impl LinearModel for AffineModel {
    fn initial(&self) -> Vec<f64> {
        let mut params = vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        params.extend_from_slice(self.translation.as_slice());
        params
    }

    fn scales(&self, radius: f64) -> Vec<f64> {
        let mut scales = vec![radius; 9];
        scales.extend_from_slice(&[1.0; 3]);
        scales
    }

    fn active(&self) -> Vec<bool> {
        vec![true; 12]
    }

    fn point_map<B: Backend>(&self, params: Tensor<B, 1>) -> Tensor<B, 1> {
        let p = |i: usize| params.clone().slice([i..i + 1]);
        let linear = [[p(0), p(1), p(2)], [p(3), p(4), p(5)], [p(6), p(7), p(8)]];
        about_center(linear, [p(9), p(10), p(11)], &self.center)
    }

    fn to_transform(&self, params: &[f64], source: CoordinateSpace, target: CoordinateSpace) -> Transform {
        let linear = Matrix3::from_row_slice(&params[..9]);
        let translation = Vector3::new(params[9], params[10], params[11]);
        Transform::affine(AffineTransform::about_center(&linear, &self.center, &translation), source, target)
    }
}

/// Affine estimator.
#[derive(Debug, Clone)]
pub struct AffineEstimator {
    config: AffineConfig,
}

impl AffineEstimator {
    pub fn new(config: AffineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AffineConfig {
        &self.config
    }

    pub fn estimate<B: AutodiffBackend>(&self, request: &EstimateRequest<'_, B>) -> Result<Estimate> {
        let prepared = Prepared::new(request)?;
        let fixed = request.fixed;

        let translation = if self.config.center_of_mass_init {
            center_of_mass_offset(fixed, &prepared.moving)?
        } else {
            Vector3::zeros()
        };
        let model = AffineModel {
            center: fixed.geometry().center(),
            translation,
        };

        let weights = mask_weights(request.fixed_mask, fixed, fixed.geometry())?;
        let fit = optimize(
            &model,
            fixed,
            &prepared.moving,
            &weights,
            &self.config.optimizer,
            &request.cancel,
            &request.progress,
        )?;

        let determinant = Matrix3::from_row_slice(&fit.params[..9]).determinant();
        if determinant <= 0.0 {
            return Err(RegistrationError::numerical_instability(format!(
                "affine estimate reflects or collapses space (det = {:.3e})",
                determinant
            )));
        }
        info!(
            step = request.progress.step(),
            iterations = fit.diagnostics.iterations,
            metric = ?fit.diagnostics.final_metric,
            determinant,
            "affine converged"
        );

        let correction = model.to_transform(&fit.params, prepared.moving.space().clone(), fixed.space().clone());
        Ok(Estimate {
            transform: prepared.finish(correction)?,
            diagnostics: fit.diagnostics,
        })
    }
}
