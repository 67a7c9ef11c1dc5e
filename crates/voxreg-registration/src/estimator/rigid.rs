//! Rigid (six degrees of freedom) estimator.

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::info;
use voxreg_core::{CoordinateSpace, Point3, RigidTransform, Transform, Vector3};

use super::parametric::{about_center, center_of_mass_offset, optimize, LinearModel, OptimizerConfig};
use super::{mask_weights, Estimate, EstimateRequest, Prepared};
use crate::error::Result;
use crate::validation::{validate_dof, DOF_NAMES};

/// Rigid estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigidConfig {
    pub optimizer: OptimizerConfig,
    /// Free parameters among `tx ty tz rx ry rz`.
    pub dof: Vec<String>,
    /// Start from the translation aligning the two centres of mass.
    pub center_of_mass_init: bool,
}

impl Default for RigidConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            dof: DOF_NAMES.iter().map(|s| s.to_string()).collect(),
            center_of_mass_init: false,
        }
    }
}

impl RigidConfig {
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        validate_dof(&self.dof)
    }

    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            optimizer: self.optimizer.relaxed(factor),
            ..self.clone()
        }
    }

    /// Restrict the free parameters.
    pub fn with_dof(mut self, dof: &[&str]) -> Self {
        self.dof = dof.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Euler angles `[rx, ry, rz]` (`R = Rz Ry Rx`) about a center, then translation.
///
/// Parameter order is `[rx, ry, rz, tx, ty, tz]`.
struct RigidModel {
    center: Point3,
    translation: Vector3,
    active: Vec<bool>,
}

impl LinearModel for RigidModel {
    fn initial(&self) -> Vec<f64> {
        vec![0.0, 0.0, 0.0, self.translation.x, self.translation.y, self.translation.z]
    }

    fn scales(&self, radius: f64) -> Vec<f64> {
        vec![radius, radius, radius, 1.0, 1.0, 1.0]
    }

    fn active(&self) -> Vec<bool> {
        self.active.clone()
    }

    fn point_map<B: Backend>(&self, params: Tensor<B, 1>) -> Tensor<B, 1> {
        let p = |i: usize| params.clone().slice([i..i + 1]);
        let (sx, cx) = (p(0).sin(), p(0).cos());
        let (sy, cy) = (p(1).sin(), p(1).cos());
        let (sz, cz) = (p(2).sin(), p(2).cos());

        let linear = [
            [
                cz.clone() * cy.clone(),
                cz.clone() * sy.clone() * sx.clone() - sz.clone() * cx.clone(),
                cz.clone() * sy.clone() * cx.clone() + sz.clone() * sx.clone(),
            ],
            [
                sz.clone() * cy.clone(),
                sz.clone() * sy.clone() * sx.clone() + cz.clone() * cx.clone(),
                sz * sy.clone() * cx.clone() - cz * sx.clone(),
            ],
            [sy.neg(), cy.clone() * sx, cy * cx],
        ];
        about_center(linear, [p(3), p(4), p(5)], &self.center)
    }

    fn to_transform(&self, params: &[f64], source: CoordinateSpace, target: CoordinateSpace) -> Transform {
        let rigid = RigidTransform::from_euler(
            [params[0], params[1], params[2]],
            &self.center,
            Vector3::new(params[3], params[4], params[5]),
        );
        Transform::rigid(rigid, source, target)
    }
}

/// Rigid estimator.
#[derive(Debug, Clone)]
pub struct RigidEstimator {
    config: RigidConfig,
}

impl RigidEstimator {
    pub fn new(config: RigidConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RigidConfig {
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
        let order = ["rx", "ry", "rz", "tx", "ty", "tz"];
        let model = RigidModel {
            center: fixed.geometry().center(),
            translation,
            active: order.iter().map(|n| self.config.dof.iter().any(|d| d == n)).collect(),
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

        let p = &fit.params;
        info!(
            step = request.progress.step(),
            iterations = fit.diagnostics.iterations,
            metric = ?fit.diagnostics.final_metric,
            "rigid converged: angles [{:.4}, {:.4}, {:.4}] translation [{:.3}, {:.3}, {:.3}]",
            p[0], p[1], p[2], p[3], p[4], p[5]
        );

        let correction = model.to_transform(p, prepared.moving.space().clone(), fixed.space().clone());
        Ok(Estimate {
            transform: prepared.finish(correction)?,
            diagnostics: fit.diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use voxreg_core::transform::rigid::euler_zyx;

    type B = NdArray<f32>;

    #[test]
    fn test_tensor_rotation_matches_host() {
        let device = Default::default();
        let angles = [0.3, -0.2, 0.7];
        let model = RigidModel {
            center: Point3::new(1.0, 2.0, 3.0),
            translation: Vector3::zeros(),
            active: vec![true; 6],
        };
        let params = [angles[0], angles[1], angles[2], 0.5, -1.0, 2.0];
        let tensor = Tensor::<B, 1>::from_floats(params.map(|v| v as f32), &device);
        let map = model.point_map(tensor).into_data().to_vec::<f32>().unwrap();

        let host = RigidTransform::from_euler(angles, &model.center, Vector3::new(0.5, -1.0, 2.0));
        let rotation = euler_zyx(angles);
        for a in 0..3 {
            for b in 0..3 {
                assert!((map[a * 4 + b] as f64 - rotation[(a, b)]).abs() < 1e-5);
            }
            assert!((map[a * 4 + 3] as f64 - host.translation()[a]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_dof_validation() {
        let config = RigidConfig::default().with_dof(&["tx", "ty", "bad"]);
        assert!(config.validate().is_err());
        assert!(RigidConfig::default().with_dof(&["tx", "rz"]).validate().is_ok());
    }
}
