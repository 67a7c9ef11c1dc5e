//! Gradient-driven estimation of linear (rigid and affine) transforms.
//!
//! The fixed grid's physical points are pushed through the parameterized
//! point map and into the moving volume's index space as one tensor
//! expression, so `burn` autodiff differentiates the metric through the
//! trilinear sampler down to the transform parameters. Parameter updates
//! run on the host in `f64` with [`RegularStepGradientDescent`].

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use tracing::debug;
use voxreg_core::filter::GaussianFilter;
use voxreg_core::image::world_points;
use voxreg_core::interpolation::{Interpolator, LinearInterpolator};
use voxreg_core::{CoordinateSpace, Point3, Transform, Vector3, Volume};

use super::EstimateDiagnostics;
use crate::cancel::CancellationToken;
use crate::error::{RegistrationError, Result};
use crate::metric::{scalar_value, MetricKind};
use crate::optimizer::RegularStepGradientDescent;
use crate::progress::ProgressTracker;
use crate::validation::{validate_non_negative, validate_positive, validate_relaxation, validate_step_bounds};

/// Optimizer and metric settings shared by the rigid and affine estimators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub metric: MetricKind,
    /// Iteration cap; reaching it before convergence is a failure.
    pub max_iterations: usize,
    /// Initial step length in physical units.
    pub max_step: f64,
    /// Converged once the step length drops below this.
    pub min_step: f64,
    /// Step multiplier applied when the gradient reverses.
    pub relaxation: f64,
    /// Converged once the scaled gradient magnitude drops below this.
    pub gradient_tolerance: f64,
    /// Gaussian sigma (physical units) applied to both volumes first.
    pub smoothing_sigma: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            metric: MetricKind::Mse,
            max_iterations: 200,
            max_step: 1.0,
            min_step: 1e-3,
            relaxation: 0.5,
            gradient_tolerance: 1e-6,
            smoothing_sigma: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        validate_step_bounds(self.min_step, self.max_step)?;
        validate_relaxation(self.relaxation)?;
        validate_positive("gradient_tolerance", self.gradient_tolerance)?;
        validate_non_negative("smoothing_sigma", self.smoothing_sigma)
    }

    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            max_iterations: self.max_iterations.saturating_mul(2),
            min_step: (self.min_step * factor).min(self.max_step),
            gradient_tolerance: self.gradient_tolerance * factor,
            ..self.clone()
        }
    }
}

/// A linear transform family with a tensor-valued point map.
pub trait LinearModel {
    fn initial(&self) -> Vec<f64>;

    /// Per-parameter optimizer scales for a fixed image of `radius`.
    fn scales(&self, radius: f64) -> Vec<f64>;

    /// Which parameters the optimizer may move.
    fn active(&self) -> Vec<bool>;

    /// Row-major `[12]` point map `[A | b]` for `params`.
    fn point_map<B: Backend>(&self, params: Tensor<B, 1>) -> Tensor<B, 1>;

    fn to_transform(&self, params: &[f64], source: CoordinateSpace, target: CoordinateSpace) -> Transform;
}

/// `x ↦ A (x - c) + c + t` as a row-major `[12]` tensor.
pub(crate) fn about_center<B: Backend>(
    linear: [[Tensor<B, 1>; 3]; 3],
    translation: [Tensor<B, 1>; 3],
    center: &Point3,
) -> Tensor<B, 1> {
    let mut parts = Vec::with_capacity(12);
    for (a, row) in linear.into_iter().enumerate() {
        let mut offset = translation[a].clone().add_scalar(center[a]);
        for (b, entry) in row.into_iter().enumerate() {
            offset = offset - entry.clone().mul_scalar(center[b]);
            parts.push(entry);
        }
        parts.push(offset);
    }
    Tensor::cat(parts, 0)
}

/// Translation that maps the fixed centre of mass onto the moving one.
pub(crate) fn center_of_mass_offset<B: Backend>(fixed: &Volume<B>, moving: &Volume<B>) -> Result<Vector3> {
    match (fixed.center_of_mass()?, moving.center_of_mass()?) {
        (Some(f), Some(m)) => Ok(m - f),
        _ => Ok(Vector3::zeros()),
    }
}

/// Converged parameters plus diagnostics.
pub(crate) struct LinearFit {
    pub params: Vec<f64>,
    pub diagnostics: EstimateDiagnostics,
}

/// Metric value and gradient at fixed parameters.
struct Evaluation {
    value: f64,
    gradient: Vec<f64>,
}

/// Fixed-grid tensors reused by every evaluation.
struct Problem<B: AutodiffBackend> {
    /// `[N, 4]` homogeneous physical points of the fixed grid.
    points: Tensor<B, 2>,
    fixed_values: Tensor<B, 1>,
    mask: Tensor<B, 1>,
    moving: Tensor<B, 3>,
    /// `[3, 3]` moving world-to-index matrix.
    to_index: Tensor<B, 2>,
    /// `[3, 4]` constant removed after mapping so the moving origin lands on index zero.
    origin_shift: Tensor<B, 2>,
    shape: [usize; 3],
    metric: MetricKind,
}

impl<B: AutodiffBackend> Problem<B> {
    fn new(fixed: &Volume<B>, moving: &Volume<B>, weights: &[f32], metric: MetricKind) -> Self {
        let device = fixed.device();
        let n = fixed.geometry().len();

        let mut flat = Vec::with_capacity(n * 4);
        for p in world_points(fixed.geometry()) {
            flat.extend_from_slice(&[p.x as f32, p.y as f32, p.z as f32, 1.0]);
        }
        let points = Tensor::<B, 2>::from_data(TensorData::new(flat, [n, 4]), &device);

        let w = moving.geometry().world_to_index_matrix();
        let to_index: Vec<f32> = (0..9).map(|i| w[(i / 3, i % 3)] as f32).collect();
        let shifted = w * moving.geometry().origin().coords;
        let mut shift = vec![0.0f32; 12];
        for a in 0..3 {
            shift[a * 4 + 3] = shifted[a] as f32;
        }

        Self {
            points,
            fixed_values: fixed.data().clone().reshape([n]),
            mask: Tensor::<B, 1>::from_data(TensorData::new(weights.to_vec(), [n]), &device),
            moving: moving.data().clone(),
            to_index: Tensor::<B, 2>::from_data(TensorData::new(to_index, [3, 3]), &device),
            origin_shift: Tensor::<B, 2>::from_data(TensorData::new(shift, [3, 4]), &device),
            shape: moving.shape(),
            metric,
        }
    }

    fn evaluate<M: LinearModel>(&self, model: &M, params: &[f64]) -> Result<Evaluation> {
        let device = self.points.device();
        let host: Vec<f32> = params.iter().map(|&p| p as f32).collect();
        let theta = Tensor::<B, 1>::from_data(TensorData::new(host, [params.len()]), &device).require_grad();

        // index = W (P x - o), folded into one [3, 4] map.
        let map = model.point_map(theta.clone()).reshape([3, 4]);
        let index_map = self.to_index.clone().matmul(map) - self.origin_shift.clone();
        let indices = self.points.clone().matmul(index_map.transpose());

        let n = indices.dims()[0];
        let mut inside = Tensor::<B, 1>::ones([n], &device);
        for a in 0..3 {
            let axis = indices.clone().narrow(1, a, 1).reshape([n]);
            let upper = self.shape[a] as f64 - 0.5;
            inside = inside
                * axis.clone().greater_equal_elem(-0.5).float()
                * axis.lower_equal_elem(upper).float();
        }

        let sampled = LinearInterpolator.interpolate(&self.moving, indices);
        let loss = self
            .metric
            .forward(self.fixed_values.clone(), sampled, inside * self.mask.clone());

        let value = scalar_value(loss.clone())?;
        let grads = loss.backward();
        let gradient = match theta.grad(&grads) {
            Some(g) => g
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| RegistrationError::numerical_instability(format!("gradient readback failed: {:?}", e)))?
                .into_iter()
                .map(f64::from)
                .collect(),
            None => vec![0.0; params.len()],
        };
        if gradient.iter().any(|g: &f64| !g.is_finite()) {
            return Err(RegistrationError::numerical_instability("non-finite metric gradient"));
        }
        Ok(Evaluation { value, gradient })
    }
}

/// Optimize `model` until convergence or the iteration cap.
///
/// `weights` holds one metric weight per fixed voxel.
pub(crate) fn optimize<B: AutodiffBackend, M: LinearModel>(
    model: &M,
    fixed: &Volume<B>,
    moving: &Volume<B>,
    weights: &[f32],
    config: &OptimizerConfig,
    cancel: &CancellationToken,
    progress: &ProgressTracker,
) -> Result<LinearFit> {
    let (fixed, moving) = if config.smoothing_sigma > 0.0 {
        let smoother = GaussianFilter::isotropic(config.smoothing_sigma);
        (smoother.apply(fixed)?, smoother.apply(moving)?)
    } else {
        (fixed.clone(), moving.clone())
    };

    let problem = Problem::new(&fixed, &moving, weights, config.metric);
    let mut optimizer = RegularStepGradientDescent::new(
        model.scales(fixed.geometry().radius()),
        config.max_step,
        config.min_step,
        config.relaxation,
        config.gradient_tolerance,
    )
    .with_active(model.active());

    let mut params = model.initial();
    let mut initial_metric = None;
    let mut last_step = None;

    for iteration in 0..config.max_iterations {
        cancel.check("linear optimization")?;

        let eval = problem.evaluate(model, &params)?;
        initial_metric.get_or_insert(eval.value);

        let report = optimizer.step(&mut params, &eval.gradient);
        progress.update(None, iteration + 1, Some(config.max_iterations), eval.value, report.step_length);
        if iteration % 10 == 0 {
            debug!(
                step = progress.step(),
                iteration,
                metric = eval.value,
                step_length = report.step_length,
                gradient = report.gradient_magnitude,
                "linear optimization"
            );
        }

        if let Some(reason) = report.converged {
            return Ok(LinearFit {
                params,
                diagnostics: EstimateDiagnostics {
                    metric: Some(config.metric.name().to_string()),
                    initial_metric,
                    final_metric: Some(eval.value),
                    iterations: iteration + 1,
                    last_step,
                    stop_reason: Some(format!("{:?}", reason)),
                    ..Default::default()
                },
            });
        }
        if params.iter().any(|p| !p.is_finite()) {
            return Err(RegistrationError::numerical_instability("parameters became non-finite"));
        }
        last_step = Some(report.step_length);
    }

    Err(RegistrationError::convergence_failure(format!(
        "{} iterations without convergence (step length {:.3e}, min step {:.3e})",
        config.max_iterations,
        optimizer.step_length(),
        config.min_step
    )))
}
