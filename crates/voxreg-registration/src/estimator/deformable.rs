//! Dense deformable estimator.
//!
//! Multi-resolution demons: at every level the fixed-image intensity
//! gradient drives a per-voxel force, the force is added to the field and
//! the field is regularized with a Gaussian. Levels run coarse to fine and
//! each level starts from the previous level's field.

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use voxreg_core::filter::{GaussianFilter, MultiResolutionPyramid};
use voxreg_core::image::grid::indices_to_tensor;
use voxreg_core::image::world_points;
use voxreg_core::{
    DisplacementField, FieldInterpolation, GridGeometry, Interpolation, Point3, Transform, Vector3, Volume,
};

use super::{mask_weights, Estimate, EstimateDiagnostics, EstimateRequest, LevelDiagnostics, Prepared};
use crate::error::{RegistrationError, Result};
use crate::validation::{validate_non_negative, validate_positive, validate_schedule};

/// Deformable estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeformableConfig {
    /// Per-level shrink factors, coarsest first.
    pub shrink_factors: Vec<[usize; 3]>,
    /// Per-level image smoothing (physical units).
    pub smoothing_sigmas: Vec<[f64; 3]>,
    /// Per-level iteration caps.
    pub iterations: Vec<usize>,
    /// Gaussian regularization of the field (physical units).
    pub field_sigma: f64,
    /// A level converges once the RMS field change drops below this (physical units).
    pub tolerance: f64,
    /// A level also stops once the metric improved by less than this
    /// fraction over the last `convergence_window` iterations.
    pub metric_tolerance: f64,
    pub convergence_window: usize,
    /// Voxels whose intensity difference is below this get no force.
    pub intensity_threshold: f64,
    /// Largest per-iteration update, in units of the level's smallest spacing.
    pub max_step_length: f64,
}

impl Default for DeformableConfig {
    fn default() -> Self {
        Self {
            shrink_factors: vec![[4; 3], [2; 3], [1; 3]],
            smoothing_sigmas: vec![[2.0; 3], [1.0; 3], [0.0; 3]],
            iterations: vec![100, 50, 25],
            field_sigma: 1.0,
            tolerance: 1e-2,
            metric_tolerance: 1e-3,
            convergence_window: 10,
            intensity_threshold: 1e-3,
            max_step_length: 0.5,
        }
    }
}

impl DeformableConfig {
    /// Single full-resolution level with `iterations` iterations.
    pub fn single_level(iterations: usize) -> Self {
        Self {
            shrink_factors: vec![[1; 3]],
            smoothing_sigmas: vec![[0.0; 3]],
            iterations: vec![iterations],
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_schedule(&self.shrink_factors, &self.smoothing_sigmas, &self.iterations)?;
        validate_non_negative("field_sigma", self.field_sigma)?;
        validate_positive("tolerance", self.tolerance)?;
        validate_non_negative("metric_tolerance", self.metric_tolerance)?;
        validate_non_negative("intensity_threshold", self.intensity_threshold)?;
        if self.convergence_window == 0 {
            return Err(RegistrationError::invalid_configuration(
                "convergence_window must be at least 1",
            ));
        }
        validate_positive("max_step_length", self.max_step_length)
    }

    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            iterations: self.iterations.iter().map(|n| n.saturating_mul(2)).collect(),
            tolerance: self.tolerance * factor,
            metric_tolerance: self.metric_tolerance * factor,
            ..self.clone()
        }
    }
}

/// Deformable estimator.
#[derive(Debug, Clone)]
pub struct DeformableEstimator {
    config: DeformableConfig,
}

/// Gradient energy below this fraction of the intensity term gives no force.
const GRADIENT_FLOOR: f64 = 1e-2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelStop {
    Tolerance,
    Stagnation,
    IterationCap,
}

impl LevelStop {
    fn as_str(self) -> &'static str {
        match self {
            LevelStop::Tolerance => "tolerance",
            LevelStop::Stagnation => "stagnation",
            LevelStop::IterationCap => "iteration_cap",
        }
    }
}

/// Relative metric improvement over the last `window` iterations fell below `tolerance`.
fn stagnated(history: &[f64], window: usize, tolerance: f64) -> bool {
    if history.len() <= window {
        return false;
    }
    let past = history[history.len() - 1 - window];
    let now = history[history.len() - 1];
    if !past.is_finite() || !now.is_finite() {
        return false;
    }
    if past <= f64::EPSILON {
        return true;
    }
    (past - now) / past < tolerance
}

/// Moving intensities sampled through a field, plus which samples fell inside.
struct Warped {
    values: Vec<f32>,
    inside: Vec<bool>,
}

impl DeformableEstimator {
    pub fn new(config: DeformableConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeformableConfig {
        &self.config
    }

    pub fn estimate<B: AutodiffBackend>(&self, request: &EstimateRequest<'_, B>) -> Result<Estimate> {
        let config = &self.config;
        let prepared = Prepared::new(request)?;
        let fixed = request.fixed;
        let moving = &prepared.moving;

        let fixed_pyramid = MultiResolutionPyramid::new(fixed, &config.shrink_factors, &config.smoothing_sigmas)?;
        let moving_pyramid = MultiResolutionPyramid::new(moving, &config.shrink_factors, &config.smoothing_sigmas)?;

        let mut field: Option<DisplacementField> = None;
        let mut levels = Vec::with_capacity(fixed_pyramid.len());
        let mut total_iterations = 0;
        let mut last_step = None;
        let mut final_stop = LevelStop::IterationCap;

        for (level, (f, m)) in fixed_pyramid.iter().zip(moving_pyramid.iter()).enumerate() {
            request.cancel.check(&format!("deformable level {}", level))?;
            let geometry = f.geometry().clone();
            info!(step = request.progress.step(), level, shape = ?geometry.shape(), "deformable level");

            let points = world_points(&geometry);
            let mut u: Vec<Vector3> = match &field {
                Some(prev) => points
                    .iter()
                    .map(|p| prev.sample_extended(p, FieldInterpolation::Linear))
                    .collect(),
                None => vec![Vector3::zeros(); points.len()],
            };

            let fixed_values = f.to_vec()?;
            let gradient = physical_gradient(&fixed_values, &geometry);
            let weights = mask_weights(request.fixed_mask, fixed, &geometry)?;
            let normalizer = geometry.spacing().norm_squared() / 3.0;
            let max_length = config.max_step_length * geometry.min_spacing();
            let cap = config.iterations[level];

            if cap == 0 {
                return Err(RegistrationError::convergence_failure(format!(
                    "deformable level {} has no iterations",
                    level
                )));
            }

            let mut history: Vec<f64> = Vec::with_capacity(cap);
            let mut best: Option<(f64, Vec<Vector3>)> = None;
            let mut stop = LevelStop::IterationCap;
            let mut iterations = cap;
            let mut max_update = 0.0;
            for iteration in 0..cap {
                request.cancel.check(&format!("deformable level {} iteration {}", level, iteration))?;

                let warped = warp(m, &points, &u)?;
                let metric = masked_mse(&fixed_values, &warped, &weights).unwrap_or(f64::NAN);
                if best.as_ref().map_or(true, |(b, _)| metric < *b || b.is_nan()) {
                    best = Some((metric, u.clone()));
                }
                history.push(metric);

                let mut update = vec![Vector3::zeros(); u.len()];
                for i in 0..u.len() {
                    if weights[i] == 0.0 || !warped.inside[i] {
                        continue;
                    }
                    let diff = (fixed_values[i] - warped.values[i]) as f64;
                    if diff.abs() < config.intensity_threshold {
                        continue;
                    }
                    let g = gradient[i];
                    let g2 = g.norm_squared();
                    let d2 = diff * diff / normalizer;
                    // Flat regions carry no reliable direction.
                    if g2 < GRADIENT_FLOOR * d2 || g2 + d2 < 1e-12 {
                        continue;
                    }
                    let mut du = g * (diff / (g2 + d2));
                    let len = du.norm();
                    if len > max_length {
                        du *= max_length / len;
                    }
                    update[i] = du;
                }

                let candidate: Vec<Vector3> = u.iter().zip(&update).map(|(a, b)| a + b).collect();
                let smoothed = smooth_field::<B>(candidate, &geometry, config.field_sigma, &f.device())?;
                let (sum_sq, largest) = smoothed
                    .iter()
                    .zip(&u)
                    .map(|(a, b)| (a - b).norm())
                    .fold((0.0, 0.0f64), |(s, l), d| (s + d * d, l.max(d)));
                let rms = (sum_sq / u.len().max(1) as f64).sqrt();
                u = smoothed;

                total_iterations += 1;
                last_step = Some(rms);
                max_update = largest;
                request.progress.update(Some(level), iteration + 1, Some(cap), metric, rms);
                if iteration % 10 == 0 {
                    debug!(level, iteration, metric, rms_update = rms, max_update = largest, "demons iteration");
                }
                if !rms.is_finite() {
                    return Err(RegistrationError::numerical_instability(format!(
                        "field update diverged at level {}",
                        level
                    )));
                }
                if rms < config.tolerance {
                    stop = LevelStop::Tolerance;
                } else if stagnated(&history, config.convergence_window, config.metric_tolerance) {
                    stop = LevelStop::Stagnation;
                }
                if stop != LevelStop::IterationCap {
                    iterations = iteration + 1;
                    break;
                }
            }

            // The last update has not been scored yet.
            let last = masked_mse(&fixed_values, &warp(m, &points, &u)?, &weights).unwrap_or(f64::NAN);
            let (metric, u) = match best {
                Some((b, kept)) if b < last || last.is_nan() => (b, kept),
                _ => (last, u),
            };

            let start = history[0];
            if stop == LevelStop::IterationCap {
                if start > f64::EPSILON && !(metric < start) {
                    return Err(RegistrationError::convergence_failure(format!(
                        "deformable level {} made no progress in {} iterations (mse {:.3e})",
                        level, cap, start
                    )));
                }
                warn!(
                    step = request.progress.step(),
                    level,
                    cap,
                    start_metric = start,
                    metric,
                    "deformable level reached its iteration cap, keeping the best field"
                );
            }
            final_stop = stop;
            levels.push(LevelDiagnostics {
                level,
                shape: geometry.shape(),
                iterations,
                max_update,
                metric,
                stop_reason: stop.as_str().to_string(),
            });
            field = Some(DisplacementField::new(geometry, u)?);
        }

        let coarse = field.ok_or_else(|| RegistrationError::invalid_configuration("schedule has no levels"))?;
        let field = if coarse.geometry() == fixed.geometry() {
            coarse
        } else {
            DisplacementField::from_fn(fixed.geometry().clone(), |p| {
                coarse.sample_extended(p, FieldInterpolation::Linear)
            })?
        };

        let folding = field.folding_report();
        if folding.is_folded() {
            warn!(
                step = request.progress.step(),
                folded_voxels = folding.folded_voxels,
                min_jacobian = folding.min_jacobian,
                "deformation field folds"
            );
        }

        let full_points = world_points(fixed.geometry());
        let weights = mask_weights(request.fixed_mask, fixed, fixed.geometry())?;
        let fixed_values = fixed.to_vec()?;
        let zero = vec![Vector3::zeros(); full_points.len()];
        let initial_metric = masked_mse(&fixed_values, &warp(moving, &full_points, &zero)?, &weights);
        let final_metric = masked_mse(&fixed_values, &warp(moving, &full_points, field.vectors())?, &weights);

        info!(
            step = request.progress.step(),
            iterations = total_iterations,
            max_displacement = field.max_magnitude(),
            min_jacobian = folding.min_jacobian,
            stop_reason = final_stop.as_str(),
            "deformable finished"
        );

        let correction = Transform::dense_field(field, moving.space().clone(), fixed.space().clone());
        Ok(Estimate {
            transform: prepared.finish(correction)?,
            diagnostics: EstimateDiagnostics {
                metric: Some("mse".to_string()),
                initial_metric,
                final_metric,
                iterations: total_iterations,
                last_step,
                stop_reason: Some(final_stop.as_str().to_string()),
                min_jacobian: Some(folding.min_jacobian),
                folded_voxels: Some(folding.folded_voxels),
                levels,
            },
        })
    }
}

/// Sample `moving` at `p + u(p)` for every grid point.
fn warp<B: Backend>(moving: &Volume<B>, points: &[Point3], u: &[Vector3]) -> Result<Warped> {
    let geometry = moving.geometry();
    let shape = geometry.shape();
    let mut indices = Vec::with_capacity(points.len());
    let mut inside = Vec::with_capacity(points.len());
    for (p, d) in points.iter().zip(u) {
        let idx = geometry.world_to_index(&(p + d));
        inside.push((0..3).all(|a| idx[a] >= -0.5 && idx[a] <= shape[a] as f64 - 0.5));
        indices.push([idx[0], idx[1], idx[2]]);
    }
    let device = moving.device();
    let values = Interpolation::Linear
        .sample(moving.data(), indices_to_tensor::<B>(&indices, &device))
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| RegistrationError::numerical_instability(format!("tensor readback failed: {:?}", e)))?;
    Ok(Warped { values, inside })
}

fn masked_mse(fixed: &[f32], warped: &Warped, weights: &[f32]) -> Option<f64> {
    let mut sse = 0.0;
    let mut count = 0usize;
    for i in 0..fixed.len() {
        if weights[i] > 0.0 && warped.inside[i] {
            let d = (fixed[i] - warped.values[i]) as f64;
            sse += d * d;
            count += 1;
        }
    }
    (count > 0).then(|| sse / count as f64)
}

/// Intensity gradient in physical units at every voxel.
///
/// Central differences in index space, one-sided at the borders, mapped to
/// physical space through the transposed world-to-index matrix.
fn physical_gradient(values: &[f32], geometry: &GridGeometry) -> Vec<Vector3> {
    let shape = geometry.shape();
    let to_index_t = geometry.world_to_index_matrix().transpose();
    (0..geometry.len())
        .map(|offset| {
            let index = geometry.unravel(offset);
            let mut g = Vector3::zeros();
            for a in 0..3 {
                if shape[a] < 2 {
                    continue;
                }
                let mut prev = index;
                let mut next = index;
                let mut h = 0.0;
                if index[a] > 0 {
                    prev[a] -= 1;
                    h += 1.0;
                }
                if index[a] + 1 < shape[a] {
                    next[a] += 1;
                    h += 1.0;
                }
                g[a] = (values[geometry.offset(next)] - values[geometry.offset(prev)]) as f64 / h;
            }
            to_index_t * g
        })
        .collect()
}

/// Gaussian smoothing of each field component.
fn smooth_field<B: Backend>(
    vectors: Vec<Vector3>,
    geometry: &GridGeometry,
    sigma: f64,
    device: &B::Device,
) -> Result<Vec<Vector3>> {
    if sigma <= 0.0 {
        return Ok(vectors);
    }
    let filter = GaussianFilter::isotropic(sigma);
    let shape = geometry.shape();
    let mut out = vec![Vector3::zeros(); vectors.len()];
    for a in 0..3 {
        let component: Vec<f32> = vectors.iter().map(|v| v[a] as f32).collect();
        let tensor = Tensor::<B, 3>::from_data(TensorData::new(component, shape), device);
        let smoothed = filter
            .apply_tensor(tensor, geometry.spacing())
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| RegistrationError::numerical_instability(format!("tensor readback failed: {:?}", e)))?;
        for (v, s) in out.iter_mut().zip(smoothed) {
            v[a] = s as f64;
        }
    }
    Ok(out)
}
