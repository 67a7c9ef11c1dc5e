//! Landmark estimator.
//!
//! Labels present in both the fixed and the moving label map are matched by
//! value; each label's centroid is one landmark. A rigid, similarity or
//! affine transform is then fitted to the landmark pairs in closed form.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use nalgebra::{Matrix3, Rotation3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use voxreg_core::{invert, AffineTransform, Point3, RigidTransform, Transform, Vector3, Volume};

use super::{Estimate, EstimateDiagnostics, EstimateRequest};
use crate::error::{RegistrationError, Result};

/// Smallest accepted ratio between the weakest and strongest spread of the
/// fixed landmarks along a principal axis.
const SPREAD_RATIO: f64 = 1e-9;

/// Transform family fitted to the landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LandmarkModel {
    #[default]
    Rigid,
    /// Rigid plus one isotropic scale.
    Similarity,
    Affine,
}

impl LandmarkModel {
    fn min_landmarks(self) -> usize {
        match self {
            LandmarkModel::Rigid | LandmarkModel::Similarity => 3,
            LandmarkModel::Affine => 4,
        }
    }
}

/// Landmark estimator configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkConfig {
    pub model: LandmarkModel,
    /// Labels to match; empty matches every label found in both maps.
    pub labels: Vec<u32>,
    /// Largest accepted RMS landmark residual in physical units.
    pub max_residual: Option<f64>,
}

impl LandmarkConfig {
    pub fn new(model: LandmarkModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.labels.contains(&0) {
            return Err(RegistrationError::invalid_configuration(
                "label 0 is background and cannot be a landmark",
            ));
        }
        match self.max_residual {
            Some(r) if !(r > 0.0 && r.is_finite()) => Err(RegistrationError::invalid_configuration(format!(
                "max_residual must be positive and finite, got {}",
                r
            ))),
            _ => Ok(()),
        }
    }

    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            max_residual: self.max_residual.map(|r| r * factor),
            ..self.clone()
        }
    }
}

/// Physical centroid of every non-zero label.
///
/// Sample values are rounded to the nearest integer; negative values count
/// as background.
pub fn label_centroids<B: Backend>(labels: &Volume<B>) -> Result<BTreeMap<u32, Point3>> {
    let values = labels.to_vec()?;
    let geometry = labels.geometry();
    let mut sums: BTreeMap<u32, (Vector3, usize)> = BTreeMap::new();
    for (offset, &v) in values.iter().enumerate() {
        let label = v.round();
        if !(label >= 1.0) || !label.is_finite() {
            continue;
        }
        let [i, j, k] = geometry.unravel(offset);
        let entry = sums.entry(label as u32).or_insert((Vector3::zeros(), 0));
        entry.0 += Vector3::new(i as f64, j as f64, k as f64);
        entry.1 += 1;
    }
    Ok(sums
        .into_iter()
        .map(|(label, (sum, count))| (label, geometry.index_to_world(&(sum / count as f64))))
        .collect())
}

/// Closed-form landmark estimator.
#[derive(Debug, Clone)]
pub struct LandmarkEstimator {
    config: LandmarkConfig,
}

impl LandmarkEstimator {
    pub fn new(config: LandmarkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LandmarkConfig {
        &self.config
    }

    pub fn estimate<B: Backend>(&self, request: &EstimateRequest<'_, B>) -> Result<Estimate> {
        request.cancel.check("landmark")?;
        let config = &self.config;
        let fixed = request.fixed;
        let moving = request.moving;
        let init = request
            .init
            .cloned()
            .unwrap_or_else(|| Transform::identity_between(moving.space().clone(), fixed.space().clone()));
        init.check_spaces(moving.space(), fixed.space())?;

        let fixed_points = label_centroids(label_map(request.fixed_labels, fixed, "fixed")?)?;
        let moving_points = label_centroids(label_map(request.moving_labels, moving, "moving")?)?;

        // Moving landmarks are carried back through `init` so the fit is the
        // correction applied before it.
        let back = if init.is_identity() { None } else { Some(invert(&init)?) };
        let pairs: Vec<(Point3, Point3)> = fixed_points
            .iter()
            .filter(|(label, _)| config.labels.is_empty() || config.labels.contains(*label))
            .filter_map(|(label, p)| moving_points.get(label).map(|q| (*p, *q)))
            .map(|(p, q)| (p, back.as_ref().map_or(q, |t| t.transform_point(&q))))
            .collect();
        debug!(
            fixed_labels = fixed_points.len(),
            moving_labels = moving_points.len(),
            matched = pairs.len(),
            "landmarks matched"
        );

        let needed = config.model.min_landmarks();
        if pairs.len() < needed {
            return Err(RegistrationError::invalid_volume(format!(
                "{:?} landmark fit needs {} matched labels, found {}",
                config.model,
                needed,
                pairs.len()
            )));
        }

        let (linear, translation) = match config.model {
            LandmarkModel::Rigid => fit_similarity(&pairs, false)?,
            LandmarkModel::Similarity => fit_similarity(&pairs, true)?,
            LandmarkModel::Affine => fit_affine(&pairs)?,
        };
        let initial = rms(&pairs, &Matrix3::identity(), &Vector3::zeros());
        let residual = rms(&pairs, &linear, &translation);

        if let Some(limit) = config.max_residual {
            if residual > limit {
                return Err(RegistrationError::convergence_failure(format!(
                    "landmark residual {:.3e} exceeds {:.3e}",
                    residual, limit
                )));
            }
        }
        if !(linear.determinant() > 0.0) {
            return Err(RegistrationError::numerical_instability(format!(
                "landmark fit reflects or collapses space (det = {:.3e})",
                linear.determinant()
            )));
        }

        let source = if init.is_identity() { moving.space() } else { fixed.space() };
        let correction = match config.model {
            LandmarkModel::Rigid => Transform::rigid(
                RigidTransform::new(Rotation3::from_matrix_unchecked(linear), translation),
                source.clone(),
                fixed.space().clone(),
            ),
            _ => Transform::affine(
                AffineTransform::from_parts(&linear, &translation),
                source.clone(),
                fixed.space().clone(),
            ),
        };
        let transform = if init.is_identity() {
            correction
        } else {
            voxreg_core::compose(&init, &correction)?
        };

        info!(
            step = request.progress.step(),
            model = ?config.model,
            landmarks = pairs.len(),
            residual,
            "landmark fit"
        );
        Ok(Estimate {
            transform,
            diagnostics: EstimateDiagnostics {
                metric: Some("landmark_rms".to_string()),
                initial_metric: Some(initial),
                final_metric: Some(residual),
                iterations: 0,
                last_step: None,
                stop_reason: Some("closed_form".to_string()),
                min_jacobian: None,
                folded_voxels: None,
                levels: Vec::new(),
            },
        })
    }
}

/// The explicit label map, or the volume itself when it is one.
fn label_map<'a, B: Backend>(
    labels: Option<&'a Volume<B>>,
    volume: &'a Volume<B>,
    role: &str,
) -> Result<&'a Volume<B>> {
    let labels = match labels {
        Some(labels) => labels,
        None if volume.is_label() => volume,
        None => {
            return Err(RegistrationError::invalid_configuration(format!(
                "landmark estimation needs a {} label map",
                role
            )))
        }
    };
    if labels.space() != volume.space() {
        return Err(RegistrationError::incompatible_space(volume.space(), labels.space()));
    }
    Ok(labels)
}

fn centroids(pairs: &[(Point3, Point3)]) -> (Vector3, Vector3) {
    let n = pairs.len() as f64;
    let (p, q) = pairs
        .iter()
        .fold((Vector3::zeros(), Vector3::zeros()), |(a, b), (p, q)| (a + p.coords, b + q.coords));
    (p / n, q / n)
}

/// Fail unless the fixed landmarks span at least `dims` principal axes.
fn check_spread(covariance: &Matrix3<f64>, dims: usize) -> Result<()> {
    let mut eigen: Vec<f64> = covariance.symmetric_eigenvalues().iter().copied().collect();
    eigen.sort_by(|a, b| b.total_cmp(a));
    if !(eigen[0] > 0.0) || eigen[dims - 1] <= SPREAD_RATIO * eigen[0] {
        let shape = if dims == 2 { "collinear" } else { "coplanar" };
        return Err(RegistrationError::invalid_volume(format!("landmarks are {}", shape)));
    }
    Ok(())
}

/// Least squares `x ↦ s R x + t`, with `s = 1` unless `scaled`.
fn fit_similarity(pairs: &[(Point3, Point3)], scaled: bool) -> Result<(Matrix3<f64>, Vector3)> {
    let (cp, cq) = centroids(pairs);
    let mut cross = Matrix3::zeros();
    let mut covariance = Matrix3::zeros();
    for (p, q) in pairs {
        let a = p.coords - cp;
        let b = q.coords - cq;
        cross += a * b.transpose();
        covariance += a * a.transpose();
    }
    check_spread(&covariance, 2)?;

    let svd = cross.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(RegistrationError::numerical_instability("landmark SVD did not converge"));
    };
    let v = v_t.transpose();
    let mut d = Vector3::new(1.0, 1.0, 1.0);
    let weakest = svd.singular_values.imin();
    d[weakest] = (v * u.transpose()).determinant().signum();
    let rotation = v * Matrix3::from_diagonal(&d) * u.transpose();

    let scale = if scaled {
        svd.singular_values.component_mul(&d).sum() / covariance.trace()
    } else {
        1.0
    };
    let linear = rotation * scale;
    Ok((linear, cq - linear * cp))
}

/// Least squares `x ↦ A x + t`.
fn fit_affine(pairs: &[(Point3, Point3)]) -> Result<(Matrix3<f64>, Vector3)> {
    let (cp, cq) = centroids(pairs);
    let mut cross = Matrix3::zeros();
    let mut covariance = Matrix3::zeros();
    for (p, q) in pairs {
        let a = p.coords - cp;
        let b = q.coords - cq;
        cross += b * a.transpose();
        covariance += a * a.transpose();
    }
    check_spread(&covariance, 3)?;
    let inverse = covariance
        .try_inverse()
        .ok_or_else(|| RegistrationError::invalid_volume("landmarks are coplanar"))?;
    let linear = cross * inverse;
    Ok((linear, cq - linear * cp))
}

fn rms(pairs: &[(Point3, Point3)], linear: &Matrix3<f64>, translation: &Vector3) -> f64 {
    let sum: f64 = pairs
        .iter()
        .map(|(p, q)| (linear * p.coords + translation - q.coords).norm_squared())
        .sum();
    (sum / pairs.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use voxreg_core::transform::rigid::euler_zyx;
    use voxreg_core::GridGeometry;

    type B = NdArray<f32>;

    fn tetrahedron() -> Vec<Point3> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(0.0, 3.0, 0.0),
            Point3::new(0.0, 0.0, 5.0),
            Point3::new(2.0, 2.0, 2.0),
        ]
    }

    fn mapped(linear: &Matrix3<f64>, t: &Vector3) -> Vec<(Point3, Point3)> {
        tetrahedron()
            .into_iter()
            .map(|p| (p, Point3::from(linear * p.coords + t)))
            .collect()
    }

    #[test]
    fn test_rigid_fit_recovers_rotation() {
        let rotation = *euler_zyx([0.2, -0.1, 0.3]).matrix();
        let t = Vector3::new(1.0, -2.0, 0.5);
        let (linear, translation) = fit_similarity(&mapped(&rotation, &t), false).unwrap();
        assert!((linear - rotation).norm() < 1e-9);
        assert!((translation - t).norm() < 1e-9);
    }

    #[test]
    fn test_similarity_fit_recovers_scale() {
        let linear = *euler_zyx([0.0, 0.0, 0.4]).matrix() * 1.5;
        let t = Vector3::new(0.0, 1.0, 0.0);
        let (fitted, translation) = fit_similarity(&mapped(&linear, &t), true).unwrap();
        assert!((fitted - linear).norm() < 1e-9);
        assert!((translation - t).norm() < 1e-9);
    }

    #[test]
    fn test_affine_fit_recovers_shear() {
        let linear = Matrix3::new(1.1, 0.2, 0.0, 0.0, 0.9, 0.1, 0.05, 0.0, 1.2);
        let t = Vector3::new(-1.0, 0.5, 2.0);
        let (fitted, translation) = fit_affine(&mapped(&linear, &t)).unwrap();
        assert!((fitted - linear).norm() < 1e-9);
        assert!((translation - t).norm() < 1e-9);
    }

    #[test]
    fn test_degenerate_landmarks_rejected() {
        let line: Vec<(Point3, Point3)> = (0..4)
            .map(|i| {
                let p = Point3::new(i as f64, 0.0, 0.0);
                (p, p)
            })
            .collect();
        assert!(matches!(fit_similarity(&line, false), Err(RegistrationError::InvalidVolume(_))));

        let plane: Vec<(Point3, Point3)> = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]
            .iter()
            .map(|[x, y]| {
                let p = Point3::new(*x, *y, 0.0);
                (p, p)
            })
            .collect();
        assert!(fit_similarity(&plane, false).is_ok());
        assert!(matches!(fit_affine(&plane), Err(RegistrationError::InvalidVolume(_))));
    }

    #[test]
    fn test_label_centroids() {
        let geometry = GridGeometry::unit([4, 4, 4]).unwrap();
        let mut values = vec![0.0f32; geometry.len()];
        values[geometry.offset([1, 1, 1])] = 2.0;
        values[geometry.offset([1, 1, 3])] = 2.0;
        values[geometry.offset([3, 0, 0])] = 7.0;
        values[geometry.offset([0, 3, 0])] = -1.0;
        let volume = Volume::<B>::from_vec(values, geometry, "atlas".into(), &Default::default()).unwrap();

        let centroids = label_centroids(&volume).unwrap();
        assert_eq!(centroids.keys().copied().collect::<Vec<_>>(), vec![2, 7]);
        assert_eq!(centroids[&2], Point3::new(1.0, 1.0, 2.0));
        assert_eq!(centroids[&7], Point3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn test_config_validation() {
        assert!(LandmarkConfig::default().validate().is_ok());
        let mut config = LandmarkConfig::new(LandmarkModel::Affine);
        config.labels = vec![1, 0];
        assert!(config.validate().is_err());
        config.labels.clear();
        config.max_residual = Some(0.5);
        assert_eq!(config.relaxed(4.0).max_residual, Some(2.0));
    }
}
