//! Displacement field transform implementation.
//!
//! This module provides a dense displacement field where each voxel of a
//! grid carries its own displacement vector. This is used for deformable
//! (non-rigid) registration.

use std::sync::Arc;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};
use crate::geometry::{GridGeometry, Point3, Vector3};

/// How a displacement field is evaluated between its grid points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldInterpolation {
    /// Trilinear interpolation of the eight surrounding vectors.
    #[default]
    Linear,
    /// Vector of the nearest grid point.
    Nearest,
}

/// Folding summary of a field's Jacobian determinants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoldingReport {
    pub min_jacobian: f64,
    pub max_jacobian: f64,
    /// Voxels whose determinant is `<= 0`.
    pub folded_voxels: usize,
}

impl FoldingReport {
    pub fn is_folded(&self) -> bool {
        self.folded_voxels > 0
    }
}

/// Dense displacement field for 3D volumes.
///
/// Point map `x ↦ x + u(x)`, with `u` sampled at the voxel centres of
/// `geometry` in physical units. The field covers the voxel footprint
/// `[-0.5, n - 0.5]` along every axis; displacement beyond it is zero.
/// Inversion and resampling onto other grids use
/// [`DisplacementField::sample_extended`] instead, which continues the
/// border vectors.
///
/// Vectors are shared behind an `Arc`, so clones are cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    geometry: GridGeometry,
    vectors: Arc<[Vector3]>,
}

impl DisplacementField {
    /// Create a displacement field.
    ///
    /// # Arguments
    /// * `geometry` - Grid the vectors are sampled on
    /// * `vectors` - One physical displacement per voxel, row-major
    pub fn new(geometry: GridGeometry, vectors: Vec<Vector3>) -> Result<Self> {
        if vectors.len() != geometry.len() {
            return Err(TransformError::geometry_mismatch(format!(
                "field has {} vectors but grid {:?} has {} voxels",
                vectors.len(),
                geometry.shape(),
                geometry.len()
            )));
        }
        if vectors.iter().any(|v| v.iter().any(|c| !c.is_finite())) {
            return Err(TransformError::invalid_volume("displacement field contains non-finite values"));
        }
        Ok(Self {
            geometry,
            vectors: vectors.into(),
        })
    }

    /// Build from interleaved `[x, y, z]` components.
    pub fn from_components(geometry: GridGeometry, components: &[f64]) -> Result<Self> {
        if components.len() != geometry.len() * 3 {
            return Err(TransformError::geometry_mismatch(format!(
                "expected {} field components, got {}",
                geometry.len() * 3,
                components.len()
            )));
        }
        let vectors = components
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        Self::new(geometry, vectors)
    }

    /// Zero displacement over a grid.
    pub fn zeros(geometry: GridGeometry) -> Self {
        let vectors = vec![Vector3::zeros(); geometry.len()];
        Self {
            geometry,
            vectors: vectors.into(),
        }
    }

    /// Sample a displacement for every voxel centre of a grid.
    pub fn from_fn<F>(geometry: GridGeometry, f: F) -> Result<Self>
    where
        F: Fn(&Point3) -> Vector3,
    {
        let vectors = (0..geometry.len())
            .map(|offset| f(&geometry.voxel_to_world(offset)))
            .collect();
        Self::new(geometry, vectors)
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn vectors(&self) -> &[Vector3] {
        &self.vectors
    }

    /// Displacement stored at an integer voxel.
    pub fn at(&self, index: [usize; 3]) -> Vector3 {
        self.vectors[self.geometry.offset(index)]
    }

    /// Largest displacement magnitude.
    pub fn max_magnitude(&self) -> f64 {
        self.vectors.iter().map(|v| v.norm()).fold(0.0, f64::max)
    }

    /// Displacement at a physical point.
    pub fn sample(&self, point: &Point3, policy: FieldInterpolation) -> Vector3 {
        let index = self.geometry.world_to_index(point);
        let shape = self.geometry.shape();
        for a in 0..3 {
            let upper = shape[a] as f64 - 0.5;
            if !(index[a] >= -0.5 && index[a] <= upper) {
                return Vector3::zeros();
            }
        }
        self.sample_extended(point, policy)
    }

    /// Displacement at a physical point, extending border vectors outward.
    ///
    /// Unlike [`Self::sample`], points beyond the footprint take the nearest
    /// border displacement instead of zero.
    pub fn sample_extended(&self, point: &Point3, policy: FieldInterpolation) -> Vector3 {
        let index = self.geometry.world_to_index(point);
        let shape = self.geometry.shape();
        match policy {
            FieldInterpolation::Nearest => {
                let mut ix = [0usize; 3];
                for a in 0..3 {
                    ix[a] = (index[a].round().max(0.0) as usize).min(shape[a] - 1);
                }
                self.at(ix)
            }
            FieldInterpolation::Linear => self.sample_linear(&index),
        }
    }

    /// Point map of the field.
    pub fn transform_point(&self, point: &Point3, policy: FieldInterpolation) -> Point3 {
        point + self.sample(point, policy)
    }

    fn sample_linear(&self, index: &Vector3) -> Vector3 {
        let shape = self.geometry.shape();
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for a in 0..3 {
            let max = (shape[a] - 1) as f64;
            let c = index[a].clamp(0.0, max);
            let f = c.floor();
            lo[a] = f as usize;
            hi[a] = (lo[a] + 1).min(shape[a] - 1);
            frac[a] = c - f;
        }

        let mut acc = Vector3::zeros();
        for corner in 0..8 {
            let mut weight = 1.0;
            let mut ix = [0usize; 3];
            for a in 0..3 {
                if corner & (1 << a) != 0 {
                    weight *= frac[a];
                    ix[a] = hi[a];
                } else {
                    weight *= 1.0 - frac[a];
                    ix[a] = lo[a];
                }
            }
            if weight != 0.0 {
                acc += self.at(ix) * weight;
            }
        }
        acc
    }

    /// Derivative of the displacement with respect to voxel index at one voxel.
    ///
    /// Column `a` holds `∂u/∂index_a`; central differences inside the grid,
    /// one-sided at the borders, zero along singleton axes.
    fn index_gradient(&self, index: [usize; 3]) -> Matrix3<f64> {
        let shape = self.geometry.shape();
        let mut grad = Matrix3::zeros();
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
            let d = (self.at(next) - self.at(prev)) / h;
            grad.set_column(a, &d);
        }
        grad
    }

    /// Jacobian determinant of the point map at every voxel, row-major.
    pub fn jacobian_determinants(&self) -> Vec<f64> {
        let to_index = self.geometry.world_to_index_matrix();
        (0..self.geometry.len())
            .map(|offset| {
                let grad = self.index_gradient(self.geometry.unravel(offset));
                (Matrix3::identity() + grad * to_index).determinant()
            })
            .collect()
    }

    pub fn folding_report(&self) -> FoldingReport {
        let dets = self.jacobian_determinants();
        FoldingReport {
            min_jacobian: dets.iter().copied().fold(f64::INFINITY, f64::min),
            max_jacobian: dets.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            folded_voxels: dets.iter().filter(|&&d| d <= 0.0).count(),
        }
    }

    /// Same geometry, new vectors.
    pub fn with_vectors(&self, vectors: Vec<Vector3>) -> Result<Self> {
        Self::new(self.geometry.clone(), vectors)
    }
}
