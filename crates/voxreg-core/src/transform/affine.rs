//! Affine transform implementation.
//!
//! This module provides an affine transform (linear transformation + translation).

use nalgebra::{Matrix3, Matrix3x4, Matrix4};
use serde::{Deserialize, Serialize};

use crate::geometry::{Point3, Vector3};

/// Determinants with a smaller magnitude are treated as singular.
pub const SINGULAR_DETERMINANT: f64 = 1e-12;

/// Affine Transform stored as a 3×4 matrix `[A | t]`.
///
/// Point map `y = A x + t`. Registration code usually builds it around a
/// fixed center with [`AffineTransform::about_center`]:
/// `T(x) = A(x - c) + c + t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    matrix: Matrix3x4<f64>,
}

impl AffineTransform {
    /// Create an affine transform from its 3×4 matrix.
    pub fn new(matrix: Matrix3x4<f64>) -> Self {
        Self { matrix }
    }

    /// Create from a linear part and a translation.
    pub fn from_parts(linear: &Matrix3<f64>, translation: &Vector3) -> Self {
        let mut matrix = Matrix3x4::zeros();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(linear);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
        Self { matrix }
    }

    /// `T(x) = A(x - c) + c + t`.
    pub fn about_center(linear: &Matrix3<f64>, center: &Point3, translation: &Vector3) -> Self {
        let c = center.coords;
        Self::from_parts(linear, &(c - linear * c + translation))
    }

    /// Take the top three rows of a homogeneous matrix.
    pub fn from_homogeneous(m: &Matrix4<f64>) -> Self {
        Self::new(m.fixed_view::<3, 4>(0, 0).into_owned())
    }

    pub fn identity() -> Self {
        Self::from_parts(&Matrix3::identity(), &Vector3::zeros())
    }

    pub fn matrix(&self) -> &Matrix3x4<f64> {
        &self.matrix
    }

    pub fn linear(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self) -> Vector3 {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    pub fn determinant(&self) -> f64 {
        self.linear().determinant()
    }

    pub fn transform_point(&self, point: &Point3) -> Point3 {
        Point3::from(self.linear() * point.coords + self.translation())
    }

    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 4>(0, 0).copy_from(&self.matrix);
        m
    }

    /// Inverse, or `None` when the linear part is singular.
    pub fn inverse(&self) -> Option<Self> {
        if self.determinant().abs() < SINGULAR_DETERMINANT {
            return None;
        }
        let inv = self.linear().try_inverse()?;
        Some(Self::from_parts(&inv, &(-(inv * self.translation()))))
    }

    /// Whether every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.matrix.iter().all(|v| v.is_finite())
    }
}
