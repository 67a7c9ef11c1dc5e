//! Transform inversion.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DisplacementField, FieldInterpolation, Transform, TransformKind};
use crate::error::{Result, TransformError};
use crate::geometry::Vector3;

/// Bounds of the displacement fixed-point iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InversionOptions {
    pub max_iterations: usize,
    /// Residual bound in physical units; `None` means `1e-3 ×` the field's
    /// smallest spacing.
    pub tolerance: Option<f64>,
    pub interpolation: FieldInterpolation,
}

impl Default for InversionOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: None,
            interpolation: FieldInterpolation::Linear,
        }
    }
}

/// Invert a transform with default options.
pub fn invert(t: &Transform) -> Result<Transform> {
    invert_with(t, &InversionOptions::default())
}

/// Invert a transform.
///
/// Identity and rigid transforms invert exactly, affine transforms through
/// the matrix inverse. Dense fields are inverted by iterating
/// `v ← -u(y + v)` at every grid point until the residual
/// `|v + u(y + v)|` drops below tolerance. A field with a non-positive
/// Jacobian determinant anywhere, or one that does not converge, fails with
/// `NonInvertible`.
///
/// The iteration samples `u` with [`DisplacementField::sample_extended`],
/// while the forward point map uses [`DisplacementField::sample`], which is
/// zero past the voxel footprint. The two agree wherever `y + v(y)` stays
/// inside the footprint, so `t(inverse(y)) == y` holds there up to the
/// tolerance. A field that pushes the border outward leaves a gap with no
/// preimage; there the inverse continues the border displacement instead of
/// failing.
pub fn invert_with(t: &Transform, options: &InversionOptions) -> Result<Transform> {
    let kind = match t.kind() {
        TransformKind::Identity => TransformKind::Identity,
        TransformKind::Rigid(r) => TransformKind::Rigid(r.inverse()),
        TransformKind::Affine(a) => TransformKind::Affine(a.inverse().ok_or_else(|| {
            TransformError::non_invertible(format!(
                "affine matrix is singular (det = {:.3e})",
                a.determinant()
            ))
        })?),
        TransformKind::DenseField(f) => TransformKind::DenseField(invert_field(f, options)?),
    };
    Ok(match t.spaces() {
        Some(pair) => Transform::tagged(kind, pair.reversed()),
        None => Transform::identity(),
    })
}

fn invert_field(field: &DisplacementField, options: &InversionOptions) -> Result<DisplacementField> {
    let report = field.folding_report();
    if report.is_folded() {
        return Err(TransformError::non_invertible(format!(
            "field folds at {} voxels (min Jacobian determinant {:.4})",
            report.folded_voxels, report.min_jacobian
        )));
    }

    let geometry = field.geometry();
    let tolerance = options
        .tolerance
        .unwrap_or_else(|| 1e-3 * geometry.min_spacing());
    let policy = options.interpolation;

    let mut inverse: Vec<Vector3> = field.vectors().iter().map(|u| -u).collect();
    let mut residual = f64::INFINITY;

    for iteration in 0..options.max_iterations {
        residual = 0.0;
        for (offset, v) in inverse.iter_mut().enumerate() {
            let y = geometry.voxel_to_world(offset);
            let u = field.sample_extended(&(y + *v), policy);
            residual = residual.max((*v + u).norm());
            *v = -u;
        }
        if residual < tolerance {
            debug!(iterations = iteration + 1, residual, "field inversion converged");
            return field.with_vectors(inverse);
        }
    }

    Err(TransformError::non_invertible(format!(
        "field inversion did not converge in {} iterations (residual {:.3e}, tolerance {:.3e})",
        options.max_iterations, residual, tolerance
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GridGeometry;
    use crate::transform::{compose, AffineTransform};
    use nalgebra::Matrix3;

    #[test]
    fn test_identity_inverse_swaps_spaces() {
        let t = Transform::identity_between("a".into(), "b".into());
        let inv = invert(&t).unwrap();
        assert_eq!(inv.source_space().unwrap().name(), "b");
        assert!(inv.is_identity());
        assert_eq!(invert(&Transform::identity()).unwrap(), Transform::identity());
    }

    #[test]
    fn test_singular_affine() {
        let a = AffineTransform::from_parts(&Matrix3::zeros(), &Vector3::zeros());
        let t = Transform::affine(a, "a".into(), "b".into());
        assert!(matches!(invert(&t), Err(TransformError::NonInvertible(_))));
    }

    #[test]
    fn test_smooth_field_inverse() {
        let grid = GridGeometry::unit([12, 12, 12]).unwrap();
        let field = DisplacementField::from_fn(grid.clone(), |p| {
            Vector3::new(0.3 * (p.y * 0.4).sin(), 0.2 * (p.z * 0.3).cos(), 0.1)
        })
        .unwrap();
        let t = Transform::dense_field(field, "a".into(), "b".into());
        let inv = invert(&t).unwrap();
        assert_eq!(inv.source_space().unwrap().name(), "b");

        // Interior points round-trip to within the field's interpolation error.
        let round = compose(&t, &inv).unwrap();
        for offset in [grid.offset([5, 5, 5]), grid.offset([3, 7, 6])] {
            let x = grid.voxel_to_world(offset);
            assert!((round.transform_point(&x) - x).norm() < 0.02);
        }
    }

    #[test]
    fn test_round_trip_at_border_voxels() {
        let grid = GridGeometry::unit([6, 6, 6]).unwrap();
        let field = DisplacementField::from_fn(grid.clone(), |_| Vector3::new(0.3, 0.0, 0.0)).unwrap();
        let t = Transform::dense_field(field, "a".into(), "b".into());
        let inv = invert(&t).unwrap();

        // Every preimage lies within the footprint, first and last slab included.
        for offset in [grid.offset([0, 2, 2]), grid.offset([5, 2, 2]), grid.offset([5, 5, 0])] {
            let y = grid.voxel_to_world(offset);
            let x = inv.transform_point(&y);
            assert!((x - y + Vector3::new(0.3, 0.0, 0.0)).norm() < 1e-6);
            assert!((t.transform_point(&x) - y).norm() < 1e-6);
        }
    }

    #[test]
    fn test_outward_border_gap_continues_border_displacement() {
        let grid = GridGeometry::unit([6, 6, 6]).unwrap();
        let field = DisplacementField::from_fn(grid.clone(), |_| Vector3::new(0.8, 0.0, 0.0)).unwrap();
        let t = Transform::dense_field(field, "a".into(), "b".into());
        let inv = invert(&t).unwrap();

        // x = -0.8 is past the footprint, so nothing maps onto y = 0.
        let y = grid.voxel_to_world(grid.offset([0, 3, 3]));
        let x = inv.transform_point(&y);
        assert!((x.x + 0.8).abs() < 1e-6);
        assert_eq!(t.transform_point(&x), x);
    }

    #[test]
    fn test_folded_field_not_invertible() {
        let grid = GridGeometry::unit([5, 5, 5]).unwrap();
        let field = DisplacementField::from_fn(grid, |p| Vector3::new(-2.0 * p.x, 0.0, 0.0)).unwrap();
        let t = Transform::dense_field(field, "a".into(), "b".into());
        assert!(matches!(invert(&t), Err(TransformError::NonInvertible(_))));
    }

    #[test]
    fn test_not_converged_fails() {
        let grid = GridGeometry::unit([8, 8, 8]).unwrap();
        let field = DisplacementField::from_fn(grid, |p| Vector3::new(0.4 * (p.x * 0.8).sin(), 0.0, 0.0)).unwrap();
        let t = Transform::dense_field(field, "a".into(), "b".into());
        let options = InversionOptions {
            max_iterations: 1,
            tolerance: Some(1e-9),
            ..Default::default()
        };
        assert!(matches!(invert_with(&t, &options), Err(TransformError::NonInvertible(_))));
    }
}
