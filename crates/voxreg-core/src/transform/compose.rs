//! Transform composition.
//!
//! `compose(t1, t2)` has point map `t1(t2(x))`: `t2` carries its source onto
//! its target, `t1` is applied on the way back. With `t1: A → B` and
//! `t2: B → C` the result maps `A → C`.

use tracing::trace;

use super::{AffineTransform, DisplacementField, FieldInterpolation, Transform, TransformKind};
use crate::error::{Result, TransformError};
use crate::geometry::Vector3;
use crate::space::SpacePair;

/// Compose two transforms, evaluating fields with linear interpolation.
pub fn compose(t1: &Transform, t2: &Transform) -> Result<Transform> {
    compose_with(t1, t2, FieldInterpolation::Linear)
}

/// Compose two transforms.
///
/// Untagged identity on either side returns the other operand unchanged.
/// Linear × linear collapses to one affine matrix. Any composition involving
/// a dense field is sampled on a field grid: the grid of `t2` when `t2` is a
/// field, otherwise the grid of `t1`. `policy` controls how `t1`'s field is
/// evaluated at the off-grid points `t2` produces.
pub fn compose_with(t1: &Transform, t2: &Transform, policy: FieldInterpolation) -> Result<Transform> {
    if t1.is_untagged_identity() {
        return Ok(t2.clone());
    }
    if t2.is_untagged_identity() {
        return Ok(t1.clone());
    }

    let spaces = composed_spaces(t1, t2)?;

    if t1.is_identity() {
        return Ok(t2.retagged(spaces));
    }
    if t2.is_identity() {
        return Ok(t1.retagged(spaces));
    }

    let kind = match (&t1.kind, &t2.kind) {
        (_, TransformKind::DenseField(f2)) => {
            TransformKind::DenseField(field_after(t1, f2, policy)?)
        }
        (TransformKind::DenseField(f1), _) => {
            TransformKind::DenseField(field_before(f1, t2, policy)?)
        }
        _ => {
            // Both linear; homogeneous matrices exist for every linear kind.
            let m1 = t1
                .to_homogeneous()
                .ok_or_else(|| TransformError::geometry_mismatch("linear transform without matrix"))?;
            let m2 = t2
                .to_homogeneous()
                .ok_or_else(|| TransformError::geometry_mismatch("linear transform without matrix"))?;
            TransformKind::Affine(AffineTransform::from_homogeneous(&(m1 * m2)))
        }
    };

    trace!(
        first = t1.kind_name(),
        second = t2.kind_name(),
        "composed transforms"
    );
    Ok(Transform::tagged(kind, spaces))
}

/// Fold a chain left to right: `compose(compose(t0, t1), t2) ...`.
///
/// An empty chain is the untagged identity.
pub fn compose_all(chain: &[Transform]) -> Result<Transform> {
    chain
        .iter()
        .try_fold(Transform::identity(), |acc, t| compose(&acc, t))
}

fn composed_spaces(t1: &Transform, t2: &Transform) -> Result<SpacePair> {
    match (t1.spaces(), t2.spaces()) {
        (Some(a), Some(b)) => {
            if a.target != b.source {
                return Err(TransformError::incompatible_space(&a.target, &b.source));
            }
            Ok(SpacePair::new(a.source.clone(), b.target.clone()))
        }
        // Only identity may be untagged, and untagged identity returned early.
        _ => Err(TransformError::geometry_mismatch(
            "non-identity transform without coordinate spaces",
        )),
    }
}

/// `u(x) = t1(x + u2(x)) - x` on the grid of `f2`.
fn field_after(t1: &Transform, f2: &DisplacementField, policy: FieldInterpolation) -> Result<DisplacementField> {
    let geometry = f2.geometry();
    let vectors: Vec<Vector3> = f2
        .vectors()
        .iter()
        .enumerate()
        .map(|(offset, u2)| {
            let x = geometry.voxel_to_world(offset);
            t1.transform_point_with(&(x + u2), policy) - x
        })
        .collect();
    f2.with_vectors(vectors)
}

/// `u(x) = t2(x) + u1(t2(x)) - x` on the grid of `f1`.
fn field_before(f1: &DisplacementField, t2: &Transform, policy: FieldInterpolation) -> Result<DisplacementField> {
    let geometry = f1.geometry();
    let vectors: Vec<Vector3> = (0..geometry.len())
        .map(|offset| {
            let x = geometry.voxel_to_world(offset);
            let y = t2.transform_point(&x);
            f1.transform_point(&y, policy) - x
        })
        .collect();
    f1.with_vectors(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{GridGeometry, Point3};
    use crate::transform::RigidTransform;

    fn shift(v: [f64; 3], source: &str, target: &str) -> Transform {
        Transform::rigid(
            RigidTransform::from_translation(Vector3::new(v[0], v[1], v[2])),
            source.into(),
            target.into(),
        )
    }

    #[test]
    fn test_identity_is_neutral() {
        let t = shift([1.0, 2.0, 3.0], "a", "b");
        assert_eq!(compose(&t, &Transform::identity()).unwrap(), t);
        assert_eq!(compose(&Transform::identity(), &t).unwrap(), t);
    }

    #[test]
    fn test_tagged_identity_retags() {
        let t = shift([1.0, 0.0, 0.0], "a", "b");
        let id = Transform::identity_between("b".into(), "c".into());
        let out = compose(&t, &id).unwrap();
        assert_eq!(out.kind(), t.kind());
        assert_eq!(out.target_space().unwrap().name(), "c");
    }

    #[test]
    fn test_incompatible_spaces() {
        let a = shift([1.0, 0.0, 0.0], "a", "b");
        let b = shift([1.0, 0.0, 0.0], "x", "c");
        let err = compose(&a, &b).unwrap_err();
        assert!(matches!(err, TransformError::IncompatibleSpace { .. }));
    }

    #[test]
    fn test_linear_composition_is_affine() {
        let a = shift([1.0, 0.0, 0.0], "a", "b");
        let b = Transform::rigid(
            RigidTransform::from_euler([0.0, 0.0, 0.3], &Point3::origin(), Vector3::new(0.0, 2.0, 0.0)),
            "b".into(),
            "c".into(),
        );
        let ab = compose(&a, &b).unwrap();
        assert_eq!(ab.kind_name(), "affine");
        let p = Point3::new(3.0, -1.0, 2.0);
        let expected = a.transform_point(&b.transform_point(&p));
        assert!((ab.transform_point(&p) - expected).norm() < 1e-12);
        assert_eq!(ab.source_space().unwrap().name(), "a");
        assert_eq!(ab.target_space().unwrap().name(), "c");
    }

    #[test]
    fn test_field_composition_on_grid_points() {
        let grid = GridGeometry::unit([6, 6, 6]).unwrap();
        let field = DisplacementField::from_fn(grid.clone(), |p| Vector3::new(0.1 * p.y, 0.0, 0.05)).unwrap();
        let f = Transform::dense_field(field, "b".into(), "c".into());
        let a = shift([0.5, 0.0, 0.0], "a", "b");

        let af = compose(&a, &f).unwrap();
        assert_eq!(af.kind_name(), "dense_field");
        for offset in [0, 17, 100, 215] {
            let x = grid.voxel_to_world(offset);
            let expected = a.transform_point(&f.transform_point(&x));
            assert!((af.transform_point(&x) - expected).norm() < 1e-12);
        }
    }

    #[test]
    fn test_compose_all() {
        let chain = vec![
            shift([1.0, 0.0, 0.0], "a", "b"),
            shift([0.0, 1.0, 0.0], "b", "c"),
            shift([0.0, 0.0, 1.0], "c", "d"),
        ];
        let t = compose_all(&chain).unwrap();
        let p = t.transform_point(&Point3::origin());
        assert!((p - Point3::new(1.0, 1.0, 1.0)).norm() < 1e-12);
        assert_eq!(compose_all(&[]).unwrap(), Transform::identity());
    }
}
