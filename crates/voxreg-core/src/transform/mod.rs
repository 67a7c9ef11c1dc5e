//! Transform types and operations.
//!
//! A [`Transform`] is an immutable value tagged with the coordinate spaces it
//! connects. A transform from `source` to `target` carries an image sampled
//! in `source` onto a `target` grid: its point map sends physical points of
//! the target space to physical points of the source space.

pub mod rigid;
pub mod affine;
pub mod displacement_field;
pub mod compose;
pub mod invert;

use nalgebra::Matrix4;

use crate::error::{Result, TransformError};
use crate::geometry::Point3;
use crate::space::{CoordinateSpace, SpacePair};

pub use affine::AffineTransform;
pub use compose::{compose, compose_all, compose_with};
pub use displacement_field::{DisplacementField, FieldInterpolation, FoldingReport};
pub use invert::{invert, invert_with, InversionOptions};
pub use rigid::RigidTransform;

/// The closed set of spatial mappings.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformKind {
    Identity,
    Rigid(RigidTransform),
    Affine(AffineTransform),
    DenseField(DisplacementField),
}

/// A spatial coordinate mapping between two named spaces.
///
/// Non-identity transforms always carry their `(source, target)` pair.
/// Identity may be left untagged, in which case it composes with anything
/// and returns the other operand unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    kind: TransformKind,
    spaces: Option<SpacePair>,
}

impl Transform {
    /// Untagged identity.
    pub fn identity() -> Self {
        Self {
            kind: TransformKind::Identity,
            spaces: None,
        }
    }

    /// Identity between two named frames sharing physical coordinates.
    pub fn identity_between(source: CoordinateSpace, target: CoordinateSpace) -> Self {
        Self::tagged(TransformKind::Identity, SpacePair::new(source, target))
    }

    pub fn rigid(rigid: RigidTransform, source: CoordinateSpace, target: CoordinateSpace) -> Self {
        Self::tagged(TransformKind::Rigid(rigid), SpacePair::new(source, target))
    }

    pub fn affine(affine: AffineTransform, source: CoordinateSpace, target: CoordinateSpace) -> Self {
        Self::tagged(TransformKind::Affine(affine), SpacePair::new(source, target))
    }

    pub fn dense_field(field: DisplacementField, source: CoordinateSpace, target: CoordinateSpace) -> Self {
        Self::tagged(TransformKind::DenseField(field), SpacePair::new(source, target))
    }

    pub(crate) fn tagged(kind: TransformKind, spaces: SpacePair) -> Self {
        Self {
            kind,
            spaces: Some(spaces),
        }
    }

    /// Same mapping with a different space pair.
    pub(crate) fn retagged(&self, spaces: SpacePair) -> Self {
        Self::tagged(self.kind.clone(), spaces)
    }

    pub fn kind(&self) -> &TransformKind {
        &self.kind
    }

    pub fn spaces(&self) -> Option<&SpacePair> {
        self.spaces.as_ref()
    }

    pub fn source_space(&self) -> Option<&CoordinateSpace> {
        self.spaces.as_ref().map(|s| &s.source)
    }

    pub fn target_space(&self) -> Option<&CoordinateSpace> {
        self.spaces.as_ref().map(|s| &s.target)
    }

    /// Short variant name used in logs and diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TransformKind::Identity => "identity",
            TransformKind::Rigid(_) => "rigid",
            TransformKind::Affine(_) => "affine",
            TransformKind::DenseField(_) => "dense_field",
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.kind, TransformKind::Identity)
    }

    pub fn is_untagged_identity(&self) -> bool {
        self.is_identity() && self.spaces.is_none()
    }

    pub fn is_linear(&self) -> bool {
        !matches!(self.kind, TransformKind::DenseField(_))
    }

    /// The displacement field, if this is a dense field.
    pub fn field(&self) -> Option<&DisplacementField> {
        match &self.kind {
            TransformKind::DenseField(f) => Some(f),
            _ => None,
        }
    }

    /// Homogeneous matrix of a linear transform; `None` for dense fields.
    pub fn to_homogeneous(&self) -> Option<Matrix4<f64>> {
        match &self.kind {
            TransformKind::Identity => Some(Matrix4::identity()),
            TransformKind::Rigid(r) => Some(r.to_homogeneous()),
            TransformKind::Affine(a) => Some(a.to_homogeneous()),
            TransformKind::DenseField(_) => None,
        }
    }

    /// Apply the point map (target-space point to source-space point).
    pub fn transform_point(&self, point: &Point3) -> Point3 {
        self.transform_point_with(point, FieldInterpolation::default())
    }

    /// Apply the point map with an explicit field interpolation policy.
    pub fn transform_point_with(&self, point: &Point3, policy: FieldInterpolation) -> Point3 {
        match &self.kind {
            TransformKind::Identity => *point,
            TransformKind::Rigid(r) => r.transform_point(point),
            TransformKind::Affine(a) => a.transform_point(point),
            TransformKind::DenseField(f) => f.transform_point(point, policy),
        }
    }

    /// Largest distance any of `points` is moved by the point map.
    pub fn max_displacement(&self, points: &[Point3]) -> f64 {
        points
            .iter()
            .map(|p| (self.transform_point(p) - p).norm())
            .fold(0.0, f64::max)
    }

    /// Whether the point map moves none of `points` by more than `tol`.
    pub fn is_identity_within(&self, tol: f64, points: &[Point3]) -> bool {
        self.max_displacement(points) <= tol
    }

    /// Fail unless this transform maps `source` onto `target`.
    ///
    /// Untagged identity matches any pair.
    pub fn check_spaces(&self, source: &CoordinateSpace, target: &CoordinateSpace) -> Result<()> {
        if let Some(pair) = &self.spaces {
            if &pair.source != source {
                return Err(TransformError::incompatible_space(source, &pair.source));
            }
            if &pair.target != target {
                return Err(TransformError::incompatible_space(target, &pair.target));
            }
        }
        Ok(())
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}
