//! Geometry aliases and the voxel grid geometry.
//!
//! Index space is `(i, j, k)` in the same axis order as the volume tensor
//! `[n0, n1, n2]`. Physical space follows
//! `point = origin + direction * (index ∘ spacing)`.

use nalgebra::{Matrix3, Point3 as NaPoint3, Vector3 as NaVector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};

pub type Point3 = NaPoint3<f64>;
pub type Vector3 = NaVector3<f64>;
pub type Spacing3 = NaVector3<f64>;
pub type Direction3 = Matrix3<f64>;

/// Shape, origin, spacing and orientation of a 3-D sampling grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeometry", into = "RawGeometry")]
pub struct GridGeometry {
    shape: [usize; 3],
    origin: Point3,
    spacing: Spacing3,
    direction: Direction3,
    index_to_world: Matrix3<f64>,
    world_to_index: Matrix3<f64>,
}

/// Serialized form; derived matrices are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawGeometry {
    shape: [usize; 3],
    origin: Point3,
    spacing: Spacing3,
    direction: Direction3,
}

impl TryFrom<RawGeometry> for GridGeometry {
    type Error = TransformError;

    fn try_from(raw: RawGeometry) -> Result<Self> {
        GridGeometry::new(raw.shape, raw.origin, raw.spacing, raw.direction)
    }
}

impl From<GridGeometry> for RawGeometry {
    fn from(g: GridGeometry) -> Self {
        RawGeometry {
            shape: g.shape,
            origin: g.origin,
            spacing: g.spacing,
            direction: g.direction,
        }
    }
}

impl GridGeometry {
    /// Create a grid geometry.
    ///
    /// Fails when a dimension is empty, spacing is not strictly positive or
    /// the direction matrix is singular.
    pub fn new(
        shape: [usize; 3],
        origin: Point3,
        spacing: Spacing3,
        direction: Direction3,
    ) -> Result<Self> {
        if shape.iter().any(|&n| n == 0) {
            return Err(TransformError::invalid_volume(format!(
                "grid shape must be non-empty, got {:?}",
                shape
            )));
        }
        if spacing.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(TransformError::invalid_volume(format!(
                "spacing must be strictly positive, got {:?}",
                spacing.as_slice()
            )));
        }
        if origin.coords.iter().any(|v| !v.is_finite()) {
            return Err(TransformError::invalid_volume("origin must be finite"));
        }
        let index_to_world = direction * Matrix3::from_diagonal(&spacing);
        let world_to_index = index_to_world
            .try_inverse()
            .ok_or_else(|| TransformError::invalid_volume("direction matrix must be invertible"))?;

        Ok(Self {
            shape,
            origin,
            spacing,
            direction,
            index_to_world,
            world_to_index,
        })
    }

    /// Axis-aligned grid with the given spacing and origin.
    pub fn axis_aligned(shape: [usize; 3], origin: Point3, spacing: Spacing3) -> Result<Self> {
        Self::new(shape, origin, spacing, Direction3::identity())
    }

    /// Unit-spaced, axis-aligned grid anchored at the world origin.
    pub fn unit(shape: [usize; 3]) -> Result<Self> {
        Self::axis_aligned(shape, Point3::origin(), Spacing3::repeat(1.0))
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn origin(&self) -> &Point3 {
        &self.origin
    }

    pub fn spacing(&self) -> &Spacing3 {
        &self.spacing
    }

    pub fn direction(&self) -> &Direction3 {
        &self.direction
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min_spacing(&self) -> f64 {
        self.spacing.min()
    }

    /// Linear offset of an integer index in row-major `[n0, n1, n2]` order.
    pub fn offset(&self, index: [usize; 3]) -> usize {
        (index[0] * self.shape[1] + index[1]) * self.shape[2] + index[2]
    }

    /// Integer index of a linear offset.
    pub fn unravel(&self, offset: usize) -> [usize; 3] {
        let plane = self.shape[1] * self.shape[2];
        [offset / plane, (offset % plane) / self.shape[2], offset % self.shape[2]]
    }

    /// Physical point of a continuous index.
    pub fn index_to_world(&self, index: &Vector3) -> Point3 {
        self.origin + self.index_to_world * index
    }

    /// Continuous index of a physical point.
    pub fn world_to_index(&self, point: &Point3) -> Vector3 {
        self.world_to_index * (point - self.origin)
    }

    /// Physical point of the voxel at a linear offset.
    pub fn voxel_to_world(&self, offset: usize) -> Point3 {
        let [i, j, k] = self.unravel(offset);
        self.index_to_world(&Vector3::new(i as f64, j as f64, k as f64))
    }

    /// Matrix taking index steps to physical steps (`direction * diag(spacing)`).
    pub fn index_to_world_matrix(&self) -> &Matrix3<f64> {
        &self.index_to_world
    }

    /// Inverse of [`Self::index_to_world_matrix`].
    pub fn world_to_index_matrix(&self) -> &Matrix3<f64> {
        &self.world_to_index
    }

    /// Whether a continuous index lies inside the sampled extent `[0, n - 1]`.
    pub fn contains_index(&self, index: &Vector3) -> bool {
        (0..3).all(|a| index[a] >= 0.0 && index[a] <= (self.shape[a] - 1) as f64)
    }

    /// Physical centre of the grid.
    pub fn center(&self) -> Point3 {
        let half = Vector3::new(
            (self.shape[0] - 1) as f64 / 2.0,
            (self.shape[1] - 1) as f64 / 2.0,
            (self.shape[2] - 1) as f64 / 2.0,
        );
        self.index_to_world(&half)
    }

    /// Half of the physical diagonal; a length scale for rotation parameters.
    pub fn radius(&self) -> f64 {
        let extent = Vector3::new(
            (self.shape[0] - 1) as f64 * self.spacing[0],
            (self.shape[1] - 1) as f64 * self.spacing[1],
            (self.shape[2] - 1) as f64 * self.spacing[2],
        );
        (extent.norm() / 2.0).max(self.spacing.max())
    }

    /// Equality of shape and geometry within `tol`.
    pub fn approx_eq(&self, other: &GridGeometry, tol: f64) -> bool {
        self.shape == other.shape
            && (self.origin - other.origin).amax() <= tol
            && (self.spacing - other.spacing).amax() <= tol
            && (self.direction - other.direction).amax() <= tol
    }

    /// Geometry of the same physical extent sampled every `factors` voxels.
    pub fn shrink(&self, factors: [usize; 3]) -> Result<Self> {
        let mut shape = self.shape;
        let mut spacing = self.spacing;
        for a in 0..3 {
            let f = factors[a].max(1);
            shape[a] = (self.shape[a] + f - 1) / f;
            spacing[a] *= f as f64;
        }
        Self::new(shape, self.origin, spacing, self.direction)
    }
}
