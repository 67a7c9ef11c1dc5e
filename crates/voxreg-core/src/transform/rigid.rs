//! Rigid transform implementation.
//!
//! This module provides a rigid transform (rotation + translation).

use nalgebra::{Matrix3, Matrix4, Rotation3};
use serde::{Deserialize, Serialize};

use crate::geometry::{Point3, Vector3};

/// Rigid Transform (Rotation + Translation).
///
/// Point map `y = R x + t`. Constructors accept the registration
/// parameterisation with a fixed center of rotation,
/// `T(x) = R(x - c) + c + t`, and fold the center into `t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    rotation: Rotation3<f64>,
    translation: Vector3,
}

impl RigidTransform {
    /// Create a rigid transform from a rotation and a translation.
    pub fn new(rotation: Rotation3<f64>, translation: Vector3) -> Self {
        Self { rotation, translation }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3) -> Self {
        Self::new(Rotation3::identity(), translation)
    }

    /// Build from Euler angles (radians, `R = Rz(γ) Ry(β) Rx(α)`) about `center`.
    ///
    /// # Arguments
    /// * `angles` - `[α, β, γ]` rotations about x, y and z
    /// * `center` - Fixed center of rotation
    /// * `translation` - Translation applied after the rotation
    pub fn from_euler(angles: [f64; 3], center: &Point3, translation: Vector3) -> Self {
        let rotation = euler_zyx(angles);
        let c = center.coords;
        let offset = c - rotation * c + translation;
        Self::new(rotation, offset)
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3 {
        &self.translation
    }

    /// Euler angles `[α, β, γ]` matching [`Self::from_euler`].
    pub fn euler_angles(&self) -> [f64; 3] {
        let (roll, pitch, yaw) = self.rotation.euler_angles();
        [roll, pitch, yaw]
    }

    pub fn transform_point(&self, point: &Point3) -> Point3 {
        self.rotation * point + self.translation
    }

    /// Exact inverse: `R^T (y - t)`.
    pub fn inverse(&self) -> Self {
        let inv = self.rotation.inverse();
        Self::new(inv, -(inv * self.translation))
    }

    /// Homogeneous 4×4 matrix.
    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(self.rotation.matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Linear part as a plain matrix.
    pub fn linear(&self) -> Matrix3<f64> {
        *self.rotation.matrix()
    }
}

/// Rotation `Rz(γ) Ry(β) Rx(α)`.
pub fn euler_zyx(angles: [f64; 3]) -> Rotation3<f64> {
    // nalgebra's roll/pitch/yaw is exactly Rz(yaw) * Ry(pitch) * Rx(roll).
    Rotation3::from_euler_angles(angles[0], angles[1], angles[2])
}
