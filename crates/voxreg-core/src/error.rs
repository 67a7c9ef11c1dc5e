//! Error types for volume and transform operations.

use thiserror::Error;

use crate::space::CoordinateSpace;

/// Errors raised by volumes, transforms and resampling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    /// Two transforms (or a transform and a volume) disagree on the shared space.
    #[error("Incompatible coordinate spaces: expected '{expected}', found '{found}'")]
    IncompatibleSpace {
        expected: CoordinateSpace,
        found: CoordinateSpace,
    },

    /// The transform has no well-approximated inverse.
    #[error("Transform is not invertible: {0}")]
    NonInvertible(String),

    /// A field or matrix does not match the grid it is meant for.
    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// A volume or field was constructed from inconsistent parts.
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, TransformError>;

impl TransformError {
    /// Create an incompatible space error.
    pub fn incompatible_space(expected: &CoordinateSpace, found: &CoordinateSpace) -> Self {
        Self::IncompatibleSpace {
            expected: expected.clone(),
            found: found.clone(),
        }
    }

    /// Create a non-invertible error.
    pub fn non_invertible(msg: impl Into<String>) -> Self {
        Self::NonInvertible(msg.into())
    }

    /// Create a geometry mismatch error.
    pub fn geometry_mismatch(msg: impl Into<String>) -> Self {
        Self::GeometryMismatch(msg.into())
    }

    /// Create an invalid volume error.
    pub fn invalid_volume(msg: impl Into<String>) -> Self {
        Self::InvalidVolume(msg.into())
    }
}
