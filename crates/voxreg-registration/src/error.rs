//! Error types for registration operations.
//!
//! Every failure an estimator or pipeline run can produce is classified so
//! the orchestrator can decide between retrying a step, failing it, or
//! aborting the whole run.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use voxreg_core::{CoordinateSpace, TransformError};

/// Main error type for registration operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// A transform or volume is tagged with the wrong coordinate space.
    #[error("Incompatible coordinate spaces: expected '{expected}', found '{found}'")]
    IncompatibleSpace {
        expected: CoordinateSpace,
        found: CoordinateSpace,
    },

    /// The optimizer hit its iteration cap before converging.
    #[error("Convergence failure: {0}")]
    ConvergenceFailure(String),

    /// A transform could not be inverted.
    #[error("Transform is not invertible: {0}")]
    NonInvertible(String),

    /// The inference collaborator failed, timed out or returned malformed output.
    #[error("Inference error: {0}")]
    Inference(String),

    /// A returned field or matrix does not match the expected grid.
    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A volume was built from inconsistent parts.
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// The run was cancelled or its deadline passed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Numerical instability detected.
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

/// Payload-free classification of a [`RegistrationError`], used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IncompatibleSpace,
    ConvergenceFailure,
    NonInvertible,
    Inference,
    GeometryMismatch,
    InvalidConfiguration,
    InvalidVolume,
    Cancelled,
    NumericalInstability,
    ShapeMismatch,
}

impl RegistrationError {
    /// Create an incompatible space error.
    pub fn incompatible_space(expected: &CoordinateSpace, found: &CoordinateSpace) -> Self {
        Self::IncompatibleSpace {
            expected: expected.clone(),
            found: found.clone(),
        }
    }

    /// Create a convergence failure error.
    pub fn convergence_failure(msg: impl Into<String>) -> Self {
        Self::ConvergenceFailure(msg.into())
    }

    /// Create a non-invertible error.
    pub fn non_invertible(msg: impl Into<String>) -> Self {
        Self::NonInvertible(msg.into())
    }

    /// Create an inference error.
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a geometry mismatch error.
    pub fn geometry_mismatch(msg: impl Into<String>) -> Self {
        Self::GeometryMismatch(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid volume error.
    pub fn invalid_volume(msg: impl Into<String>) -> Self {
        Self::InvalidVolume(msg.into())
    }

    /// Create a cancellation error.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a numerical instability error.
    pub fn numerical_instability(msg: impl Into<String>) -> Self {
        Self::NumericalInstability(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IncompatibleSpace { .. } => ErrorKind::IncompatibleSpace,
            Self::ConvergenceFailure(_) => ErrorKind::ConvergenceFailure,
            Self::NonInvertible(_) => ErrorKind::NonInvertible,
            Self::Inference(_) => ErrorKind::Inference,
            Self::GeometryMismatch(_) => ErrorKind::GeometryMismatch,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::InvalidVolume(_) => ErrorKind::InvalidVolume,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::NumericalInstability(_) => ErrorKind::NumericalInstability,
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
        }
    }

    /// Whether a relaxed retry of the same step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConvergenceFailure(_) | Self::Inference(_))
    }

    /// Whether the error aborts the whole run rather than one step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleSpace { .. }
                | Self::GeometryMismatch(_)
                | Self::InvalidConfiguration(_)
                | Self::InvalidVolume(_)
                | Self::Cancelled(_)
                | Self::ShapeMismatch { .. }
        )
    }
}

impl From<TransformError> for RegistrationError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::IncompatibleSpace { expected, found } => Self::IncompatibleSpace { expected, found },
            TransformError::NonInvertible(msg) => Self::NonInvertible(msg),
            TransformError::GeometryMismatch(msg) => Self::GeometryMismatch(msg),
            TransformError::InvalidVolume(msg) => Self::InvalidVolume(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistrationError::convergence_failure("200 iterations");
        assert_eq!(err.to_string(), "Convergence failure: 200 iterations");
    }

    #[test]
    fn test_shape_mismatch() {
        let err = RegistrationError::ShapeMismatch {
            expected: vec![10, 10, 10],
            actual: vec![5, 5, 5],
        };
        let err_str = err.to_string();
        assert!(err_str.contains("expected"));
        assert!(err_str.contains("got"));
    }

    #[test]
    fn test_classification() {
        assert!(RegistrationError::convergence_failure("x").is_retryable());
        assert!(RegistrationError::inference("x").is_retryable());
        assert!(!RegistrationError::inference("x").is_fatal());
        assert!(RegistrationError::geometry_mismatch("x").is_fatal());
        assert!(RegistrationError::cancelled("x").is_fatal());

        let nonfatal = RegistrationError::non_invertible("x");
        assert!(!nonfatal.is_fatal() && !nonfatal.is_retryable());
    }

    #[test]
    fn test_from_transform_error() {
        let err: RegistrationError =
            TransformError::incompatible_space(&CoordinateSpace::new("a"), &CoordinateSpace::new("b")).into();
        assert_eq!(err.kind(), ErrorKind::IncompatibleSpace);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ConvergenceFailure).unwrap();
        assert_eq!(json, "\"convergence_failure\"");
    }
}
