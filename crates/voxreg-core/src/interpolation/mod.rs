//! Interpolation types and operations.
//!
//! This module provides the interpolation policies used when sampling a
//! volume at continuous indices.

pub mod trait_;
pub mod linear;
pub mod nearest;
pub mod bspline;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub use bspline::BSplineInterpolator;
pub use linear::LinearInterpolator;
pub use nearest::NearestNeighborInterpolator;
pub use trait_::Interpolator;

/// Interpolation policy for resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
    /// Cubic B-spline.
    Spline,
}

impl Interpolation {
    /// Sample `data` at `[N, 3]` continuous indices.
    pub fn sample<B: Backend>(self, data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
        match self {
            Interpolation::Nearest => NearestNeighborInterpolator.interpolate(data, indices),
            Interpolation::Linear => LinearInterpolator.interpolate(data, indices),
            Interpolation::Spline => BSplineInterpolator.interpolate(data, indices),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Linear => "linear",
            Interpolation::Spline => "spline",
        }
    }
}
