//! Metric implementations.
//!
//! This module contains the similarity metrics used to drive intensity-based
//! registration.

pub mod trait_;
pub mod mse;
pub mod ncc;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub use mse::MeanSquaredError;
pub use ncc::NormalizedCrossCorrelation;
pub use trait_::{scalar_value, Metric};

/// Metric selection in estimator configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Mean squared intensity difference; same-modality images.
    #[default]
    Mse,
    /// Negated normalized cross correlation; tolerates linear intensity changes.
    Ncc,
}

impl MetricKind {
    pub fn forward<B: Backend>(self, fixed: Tensor<B, 1>, moving: Tensor<B, 1>, weights: Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            MetricKind::Mse => MeanSquaredError.forward(fixed, moving, weights),
            MetricKind::Ncc => NormalizedCrossCorrelation::new().forward(fixed, moving, weights),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Mse => "mse",
            MetricKind::Ncc => "ncc",
        }
    }
}
