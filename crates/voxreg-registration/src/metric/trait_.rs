//! Metric trait for image similarity measurement.
//!
//! Metrics compare intensities sampled at the same fixed-grid points and
//! return a loss that decreases as the alignment improves.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use crate::error::{RegistrationError, Result};

/// Weighted dissimilarity between two sets of samples.
///
/// All inputs are `[N]` tensors. `weights` restricts the comparison to
/// overlapping (and, when a mask is supplied, masked-in) points; a weight of
/// zero removes a point entirely.
pub trait Metric<B: Backend> {
    /// Loss as a `[1]` tensor; lower is better.
    fn forward(&self, fixed: Tensor<B, 1>, moving: Tensor<B, 1>, weights: Tensor<B, 1>) -> Tensor<B, 1>;

    fn name(&self) -> &'static str;
}

/// Read a `[1]` loss tensor back to the host.
///
/// Fails with `NumericalInstability` on NaN or infinity, which is what an
/// empty overlap produces.
pub fn scalar_value<B: Backend>(loss: Tensor<B, 1>) -> Result<f64> {
    let value = loss.into_scalar().elem::<f64>();
    if !value.is_finite() {
        return Err(RegistrationError::numerical_instability(format!(
            "metric evaluated to {} (no overlap between volumes?)",
            value
        )));
    }
    Ok(value)
}
