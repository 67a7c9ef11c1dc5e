//! Normalized Cross Correlation (NCC) metric implementation.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::trait_::Metric;

/// Normalized Cross Correlation Metric.
///
/// Weighted zero-normalized cross correlation of the two sample sets,
/// returned negated so that a perfect linear relationship gives `-1`.
/// Insensitive to global intensity scale and offset.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedCrossCorrelation {
    epsilon: f64,
}

impl NormalizedCrossCorrelation {
    pub fn new() -> Self {
        Self { epsilon: 1e-10 }
    }
}

impl Default for NormalizedCrossCorrelation {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Metric<B> for NormalizedCrossCorrelation {
    fn forward(&self, fixed: Tensor<B, 1>, moving: Tensor<B, 1>, weights: Tensor<B, 1>) -> Tensor<B, 1> {
        // Expanded sums keep everything as [1] tensors:
        // cov = Σwfm - (Σwf)(Σwm)/Σw, var = Σwx² - (Σwx)²/Σw
        let total = weights.clone().sum();
        let wf = fixed.clone() * weights.clone();
        let wm = moving.clone() * weights;

        let sum_f = wf.clone().sum();
        let sum_m = wm.clone().sum();
        let sum_fm = (wf.clone() * moving.clone()).sum();
        let sum_ff = (wf * fixed).sum();
        let sum_mm = (wm * moving).sum();

        let cov = sum_fm - sum_f.clone() * sum_m.clone() / total.clone();
        let var_f = sum_ff - sum_f.powf_scalar(2.0) / total.clone();
        let var_m = sum_mm - sum_m.powf_scalar(2.0) / total;

        let denom = (var_f * var_m).add_scalar(self.epsilon).sqrt();
        (cov / denom).neg()
    }

    fn name(&self) -> &'static str {
        "NormalizedCrossCorrelation"
    }
}
