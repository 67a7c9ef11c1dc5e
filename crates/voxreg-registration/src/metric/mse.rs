//! Mean Squared Error metric implementation.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::trait_::Metric;

/// Mean Squared Error Metric.
///
/// MSE = Σ w (M - F)² / Σ w
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Metric<B> for MeanSquaredError {
    fn forward(&self, fixed: Tensor<B, 1>, moving: Tensor<B, 1>, weights: Tensor<B, 1>) -> Tensor<B, 1> {
        let diff = moving - fixed;
        let total = weights.clone().sum();
        (diff.powf_scalar(2.0) * weights).sum() / total
    }

    fn name(&self) -> &'static str {
        "MeanSquaredError"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::scalar_value;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_mse_values() {
        let device = Default::default();
        let fixed = Tensor::<B, 1>::from_floats([0.0, 1.0, 2.0, 3.0], &device);
        let moving = Tensor::<B, 1>::from_floats([0.0, 1.0, 4.0, 100.0], &device);

        let all = Tensor::<B, 1>::ones([4], &device);
        let loss = scalar_value(MeanSquaredError.forward(fixed.clone(), fixed.clone(), all)).unwrap();
        assert!(loss < 1e-12, "MSE should be 0 for identical samples, got {}", loss);

        // The outlier is masked out: (0 + 0 + 4) / 3.
        let weights = Tensor::<B, 1>::from_floats([1.0, 1.0, 1.0, 0.0], &device);
        let loss = scalar_value(MeanSquaredError.forward(fixed, moving, weights)).unwrap();
        assert!((loss - 4.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_overlap_is_an_error() {
        let device = Default::default();
        let v = Tensor::<B, 1>::from_floats([1.0, 2.0], &device);
        let none = Tensor::<B, 1>::zeros([2], &device);
        assert!(scalar_value(MeanSquaredError.forward(v.clone(), v, none)).is_err());
    }
}
