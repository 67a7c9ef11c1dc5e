//! Nearest neighbor interpolation implementation.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use super::trait_::Interpolator;

/// Nearest Neighbor Interpolator.
///
/// Rounds to the nearest integer index and copies the sample, so it never
/// produces a value absent from the source. Used for label maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborInterpolator;

impl NearestNeighborInterpolator {
    /// Create a new nearest neighbor interpolator.
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Interpolator<B> for NearestNeighborInterpolator {
    fn interpolate(&self, data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
        let [d0, d1, d2] = data.dims();
        let n = indices.dims()[0];

        let i = indices.clone().slice([0..n, 0..1]).squeeze::<1>(1);
        let j = indices.clone().slice([0..n, 1..2]).squeeze::<1>(1);
        let k = indices.slice([0..n, 2..3]).squeeze::<1>(1);

        // Round to nearest integer and clamp
        let i = i.round().clamp(0.0, (d0 - 1) as f64).int();
        let j = j.round().clamp(0.0, (d1 - 1) as f64).int();
        let k = k.round().clamp(0.0, (d2 - 1) as f64).int();

        // Strides for [n0, n1, n2]
        let idx = i * (d1 * d2) as i32 + j * d2 as i32 + k;
        let flat = data.clone().reshape([d0 * d1 * d2]);
        flat.gather(0, idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn volume(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 3> {
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        Tensor::from_data(TensorData::new(values, [2, 3, 4]), device)
    }

    #[test]
    fn test_nearest_at_grid_points() {
        let device = Default::default();
        let data = volume(&device);
        let indices = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0, 0.0], [1.0, 2.0, 3.0], [0.0, 1.0, 2.0]], &device);
        let values = NearestNeighborInterpolator::new()
            .interpolate(&data, indices)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(values, vec![0.0, 23.0, 6.0]);
    }

    #[test]
    fn test_nearest_rounding_and_clamp() {
        let device = Default::default();
        let data = volume(&device);
        // 0.4 rounds down, 0.6 rounds up; -3 clamps to 0, 9 clamps to 3.
        let indices = Tensor::<TestBackend, 2>::from_floats([[0.4, 0.6, 0.4], [-3.0, 0.0, 9.0]], &device);
        let values = NearestNeighborInterpolator::new()
            .interpolate(&data, indices)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(values, vec![4.0, 3.0]);
    }
}
