use burn::tensor::backend::Backend;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData};

use crate::error::Result;
use crate::geometry::Spacing3;
use crate::image::Volume;

/// Gaussian smoothing filter.
///
/// Applies separable 1D convolutions along each axis. Sigmas are in physical
/// units and converted to voxels with the volume spacing. Border voxels are
/// renormalised by the kernel mass that falls inside the grid, so smoothing
/// a constant volume leaves it unchanged.
#[derive(Debug, Clone)]
pub struct GaussianFilter {
    sigmas: [f64; 3],
    max_kernel_width: usize,
}

impl GaussianFilter {
    /// Create a new Gaussian filter with per-axis standard deviations (physical units).
    pub fn new(sigmas: [f64; 3]) -> Self {
        Self {
            sigmas,
            max_kernel_width: 33,
        }
    }

    /// Same sigma along every axis.
    pub fn isotropic(sigma: f64) -> Self {
        Self::new([sigma; 3])
    }

    /// Set the maximum kernel width (radius * 2 + 1).
    pub fn with_max_kernel_width(mut self, width: usize) -> Self {
        self.max_kernel_width = width.max(1);
        self
    }

    /// Whether the filter would change anything.
    pub fn is_noop(&self) -> bool {
        self.sigmas.iter().all(|&s| s <= 1e-6)
    }

    /// Apply the filter to a volume.
    pub fn apply<B: Backend>(&self, volume: &Volume<B>) -> Result<Volume<B>> {
        let data = self.apply_tensor(volume.data().clone(), volume.geometry().spacing());
        volume.with_data(data)
    }

    /// Apply the filter to a tensor directly.
    ///
    /// # Arguments
    /// * `input` - Input tensor `[n0, n1, n2]`
    /// * `spacing` - Physical spacing of the data (used to size the kernel)
    pub fn apply_tensor<B: Backend>(&self, input: Tensor<B, 3>, spacing: &Spacing3) -> Tensor<B, 3> {
        let mut data = input;
        let device = data.device();

        for axis in 0..3 {
            let sigma = self.sigmas[axis];
            if sigma <= 1e-6 || data.dims()[axis] < 2 {
                continue;
            }

            let voxel_sigma = sigma / spacing[axis];
            let radius = (3.0 * voxel_sigma).ceil() as usize;
            let width = (2 * radius + 1).min(self.max_kernel_width | 1);
            let radius = (width - 1) / 2;
            if radius == 0 {
                continue;
            }

            let kernel = generate_kernel(voxel_sigma, radius);
            let kernel = Tensor::<B, 1>::from_data(TensorData::new(kernel, [width]), &device);

            let ones = Tensor::<B, 3>::ones(data.dims(), &device);
            let smoothed = convolve_axis(data, kernel.clone(), axis);
            let mass = convolve_axis(ones, kernel, axis);
            data = smoothed / mass;
        }
        data
    }
}

/// Normalised, sampled Gaussian of the given radius.
fn generate_kernel(sigma: f64, radius: usize) -> Vec<f32> {
    let two_sigma2 = 2.0 * sigma * sigma;
    let raw: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / two_sigma2).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| (v / sum) as f32).collect()
}

/// Zero-padded 1D convolution of every line along `axis`.
fn convolve_axis<B: Backend>(input: Tensor<B, 3>, kernel: Tensor<B, 1>, axis: usize) -> Tensor<B, 3> {
    // Move the target axis last and fold the others into the batch.
    let moved = input.swap_dims(axis, 2);
    let [a, b, len] = moved.dims();
    let lines = moved.reshape([a * b, 1, len]);

    let kernel_size = kernel.dims()[0];
    let weight = kernel.reshape([1, 1, kernel_size]);
    let options = ConvOptions::new([1], [kernel_size / 2], [1], 1);
    let out = burn::tensor::module::conv1d(lines, weight, None, options);

    out.reshape([a, b, len]).swap_dims(axis, 2)
}
