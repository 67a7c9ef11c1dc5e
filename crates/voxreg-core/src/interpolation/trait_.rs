//! Interpolator trait for sampling volumes at continuous indices.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

/// Interpolator trait for sampling values at continuous coordinates.
///
/// Indices follow the tensor axis order: column `a` of `indices` addresses
/// axis `a` of `data`. Indices outside `[0, n - 1]` are clamped to the
/// border; callers decide what counts as out of bounds.
///
/// # Type Parameters
/// * `B` - The Burn backend
pub trait Interpolator<B: Backend> {
    /// Interpolate values from a volume at given continuous indices.
    ///
    /// # Arguments
    /// * `data` - The source volume `[n0, n1, n2]`
    /// * `indices` - The indices at which to interpolate `[N, 3]`
    ///
    /// # Returns
    /// Tensor of sampled values `[N]`
    fn interpolate(&self, data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1>;
}
